use crate::{
    transport::{
        connection::{KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        SipAddr, SipConnection, TransportEvent, TransportSender,
    },
    Error, Result,
};
use bytes::{Buf, BytesMut};
use rsip::SipMessage;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, warn};

pub(super) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages out of a byte stream.
///
/// A message is complete once the empty line terminating the headers has
/// arrived plus as many body bytes as Content-Length announces. Bare CRLF
/// sequences between messages are keep-alives, not framing errors.
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }

    /// Content-Length (or its compact form `l`) from a raw header block,
    /// defaulting to zero when absent.
    fn content_length(headers: &[u8]) -> usize {
        for line in headers.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let Some(colon) = line.iter().position(|b| *b == b':') else {
                continue;
            };
            let name = String::from_utf8_lossy(&line[..colon]);
            let name = name.trim();
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
                let value = String::from_utf8_lossy(&line[colon + 1..]);
                if let Ok(len) = value.trim().parse::<usize>() {
                    return len;
                }
            }
        }
        0
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum StreamItem {
    Message(SipMessage),
    KeepaliveRequest,
    KeepaliveResponse,
}

impl Decoder for SipCodec {
    type Item = StreamItem;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= KEEPALIVE_REQUEST.len() && &src[..KEEPALIVE_REQUEST.len()] == KEEPALIVE_REQUEST {
            src.advance(KEEPALIVE_REQUEST.len());
            return Ok(Some(StreamItem::KeepaliveRequest));
        }
        if src.len() >= KEEPALIVE_RESPONSE.len()
            && &src[..KEEPALIVE_RESPONSE.len()] == KEEPALIVE_RESPONSE
        {
            src.advance(KEEPALIVE_RESPONSE.len());
            return Ok(Some(StreamItem::KeepaliveResponse));
        }

        let Some(header_end) = src
            .windows(KEEPALIVE_REQUEST.len())
            .position(|window| window == KEEPALIVE_REQUEST)
        else {
            if src.len() > MAX_SIP_MESSAGE_SIZE {
                return Err(Error::SipMessageError("sip message too large".to_string()));
            }
            return Ok(None);
        };

        let body_len = Self::content_length(&src[..header_end]);
        let total = header_end + KEEPALIVE_REQUEST.len() + body_len;
        if total > MAX_SIP_MESSAGE_SIZE {
            return Err(Error::SipMessageError("sip message too large".to_string()));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let result = SipMessage::try_from(&src[..total]);
        src.advance(total);
        match result {
            Ok(msg) => Ok(Some(StreamItem::Message(msg))),
            Err(e) => Err(Error::SipMessageError(format!(
                "failed to parse sip message: {}",
                e
            ))),
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        Ok(())
    }
}

/// The shared half of every stream transport: a read half consumed by the
/// serve loop and a write half behind a lock.
pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        send_to_stream(&self.write_half, msg).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        send_raw_to_stream(&self.write_half, data).await
    }

    pub async fn serve_loop(&self, sender: TransportSender, connection: SipConnection) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                error!("read half already taken for {}", self.remote_addr);
                return Ok(());
            }
        };

        let remote_addr = self.remote_addr.clone();
        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(MAX_SIP_MESSAGE_SIZE);
        let mut read_buf = vec![0u8; 4096];

        loop {
            use tokio::io::AsyncReadExt;
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    info!("connection closed by peer: {}", remote_addr);
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(StreamItem::Message(msg))) => {
                                debug!("received message from {}", remote_addr);
                                let msg = SipConnection::update_msg_received(
                                    msg,
                                    remote_addr.get_socketaddr()?,
                                    remote_addr.transport(),
                                )?;
                                sender.send(TransportEvent::Incoming(
                                    msg,
                                    connection.clone(),
                                    remote_addr.clone(),
                                ))?;
                            }
                            Ok(Some(StreamItem::KeepaliveRequest)) => {
                                self.send_raw(KEEPALIVE_RESPONSE).await?;
                            }
                            Ok(Some(StreamItem::KeepaliveResponse)) => {}
                            Ok(None) => break,
                            Err(e) => {
                                // Framing survived, the payload did not;
                                // drop the message and keep reading.
                                warn!("error decoding message from {}: {}", remote_addr, e);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("error reading from {}: {}", remote_addr, e);
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.shutdown().await?;
        Ok(())
    }
}

/// Behavior common to every stream transport connection.
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn get_addr(&self) -> &SipAddr;
    async fn send_message(&self, msg: SipMessage) -> Result<()>;
    async fn send_raw(&self, data: &[u8]) -> Result<()>;
    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub async fn send_to_stream<W>(write_half: &Mutex<W>, msg: SipMessage) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    send_raw_to_stream(write_half, msg.to_string().as_bytes()).await
}

pub async fn send_raw_to_stream<W>(write_half: &Mutex<W>, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut lock = write_half.lock().await;
    lock.write_all(data).await?;
    lock.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS: &str = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bK776asdhds\r\n\
        From: <sip:alice@example.com>;tag=1928301774\r\n\
        To: <sip:bob@example.com>\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 63104 OPTIONS\r\n\
        Content-Length: 0\r\n\
        \r\n";

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&OPTIONS.as_bytes()[..40]);
        assert!(matches!(codec.decode(&mut buf), Ok(None)));

        buf.extend_from_slice(&OPTIONS.as_bytes()[40..]);
        match codec.decode(&mut buf) {
            Ok(Some(StreamItem::Message(SipMessage::Request(req)))) => {
                assert_eq!(req.method, rsip::Method::Options);
            }
            other => panic!("unexpected decode result: {:?}", other.map(|_| ())),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_body() {
        let msg = "MESSAGE sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bK74bf9\r\n\
            From: <sip:alice@example.com>;tag=9fxced76sl\r\n\
            To: <sip:bob@example.com>\r\n\
            Call-ID: 3848276298220188511\r\n\
            CSeq: 1 MESSAGE\r\n\
            Content-Type: text/plain\r\n\
            Content-Length: 12\r\n\
            \r\n\
            Hello there!";
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();

        // Everything except the last four body bytes.
        buf.extend_from_slice(&msg.as_bytes()[..msg.len() - 4]);
        assert!(matches!(codec.decode(&mut buf), Ok(None)));

        buf.extend_from_slice(&msg.as_bytes()[msg.len() - 4..]);
        match codec.decode(&mut buf) {
            Ok(Some(StreamItem::Message(SipMessage::Request(req)))) => {
                assert_eq!(req.body, b"Hello there!".to_vec());
            }
            other => panic!("unexpected decode result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_decode_keepalives() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\r\n\r\n\r\n");

        assert!(matches!(
            codec.decode(&mut buf),
            Ok(Some(StreamItem::KeepaliveRequest))
        ));
        assert!(matches!(
            codec.decode(&mut buf),
            Ok(Some(StreamItem::KeepaliveResponse))
        ));
        assert!(matches!(codec.decode(&mut buf), Ok(None)));
    }

    #[test]
    fn test_two_messages_in_one_chunk() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(OPTIONS.as_bytes());
        buf.extend_from_slice(OPTIONS.as_bytes());

        for _ in 0..2 {
            assert!(matches!(
                codec.decode(&mut buf),
                Ok(Some(StreamItem::Message(_)))
            ));
        }
        assert!(buf.is_empty());
    }
}
