use super::{
    stream::{StreamConnection, StreamConnectionInner},
    SipAddr, SipConnection, TransportEvent, TransportSender,
};
use crate::Result;
use rsip::SipMessage;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct TcpInner {
    pub stream: StreamConnectionInner<OwnedReadHalf, OwnedWriteHalf>,
    refs: Mutex<usize>,
}

/// One established TCP connection. Identified in the pool by its peer
/// address; framing is handled by [`SipCodec`](super::stream::SipCodec).
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<TcpInner>,
}

impl TcpConnection {
    pub async fn connect(remote: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(remote).await?;
        info!("tcp connected {} -> {}", stream.local_addr()?, remote);
        Self::from_stream(stream)
    }

    /// Wrap an accepted or dialed stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let local_addr = SipAddr::new(rsip::transport::Transport::Tcp, stream.local_addr()?.into());
        let remote_addr = SipAddr::new(rsip::transport::Transport::Tcp, stream.peer_addr()?.into());
        let (read_half, write_half) = stream.into_split();
        Ok(TcpConnection {
            inner: Arc::new(TcpInner {
                stream: StreamConnectionInner::new(local_addr, remote_addr, read_half, write_half),
                refs: Mutex::new(1),
            }),
        })
    }

    /// The pool identity of this connection: the peer address.
    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.stream.remote_addr
    }

    pub fn local_addr(&self) -> &SipAddr {
        &self.inner.stream.local_addr
    }

    pub fn add_ref(&self) {
        *self.inner.refs.lock().unwrap() += 1;
    }

    pub fn try_close(&self) -> usize {
        let mut refs = self.inner.refs.lock().unwrap();
        *refs = refs.saturating_sub(1);
        let remaining = *refs;
        drop(refs);
        if remaining == 0 {
            let connection = self.clone();
            tokio::spawn(async move {
                connection.inner.stream.close().await.ok();
            });
        }
        remaining
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.stream.send_message(msg).await
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        self.inner
            .stream
            .serve_loop(sender, SipConnection::Tcp(self.clone()))
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.stream.close().await
    }
}

#[async_trait::async_trait]
impl StreamConnection for TcpConnection {
    fn get_addr(&self) -> &SipAddr {
        TcpConnection::get_addr(self)
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        TcpConnection::send_message(self, msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.stream.send_raw(data).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        TcpConnection::serve_loop(self, sender).await
    }

    async fn close(&self) -> Result<()> {
        TcpConnection::close(self).await
    }
}

struct TcpListenerInner {
    local_addr: SipAddr,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    cancel_token: CancellationToken,
}

/// A bound TCP listener. Accepted streams surface as
/// [`TransportEvent::New`]; the endpoint registers and serves them.
#[derive(Clone)]
pub struct TcpListenerConnection {
    inner: Arc<TcpListenerInner>,
}

impl TcpListenerConnection {
    pub async fn create_listener(local: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let local_addr =
            SipAddr::new(rsip::transport::Transport::Tcp, listener.local_addr()?.into());
        info!("created tcp listener {}", local_addr);
        Ok(TcpListenerConnection {
            inner: Arc::new(TcpListenerInner {
                local_addr,
                listener: tokio::sync::Mutex::new(Some(listener)),
                cancel_token: CancellationToken::new(),
            }),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let listener = match self.inner.listener.lock().await.take() {
            Some(listener) => listener,
            None => return Ok(()),
        };
        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!("tcp listener {} closed", self.inner.local_addr);
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    info!("tcp accepted {} on {}", peer, self.inner.local_addr);
                    match TcpConnection::from_stream(stream) {
                        Ok(connection) => {
                            sender.send(TransportEvent::New(SipConnection::Tcp(connection)))?;
                        }
                        Err(e) => warn!("error wrapping accepted stream from {}: {}", peer, e),
                    }
                }
                Err(e) => {
                    warn!("tcp accept error on {}: {}", self.inner.local_addr, e);
                    return Err(e.into());
                }
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.cancel_token.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_tcp_accept_and_frame() {
        let listener = TcpListenerConnection::create_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let listen_addr = listener.get_addr().get_socketaddr().unwrap();

        let (sender, mut receiver) = unbounded_channel();
        let serve_listener = listener.clone();
        let accept_sender = sender.clone();
        tokio::spawn(async move { serve_listener.serve_loop(accept_sender).await });

        let client = TcpConnection::connect(listen_addr).await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out")
            .expect("closed");
        let TransportEvent::New(accepted) = accepted else {
            panic!("expected new connection event");
        };
        let serve_accepted = accepted.clone();
        let reader_sender = sender.clone();
        tokio::spawn(async move { serve_accepted.serve_loop(reader_sender).await });

        let options = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bK776asdhds\r\n\
            From: <sip:alice@example.com>;tag=1928301774\r\n\
            To: <sip:bob@example.com>\r\n\
            Call-ID: a84b4c76e66710\r\n\
            CSeq: 63104 OPTIONS\r\n\
            Content-Length: 0\r\n\r\n";
        client
            .send_message(SipMessage::try_from(options).unwrap())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out")
            .expect("closed");
        match event {
            TransportEvent::Incoming(msg, connection, _) => {
                assert!(matches!(msg, SipMessage::Request(_)));
                assert!(connection.is_reliable());
            }
            _ => panic!("expected incoming message"),
        }
    }
}
