use super::{SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::{Error, Result};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rsip::SipMessage;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

pub struct WebSocketInner {
    pub addr: SipAddr,
    local_addr: SipAddr,
    sink: tokio::sync::Mutex<WsSink>,
    source: tokio::sync::Mutex<Option<WsSource>>,
    cancel_token: CancellationToken,
    refs: Mutex<usize>,
}

/// An outbound WebSocket connection (RFC 7118). Each SIP message travels in
/// its own text frame; the `sip` subprotocol is negotiated on connect.
#[derive(Clone)]
pub struct WebSocketConnection {
    inner: Arc<WebSocketInner>,
}

impl WebSocketConnection {
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let secure = remote.transport() == rsip::transport::Transport::Wss;
        let scheme = if secure { "wss" } else { "ws" };
        let url = format!("{}://{}", scheme, remote.addr);

        let mut request = url
            .into_client_request()
            .map_err(|e| Error::TransportLayerError(e.to_string(), remote.clone()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            http::HeaderValue::from_static("sip"),
        );

        let (stream, _) = connect_async(request).await?;
        info!("websocket connected {}", remote);
        let transport = if secure {
            rsip::transport::Transport::Wss
        } else {
            rsip::transport::Transport::Ws
        };
        // The bind address sits under the websocket (and TLS) framing.
        let local_addr = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.local_addr().ok(),
            MaybeTlsStream::Rustls(tls) => tls.get_ref().0.local_addr().ok(),
            _ => None,
        }
        .map(|local| SipAddr::new(transport, local.into()))
        .unwrap_or_else(|| SipAddr::new(transport, remote.addr.clone()));
        let (sink, source) = stream.split();
        Ok(WebSocketConnection {
            inner: Arc::new(WebSocketInner {
                addr: SipAddr::new(transport, remote.addr.clone()),
                local_addr,
                sink: tokio::sync::Mutex::new(sink),
                source: tokio::sync::Mutex::new(Some(source)),
                cancel_token: CancellationToken::new(),
                refs: Mutex::new(1),
            }),
        })
    }

    /// The pool identity of this connection: the peer address.
    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub fn local_addr(&self) -> &SipAddr {
        &self.inner.local_addr
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
            self.inner.cancel_token.cancel();
        }
        remaining
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        let mut sink = self.inner.sink.lock().await;
        sink.send(WsMessage::Text(msg.to_string().into())).await?;
        Ok(())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut source = match self.inner.source.lock().await.take() {
            Some(source) => source,
            None => return Ok(()),
        };

        loop {
            let frame = tokio::select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!("websocket connection {} closed", self.inner.addr);
                    return Ok(());
                }
                frame = source.next() => frame,
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            let payload = match frame? {
                WsMessage::Text(text) => text.as_bytes().to_vec(),
                WsMessage::Binary(data) => data.to_vec(),
                WsMessage::Ping(data) => {
                    self.inner.sink.lock().await.send(WsMessage::Pong(data)).await?;
                    continue;
                }
                WsMessage::Close(_) => return Ok(()),
                _ => continue,
            };

            let msg = match SipMessage::try_from(payload.as_slice()) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("error parsing websocket frame from {}: {}", self.inner.addr, e);
                    continue;
                }
            };
            // The peer may be known by domain only; skip the received
            // patch rather than fail the loop.
            let msg = match self.inner.addr.get_socketaddr() {
                Ok(source) => {
                    SipConnection::update_msg_received(msg, source, self.inner.addr.transport())?
                }
                Err(_) => msg,
            };
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::WebSocket(self.clone()),
                self.inner.addr.clone(),
            ))?;
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.cancel_token.cancel();
        let mut sink = self.inner.sink.lock().await;
        sink.send(WsMessage::Close(None)).await.ok();
        Ok(())
    }
}
