use super::{
    channel::ChannelConnection,
    tcp::{TcpConnection, TcpListenerConnection},
    udp::UdpConnection,
};
use super::{SipAddr, TransportSender};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::SipMessage;
use std::net::SocketAddr;
use tracing::info;

/// Double CRLF: a keep-alive probe on stream transports.
pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
/// Single CRLF: the reply to a keep-alive probe.
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Conservative UDP datagram budget. Writes are refused, not truncated,
/// once the serialized message exceeds `UDP_MTU - UDP_MTU_RESERVE`.
pub const UDP_MTU: usize = 1500;
pub const UDP_MTU_RESERVE: usize = 200;

/// One transport connection.
///
/// `SipConnection` is the handle transactions hold: it can write a message,
/// report its local address and reliability, and be released via
/// [`try_close`](SipConnection::try_close) when the transaction ends. All
/// variants are cheap to clone; the underlying socket is shared.
#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    TcpListener(TcpListenerConnection),
    #[cfg(feature = "rustls")]
    Tls(super::tls::TlsConnection),
    #[cfg(feature = "websocket")]
    WebSocket(super::websocket::WebSocketConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    /// The address identifying this connection in the pool: the local bind
    /// address for datagram sockets and listeners, the peer address for
    /// streams.
    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(c) => c.get_addr(),
            SipConnection::Tcp(c) => c.get_addr(),
            SipConnection::TcpListener(c) => c.get_addr(),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.get_addr(),
            #[cfg(feature = "websocket")]
            SipConnection::WebSocket(c) => c.get_addr(),
            SipConnection::Channel(c) => c.get_addr(),
        }
    }

    /// The local address of the connection. Datagram sockets, listeners
    /// and the channel transport are identified by their bind address
    /// already, so it coincides with [`get_addr`](SipConnection::get_addr)
    /// for those.
    pub fn local_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Tcp(c) => c.local_addr(),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.local_addr(),
            #[cfg(feature = "websocket")]
            SipConnection::WebSocket(c) => c.local_addr(),
            _ => self.get_addr(),
        }
    }

    pub fn transport(&self) -> rsip::transport::Transport {
        self.get_addr().transport()
    }

    /// Whether retransmit timers can stay off for this connection.
    pub fn is_reliable(&self) -> bool {
        super::is_reliable(self.transport())
    }

    /// Write a message. `destination` is consulted by datagram transports
    /// only; streams always write to their peer.
    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.send_message(msg, destination).await,
            SipConnection::Tcp(c) => c.send_message(msg).await,
            SipConnection::TcpListener(c) => Err(Error::TransportLayerError(
                "cannot send on a listener".to_string(),
                c.get_addr().clone(),
            )),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.send_message(msg).await,
            #[cfg(feature = "websocket")]
            SipConnection::WebSocket(c) => c.send_message(msg).await,
            SipConnection::Channel(c) => c.send_message(msg).await,
        }
    }

    /// Run the reader loop, feeding parsed messages into `sender`. Returns
    /// when the connection closes or its cancel token fires.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.serve_loop(sender).await,
            SipConnection::Tcp(c) => c.serve_loop(sender).await,
            SipConnection::TcpListener(c) => c.serve_loop(sender).await,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.serve_loop(sender).await,
            #[cfg(feature = "websocket")]
            SipConnection::WebSocket(c) => c.serve_loop(sender).await,
            SipConnection::Channel(c) => c.serve_loop(sender).await,
        }
    }

    /// Take an additional reference for a transaction about to hold this
    /// connection.
    pub fn add_ref(&self) {
        match self {
            SipConnection::Udp(c) => c.add_ref(),
            SipConnection::Tcp(c) => c.add_ref(),
            SipConnection::TcpListener(_) => {}
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.add_ref(),
            #[cfg(feature = "websocket")]
            SipConnection::WebSocket(c) => c.add_ref(),
            SipConnection::Channel(c) => c.add_ref(),
        }
    }

    /// Drop one reference, closing the connection when the count reaches
    /// zero. Listener connections stay open regardless; they only close on
    /// explicit shutdown. Returns the remaining count.
    pub fn try_close(&self) -> usize {
        match self {
            SipConnection::Udp(c) => c.try_close(),
            SipConnection::Tcp(c) => c.try_close(),
            SipConnection::TcpListener(_) => 1,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.try_close(),
            #[cfg(feature = "websocket")]
            SipConnection::WebSocket(c) => c.try_close(),
            SipConnection::Channel(c) => c.try_close(),
        }
    }

    /// Close unconditionally.
    pub async fn close(&self) -> Result<()> {
        info!("closing connection {}", self.get_addr());
        match self {
            SipConnection::Udp(c) => c.close().await,
            SipConnection::Tcp(c) => c.close().await,
            SipConnection::TcpListener(c) => c.close().await,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.close().await,
            #[cfg(feature = "websocket")]
            SipConnection::WebSocket(c) => c.close().await,
            SipConnection::Channel(c) => c.close().await,
        }
    }

    /// Stamp the RFC 3581 `received`/`rport` parameters onto the top Via of
    /// an incoming request, recording where the packet actually came from.
    /// Responses pass through untouched.
    pub fn update_msg_received(
        msg: SipMessage,
        addr: SocketAddr,
        transport: rsip::transport::Transport,
    ) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                Self::patch_via_received(&mut req, addr)?;
                let _ = transport;
                Ok(req.into())
            }
            SipMessage::Response(resp) => Ok(resp.into()),
        }
    }

    fn patch_via_received(req: &mut rsip::Request, addr: SocketAddr) -> Result<()> {
        let via = req.via_header_mut()?;
        let mut typed = via.typed()?;
        let mut has_rport = false;
        typed.params.retain(|param| match param {
            rsip::Param::Received(_) => false,
            rsip::Param::Other(name, _) if name.value().eq_ignore_ascii_case("rport") => {
                has_rport = true;
                false
            }
            _ => true,
        });
        typed.params.push(rsip::Param::Received(rsip::param::Received::new(
            addr.ip().to_string(),
        )));
        if has_rport {
            typed.params.push(rsip::Param::Other(
                rsip::param::OtherParam::new("rport"),
                Some(rsip::param::OtherParamValue::new(addr.port().to_string())),
            ));
        }
        *via = typed.into();
        Ok(())
    }
}

impl std::fmt::Display for SipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_addr())
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<TcpListenerConnection> for SipConnection {
    fn from(connection: TcpListenerConnection) -> Self {
        SipConnection::TcpListener(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}
