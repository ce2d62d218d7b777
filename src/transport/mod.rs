//! SIP Transport Layer.
//!
//! The transport layer owns every [`SipConnection`] the stack knows about
//! and demultiplexes inbound traffic into [`TransportEvent`]s consumed by
//! the endpoint. Outbound, it resolves a target address to an existing
//! connection or creates one on demand.

use crate::{Error, Result};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, RwLock},
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod channel;
pub mod connection;
pub mod stream;
pub mod tcp;
#[cfg(feature = "rustls")]
pub mod tls;
pub mod udp;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use connection::SipConnection;

/// The well-known port for a transport when the message names none.
pub fn default_port(transport: rsip::transport::Transport) -> u16 {
    use rsip::transport::Transport::*;
    match transport {
        Udp | Tcp => 5060,
        Tls => 5061,
        Ws => 80,
        Wss => 443,
        _ => 5060,
    }
}

/// A transport is unreliable only when it is UDP; everything else keeps
/// ordering and delivery and therefore runs without retransmit timers.
pub fn is_reliable(transport: rsip::transport::Transport) -> bool {
    !matches!(transport, rsip::transport::Transport::Udp)
}

/// An address as the SIP layers see it: host/port plus the transport the
/// bytes travel over.
#[derive(Clone, Debug)]
pub struct SipAddr {
    pub r#type: Option<rsip::transport::Transport>,
    pub addr: rsip::HostWithPort,
}

impl SipAddr {
    pub fn new(transport: rsip::transport::Transport, addr: rsip::HostWithPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    /// The transport of this address, defaulting to UDP.
    pub fn transport(&self) -> rsip::transport::Transport {
        self.r#type.unwrap_or(rsip::transport::Transport::Udp)
    }

    /// The socket address, requiring the host to be a literal IP. Domains
    /// must go through [`TransportLayer::lookup`] first.
    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        match &self.addr.host {
            rsip::Host::IpAddr(ip) => {
                let port = self
                    .addr
                    .port
                    .as_ref()
                    .map(|p| *p.value())
                    .unwrap_or_else(|| default_port(self.transport()));
                Ok(SocketAddr::new(*ip, port))
            }
            rsip::Host::Domain(domain) => Err(Error::TransportLayerError(
                format!("unresolved domain {}", domain),
                self.clone(),
            )),
        }
    }
}

impl std::fmt::Display for SipAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.r#type {
            Some(t) => write!(f, "{}://{}", t, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl PartialEq for SipAddr {
    fn eq(&self, other: &Self) -> bool {
        self.r#type == other.r#type && self.addr.to_string() == other.addr.to_string()
    }
}

impl Eq for SipAddr {}

impl std::hash::Hash for SipAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr {
            r#type: None,
            addr: addr.into(),
        }
    }
}

impl TryFrom<&rsip::Uri> for SipAddr {
    type Error = Error;

    fn try_from(uri: &rsip::Uri) -> Result<Self> {
        let transport = uri
            .params
            .iter()
            .find_map(|param| match param {
                rsip::Param::Transport(t) => Some(*t),
                _ => None,
            })
            .or_else(|| match uri.scheme {
                Some(rsip::Scheme::Sips) => Some(rsip::transport::Transport::Tls),
                _ => None,
            });
        Ok(SipAddr {
            r#type: transport,
            addr: uri.host_with_port.clone(),
        })
    }
}

/// Events the transport layer feeds into the endpoint loop.
pub enum TransportEvent {
    /// A parsed message together with the connection it arrived on and the
    /// peer it came from.
    Incoming(rsip::SipMessage, SipConnection, SipAddr),
    /// A connection came into existence (stream accept or outbound dial).
    New(SipConnection),
    /// A connection went away; the pool entry must be dropped.
    Closed(SipConnection),
}

pub type TransportSender = UnboundedSender<TransportEvent>;
pub type TransportReceiver = UnboundedReceiver<TransportEvent>;

/// The first non-loopback interface address, used to advertise a usable
/// local address when a socket is bound to the unspecified address.
pub fn first_non_loopback_interface() -> Result<IpAddr> {
    for iface in get_if_addrs::get_if_addrs()? {
        if !iface.is_loopback() {
            return Ok(iface.ip());
        }
    }
    Err(Error::Error("no non-loopback interface".to_string()))
}

pub struct TransportLayerInner {
    pub cancel_token: CancellationToken,
    /// Connections keyed by remote address, including the alias entries a
    /// UDP listener earns for every peer it talks to.
    connections: RwLock<HashMap<SipAddr, SipConnection>>,
    /// Locally bound connections keyed by their bind address. These never
    /// close on refcount exhaustion.
    listens: RwLock<HashMap<SipAddr, SipConnection>>,
    sender: RwLock<Option<TransportSender>>,
}

/// The connection pool.
///
/// A UDP listener socket doubles as the dial socket for any peer it has
/// talked to, so the pool indexes it under its local bind address *and*
/// every observed remote. This keeps "one socket per local bind" true for
/// both directions, which RFC 3581 `rport`/`received` handling relies on.
#[derive(Clone)]
pub struct TransportLayer {
    pub inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        let inner = TransportLayerInner {
            cancel_token,
            connections: RwLock::new(HashMap::new()),
            listens: RwLock::new(HashMap::new()),
            sender: RwLock::new(None),
        };
        TransportLayer {
            inner: Arc::new(inner),
        }
    }

    /// Install the event sink. The endpoint does this once before serving;
    /// connections created afterwards feed their traffic through it.
    pub fn set_sender(&self, sender: TransportSender) {
        self.inner.sender.write().unwrap().replace(sender);
    }

    fn sender(&self) -> Result<TransportSender> {
        self.inner
            .sender
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Error("transport layer not started".to_string()))
    }

    /// Register a locally bound connection (a listener) and start serving
    /// it once the endpoint loop is up.
    pub fn add_transport(&self, connection: SipConnection) {
        info!("added transport {}", connection.get_addr());
        self.inner
            .listens
            .write()
            .unwrap()
            .insert(connection.get_addr().clone(), connection);
    }

    pub fn del_transport(&self, addr: &SipAddr) {
        self.inner.listens.write().unwrap().remove(addr);
        self.inner
            .connections
            .write()
            .unwrap()
            .retain(|_, c| c.get_addr() != addr);
    }

    /// A connection already associated with `addr`, if any.
    pub fn get_connection(&self, addr: &SipAddr) -> Option<SipConnection> {
        let connections = self.inner.connections.read().unwrap();
        if let Some(connection) = connections.get(addr) {
            return Some(connection.clone());
        }
        drop(connections);
        self.inner.listens.read().unwrap().get(addr).cloned()
    }

    /// Remember that `remote` is reachable through `connection`. For UDP
    /// this records the most recently observed remote of a listener.
    pub(crate) fn bind_remote(&self, remote: SipAddr, connection: SipConnection) {
        self.inner
            .connections
            .write()
            .unwrap()
            .insert(remote, connection);
    }

    pub(crate) fn del_connection(&self, addr: &SipAddr) {
        debug!("removing connection {}", addr);
        self.inner
            .connections
            .write()
            .unwrap()
            .retain(|_, c| c.get_addr() != addr);
    }

    pub fn serve_listens(&self) -> Result<()> {
        let listens = self.inner.listens.read().unwrap().clone();
        for (_, connection) in listens {
            self.serve_connection(connection)?;
        }
        Ok(())
    }

    /// Spawn the reader loop of a connection, unregistering it when the
    /// loop ends.
    pub fn serve_connection(&self, connection: SipConnection) -> Result<()> {
        let sender = self.sender()?;
        let layer = self.clone();
        tokio::spawn(async move {
            let addr = connection.get_addr().clone();
            if let Err(e) = connection.serve_loop(sender.clone()).await {
                warn!("connection {} stopped serving: {}", addr, e);
            }
            layer.del_connection(&addr);
            sender.send(TransportEvent::Closed(connection)).ok();
        });
        Ok(())
    }

    /// Resolve `target` and return a connection for it together with the
    /// resolved destination. UDP reuses a bound listener socket; stream
    /// transports dial when the pool has nothing.
    pub async fn lookup(&self, target: &SipAddr) -> Result<(SipConnection, SipAddr)> {
        let resolved = self.resolve(target).await?;
        let transport = resolved.transport();
        debug!("lookup {} => {}", target, resolved);

        if let Some(connection) = self.get_connection(&resolved) {
            return Ok((connection, resolved));
        }

        match transport {
            rsip::transport::Transport::Udp => {
                // Listener-as-dialer: prefer an already bound socket so the
                // peer's replies land on the address we advertised.
                let listener = {
                    let listens = self.inner.listens.read().unwrap();
                    listens
                        .values()
                        .find(|c| c.transport() == rsip::transport::Transport::Udp)
                        .cloned()
                };
                let connection = match listener {
                    Some(connection) => connection,
                    None => {
                        let connection = udp::UdpConnection::create_connection(
                            "0.0.0.0:0".parse()?,
                            false,
                        )
                        .await?;
                        let connection = SipConnection::Udp(connection);
                        self.serve_connection(connection.clone())?;
                        connection
                    }
                };
                self.bind_remote(resolved.clone(), connection.clone());
                Ok((connection, resolved))
            }
            rsip::transport::Transport::Tcp => {
                let connection =
                    SipConnection::Tcp(tcp::TcpConnection::connect(resolved.get_socketaddr()?).await?);
                self.bind_remote(resolved.clone(), connection.clone());
                self.serve_connection(connection.clone())?;
                Ok((connection, resolved))
            }
            #[cfg(feature = "rustls")]
            rsip::transport::Transport::Tls => {
                let connection =
                    SipConnection::Tls(tls::TlsConnection::connect(&resolved).await?);
                self.bind_remote(resolved.clone(), connection.clone());
                self.serve_connection(connection.clone())?;
                Ok((connection, resolved))
            }
            #[cfg(feature = "websocket")]
            rsip::transport::Transport::Ws | rsip::transport::Transport::Wss => {
                let connection =
                    SipConnection::WebSocket(websocket::WebSocketConnection::connect(&resolved).await?);
                self.bind_remote(resolved.clone(), connection.clone());
                self.serve_connection(connection.clone())?;
                Ok((connection, resolved))
            }
            other => Err(Error::TransportLayerError(
                format!("unsupported transport {}", other),
                resolved,
            )),
        }
    }

    /// Turn a domain target into a literal IP/port via DNS, leaving
    /// literal addresses untouched.
    async fn resolve(&self, target: &SipAddr) -> Result<SipAddr> {
        match &target.addr.host {
            rsip::Host::IpAddr(_) => Ok(SipAddr {
                r#type: Some(target.transport()),
                addr: target.addr.clone(),
            }),
            rsip::Host::Domain(domain) => {
                let port = target
                    .addr
                    .port
                    .as_ref()
                    .map(|p| *p.value())
                    .unwrap_or_else(|| default_port(target.transport()));
                let host = format!("{}:{}", domain, port);
                let mut addrs = tokio::net::lookup_host(host.clone())
                    .await
                    .map_err(|e| Error::DnsResolutionError(format!("{}: {}", host, e)))?;
                let addr = addrs
                    .next()
                    .ok_or_else(|| Error::DnsResolutionError(format!("no address for {}", host)))?;
                Ok(SipAddr {
                    r#type: Some(target.transport()),
                    addr: addr.into(),
                })
            }
        }
    }

    pub fn close(&self) {
        self.inner.cancel_token.cancel();
        let connections: Vec<SipConnection> = {
            let mut map = self.inner.connections.write().unwrap();
            map.drain().map(|(_, c)| c).collect()
        };
        let listens: Vec<SipConnection> = {
            let mut map = self.inner.listens.write().unwrap();
            map.drain().map(|(_, c)| c).collect()
        };
        tokio::spawn(async move {
            for connection in connections.into_iter().chain(listens) {
                connection.close().await.ok();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::ChannelConnection;
    use tokio::sync::mpsc::unbounded_channel;

    fn channel_addr(port: u16) -> SipAddr {
        SipAddr::new(
            rsip::transport::Transport::Udp,
            rsip::HostWithPort::from(SocketAddr::new("127.0.0.1".parse().unwrap(), port)),
        )
    }

    #[tokio::test]
    async fn test_pool_add_get_remove() {
        let layer = TransportLayer::new(CancellationToken::new());
        let (_tx, incoming_rx) = unbounded_channel();
        let (outgoing_tx, _outgoing_rx) = unbounded_channel();
        let addr = channel_addr(5060);
        let connection = ChannelConnection::create_connection(
            incoming_rx,
            outgoing_tx,
            addr.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let connection = SipConnection::Channel(connection);

        layer.add_transport(connection.clone());
        assert!(layer.get_connection(&addr).is_some());

        let remote = channel_addr(5070);
        layer.bind_remote(remote.clone(), connection);
        assert!(layer.get_connection(&remote).is_some());

        layer.del_transport(&addr);
        assert!(layer.get_connection(&addr).is_none());
        assert!(layer.get_connection(&remote).is_none());
    }

    #[tokio::test]
    async fn test_udp_lookup_reuses_listener() {
        let layer = TransportLayer::new(CancellationToken::new());
        let (sender, _receiver) = unbounded_channel();
        layer.set_sender(sender);

        let listener = udp::UdpConnection::create_connection("127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let local = listener.get_addr().clone();
        layer.add_transport(SipConnection::Udp(listener));

        let target = channel_addr(5090);
        let (connection, resolved) = layer.lookup(&target).await.unwrap();
        assert_eq!(connection.get_addr(), &local);
        assert_eq!(resolved, target);
        // The remote is now indexed, so the next lookup is a pool hit.
        assert!(layer.get_connection(&target).is_some());
    }
}
