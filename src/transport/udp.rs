use super::connection::{KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE, UDP_MTU, UDP_MTU_RESERVE};
use super::{first_non_loopback_interface, SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::{Error, Result};
use rsip::SipMessage;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct UdpInner {
    pub conn: UdpSocket,
    pub addr: SipAddr,
    listener: bool,
    refs: Mutex<usize>,
    cancel_token: CancellationToken,
}

/// A UDP socket in the pool.
///
/// The same socket serves inbound traffic and outbound dials: replies to a
/// peer leave from the address that peer already knows. Listener sockets
/// are pinned open; dialer sockets close once the last transaction holding
/// them lets go.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(local: SocketAddr, listener: bool) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        let mut bound = conn.local_addr()?;
        if bound.ip().is_unspecified() {
            // Advertise something peers can actually route back to.
            bound.set_ip(first_non_loopback_interface()?);
        }
        let addr = SipAddr::new(rsip::transport::Transport::Udp, bound.into());
        info!("created udp connection {} listener={}", addr, listener);
        Ok(UdpConnection {
            inner: Arc::new(UdpInner {
                conn,
                addr,
                listener,
                refs: Mutex::new(1),
                cancel_token: CancellationToken::new(),
            }),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub fn add_ref(&self) {
        *self.inner.refs.lock().unwrap() += 1;
    }

    pub fn try_close(&self) -> usize {
        let mut refs = self.inner.refs.lock().unwrap();
        *refs = refs.saturating_sub(1);
        if *refs == 0 && !self.inner.listener {
            self.inner.cancel_token.cancel();
        }
        *refs
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.cancel_token.cancel();
        Ok(())
    }

    pub async fn send_message(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let destination = destination
            .ok_or_else(|| {
                Error::TransportLayerError(
                    "udp send without destination".to_string(),
                    self.inner.addr.clone(),
                )
            })?
            .get_socketaddr()?;
        let buf = msg.to_string();
        self.send_raw(buf.as_bytes(), destination).await
    }

    pub async fn send_raw(&self, buf: &[u8], destination: SocketAddr) -> Result<()> {
        if buf.len() > UDP_MTU - UDP_MTU_RESERVE {
            return Err(Error::UdpMtuCongestion(buf.len(), UDP_MTU - UDP_MTU_RESERVE));
        }
        debug!("udp send {} -> {} ({} bytes)", self.inner.addr, destination, buf.len());
        self.inner.conn.send_to(buf, destination).await?;
        Ok(())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; 0xFFFF];
        loop {
            let (len, source) = tokio::select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!("udp connection {} closed", self.inner.addr);
                    return Ok(());
                }
                received = self.inner.conn.recv_from(&mut buf) => received?,
            };

            let datagram = &buf[..len];
            if datagram == KEEPALIVE_REQUEST {
                self.inner.conn.send_to(KEEPALIVE_RESPONSE, source).await.ok();
                continue;
            }
            if datagram == KEEPALIVE_RESPONSE || datagram.iter().all(|b| *b == b'\r' || *b == b'\n')
            {
                continue;
            }

            let msg = match SipMessage::try_from(datagram) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(
                        "error parsing {} bytes from {}: {}",
                        len, source, e
                    );
                    continue;
                }
            };
            let msg = match SipConnection::update_msg_received(
                msg,
                source,
                rsip::transport::Transport::Udp,
            ) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("error updating received params from {}: {}", source, e);
                    continue;
                }
            };

            let source = SipAddr::new(rsip::transport::Transport::Udp, source.into());
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Udp(self.clone()),
                source,
            ))?;
        }
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpConnection({})", self.inner.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_udp_send_receive() {
        let a = UdpConnection::create_connection("127.0.0.1:0".parse().unwrap(), false)
            .await
            .unwrap();
        let b = UdpConnection::create_connection("127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();

        let (sender, mut receiver) = unbounded_channel();
        let serve = b.clone();
        tokio::spawn(async move { serve.serve_loop(sender).await });

        let register = "REGISTER sip:example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKnashds7\r\n\
             From: <sip:alice@example.com>;tag=88sja8x\r\n\
             To: <sip:alice@example.com>\r\n\
             Call-ID: 987asjd97y7atg\r\n\
             CSeq: 1 REGISTER\r\n\
             Content-Length: 0\r\n\r\n";
        let msg = SipMessage::try_from(register).unwrap();
        a.send_message(msg, Some(b.get_addr())).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out")
            .expect("closed");
        match event {
            TransportEvent::Incoming(msg, _, source) => {
                assert!(matches!(msg, SipMessage::Request(_)));
                assert_eq!(source.get_socketaddr().unwrap(), a.get_addr().get_socketaddr().unwrap());
                assert!(msg.to_string().contains("received=127.0.0.1"));
            }
            _ => panic!("expected incoming message"),
        }
    }

    #[tokio::test]
    async fn test_udp_mtu_guard() {
        let a = UdpConnection::create_connection("127.0.0.1:0".parse().unwrap(), false)
            .await
            .unwrap();
        let big = vec![b'a'; UDP_MTU - UDP_MTU_RESERVE + 1];
        let err = a
            .send_raw(&big, "127.0.0.1:5060".parse().unwrap())
            .await
            .expect_err("oversized datagram must fail");
        assert!(matches!(err, Error::UdpMtuCongestion(_, _)));
    }

    #[tokio::test]
    async fn test_refcount_close() {
        let conn = UdpConnection::create_connection("127.0.0.1:0".parse().unwrap(), false)
            .await
            .unwrap();
        conn.add_ref();
        assert_eq!(conn.try_close(), 1);
        assert!(!conn.inner.cancel_token.is_cancelled());
        assert_eq!(conn.try_close(), 0);
        assert!(conn.inner.cancel_token.is_cancelled());
    }
}
