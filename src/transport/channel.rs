use super::{SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::{Error, Result};
use rsip::SipMessage;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ChannelInner {
    pub addr: SipAddr,
    incoming: tokio::sync::Mutex<Option<UnboundedReceiver<SipMessage>>>,
    outgoing: UnboundedSender<SipMessage>,
    cancel_token: CancellationToken,
    refs: Mutex<usize>,
}

/// An in-memory connection.
///
/// Messages pushed into the `incoming` channel surface exactly like bytes
/// read off a socket; everything the stack writes lands on `outgoing`.
/// Reliability follows the transport of `addr`, so the same harness covers
/// both timer profiles. Used by the test suites; useful for embedding too.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub async fn create_connection(
        incoming: UnboundedReceiver<SipMessage>,
        outgoing: UnboundedSender<SipMessage>,
        addr: SipAddr,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        Ok(ChannelConnection {
            inner: Arc::new(ChannelInner {
                addr,
                incoming: tokio::sync::Mutex::new(Some(incoming)),
                outgoing,
                cancel_token,
                refs: Mutex::new(1),
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
        *refs
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.outgoing.send(msg).map_err(|e| {
            Error::TransportLayerError(format!("channel closed: {}", e), self.inner.addr.clone())
        })
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut incoming = match self.inner.incoming.lock().await.take() {
            Some(incoming) => incoming,
            None => return Ok(()),
        };
        loop {
            let msg = tokio::select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!("channel connection {} closed", self.inner.addr);
                    return Ok(());
                }
                msg = incoming.recv() => msg,
            };
            let Some(msg) = msg else {
                return Ok(());
            };
            let msg = SipConnection::update_msg_received(
                msg,
                self.inner.addr.get_socketaddr()?,
                self.inner.addr.transport(),
            )?;
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Channel(self.clone()),
                self.inner.addr.clone(),
            ))?;
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.cancel_token.cancel();
        Ok(())
    }
}
