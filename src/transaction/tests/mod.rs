//! Transaction-layer tests, driven end to end over the in-memory channel
//! transport with fast timer profiles.

use crate::transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::transport::channel::ChannelConnection;
use crate::transport::{SipAddr, SipConnection};
use rsip::SipMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

mod test_server;

pub(crate) const PEER_URI: &str = "sip:bob@127.0.0.99:5060";

/// A timer profile tight enough that linger windows pass in tens of
/// milliseconds while still being observable.
pub(crate) fn fast_option() -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(20),
        t2: Duration::from_millis(80),
        t4: Duration::from_millis(60),
        t1x64: Duration::from_millis(400),
        timer_d: Duration::from_millis(200),
        timer_100: Duration::from_millis(50),
        timer_interval: Duration::from_millis(5),
        lookup_timeout: Duration::from_secs(1),
        callid_suffix: None,
    }
}

pub(crate) struct TestEnv {
    pub endpoint: Arc<Endpoint>,
    /// Messages the stack wrote to the wire.
    pub wire_rx: UnboundedReceiver<SipMessage>,
    /// Inject messages as if they arrived from the peer.
    pub peer_tx: UnboundedSender<SipMessage>,
    pub addr: SipAddr,
}

impl TestEnv {
    /// An endpoint serving a single channel connection of the given
    /// transport.
    pub async fn new(transport: rsip::transport::Transport) -> Self {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .try_init()
            .ok();
        let endpoint = Arc::new(EndpointBuilder::new().with_option(fast_option()).build());
        let local: std::net::SocketAddr = "127.0.0.1:5060".parse().expect("addr");
        let addr = SipAddr::new(transport, local.into());
        let (peer_tx, incoming_rx) = unbounded_channel();
        let (outgoing_tx, wire_rx) = unbounded_channel();
        let connection = ChannelConnection::create_connection(
            incoming_rx,
            outgoing_tx,
            addr.clone(),
            endpoint.inner.cancel_token.child_token(),
        )
        .await
        .expect("channel connection");
        let connection = SipConnection::Channel(connection);
        endpoint.inner.transport_layer.add_transport(connection.clone());

        let serve = endpoint.clone();
        tokio::spawn(async move { serve.serve().await });
        // Let the serve loop take over the transport receiver.
        tokio::task::yield_now().await;

        TestEnv {
            endpoint,
            wire_rx,
            peer_tx,
            addr,
        }
    }

    /// Pre-associate `target` with the channel connection so stream-like
    /// lookups hit the pool instead of dialing.
    pub fn bind_target(&self, target: &SipAddr) {
        if let Some(connection) = self.endpoint.inner.transport_layer.get_connection(&self.addr) {
            self.endpoint
                .inner
                .transport_layer
                .bind_remote(target.clone(), connection);
        }
    }

    /// The next message the stack writes that satisfies `pred`, skipping
    /// everything else (e.g. Timer A retransmissions).
    pub async fn expect_wire<F>(&mut self, mut pred: F) -> SipMessage
    where
        F: FnMut(&SipMessage) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let msg = self.wire_rx.recv().await.expect("wire closed");
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for wire message")
    }

    /// Count matching wire messages over a fixed window.
    pub async fn count_wire<F>(&mut self, window: Duration, mut pred: F) -> usize
    where
        F: FnMut(&SipMessage) -> bool,
    {
        let mut count = 0;
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.wire_rx.recv()).await {
                Ok(Some(msg)) => {
                    if pred(&msg) {
                        count += 1;
                    }
                }
                Ok(None) | Err(_) => return count,
            }
        }
    }
}

pub(crate) fn is_request_method(msg: &SipMessage, method: rsip::Method) -> bool {
    matches!(msg, SipMessage::Request(req) if req.method == method)
}

pub(crate) fn is_status(msg: &SipMessage, status: u16) -> bool {
    matches!(msg, SipMessage::Response(resp) if resp.status_code.code() == status)
}

pub(crate) fn request(method: rsip::Method, branch: &str, cseq: u32) -> rsip::Request {
    rsip::Request {
        method,
        uri: rsip::Uri::try_from(PEER_URI).expect("uri"),
        version: rsip::Version::V2,
        headers: vec![
            rsip::Header::Via(
                format!("SIP/2.0/UDP 127.0.0.1:5060;branch={}", branch).into(),
            ),
            rsip::Header::From("Alice <sip:alice@example.com>;tag=88sja8x".into()),
            rsip::Header::To("Bob <sip:bob@example.com>".into()),
            rsip::Header::CallId("testcall-1@example.com".into()),
            rsip::Header::CSeq(format!("{} {}", cseq, method).into()),
            rsip::Header::Contact("<sip:alice@127.0.0.1:5060>".into()),
            rsip::Header::MaxForwards(70.into()),
        ]
        .into(),
        body: vec![],
    }
}

/// A response a peer would send for `req`, headers mirrored.
pub(crate) fn response_for(req: &rsip::Request, status: rsip::StatusCode) -> rsip::Response {
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            rsip::Header::Via(_)
                | rsip::Header::CallId(_)
                | rsip::Header::From(_)
                | rsip::Header::To(_)
                | rsip::Header::CSeq(_)
        )
    });
    rsip::Response {
        status_code: status,
        version: rsip::Version::V2,
        headers,
        body: vec![],
    }
}

/// The ACK a peer would send for a non-2xx final of `invite`.
pub(crate) fn ack_for(invite: &rsip::Request, cseq: u32) -> rsip::Request {
    let mut ack = request(rsip::Method::Ack, &branch_of(invite), cseq);
    ack.uri = invite.uri.clone();
    ack
}

pub(crate) fn cancel_for(invite: &rsip::Request, cseq: u32) -> rsip::Request {
    request(rsip::Method::Cancel, &branch_of(invite), cseq)
}

pub(crate) fn branch_of(req: &rsip::Request) -> String {
    use crate::rsip_ext::HeadersViewExt;
    req.top_via()
        .expect("via")
        .branch()
        .expect("branch")
        .value()
        .to_string()
}
