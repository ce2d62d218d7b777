//! The endpoint: the transaction layer's front door.
//!
//! An [`Endpoint`] owns the two transaction stores, the timer queue and
//! the transport layer. [`Endpoint::serve`] runs the routing loop: every
//! message delivered by the transport layer either lands in an existing
//! transaction or creates a server transaction, and every expired timer is
//! dispatched back to its owner. Upward, the application consumes
//! [`incoming_transactions`](Endpoint::incoming_transactions) and calls
//! [`request`](Endpoint::request) / [`respond`](Endpoint::respond).

use super::client::ClientTransaction;
use super::key::{TransactionKey, TransactionRole};
use super::server::ServerTransaction;
use super::store::TransactionStore;
use super::timer::Timer;
use super::TransactionTimer;
use crate::transport::{
    SipAddr, SipConnection, TransportEvent, TransportLayer, TransportReceiver,
};
use crate::{Error, Result};
use rsip::{Request, Response, SipMessage};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timer profile and tunables, threaded through construction instead of
/// mutable globals. Tests run with fast profiles.
#[derive(Clone)]
pub struct EndpointOption {
    /// RFC 3261 T1: RTT estimate, base of every retransmit schedule.
    pub t1: Duration,
    /// RFC 3261 T2: retransmit interval cap for non-INVITE requests and
    /// INVITE responses.
    pub t2: Duration,
    /// RFC 3261 T4: maximum lifetime of a message in the network.
    pub t4: Duration,
    /// 64·T1: the timeout horizon (Timers B, F, H, J, L, M).
    pub t1x64: Duration,
    /// Timer D: completed-state linger on the client, unreliable only.
    pub timer_d: Duration,
    /// Grace period before an INVITE server transaction answers 100 Trying
    /// on the application's behalf.
    pub timer_100: Duration,
    /// Granularity of the timer poll loop.
    pub timer_interval: Duration,
    /// Bound on connection acquisition in [`Endpoint::request`].
    pub lookup_timeout: Duration,
    /// Optional `@suffix` for generated Call-IDs.
    pub callid_suffix: Option<String>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);
        EndpointOption {
            t1,
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t1x64: t1 * 64,
            timer_d: Duration::from_secs(32),
            timer_100: Duration::from_millis(200),
            timer_interval: Duration::from_millis(20),
            lookup_timeout: Duration::from_secs(10),
            callid_suffix: None,
        }
    }
}

pub type EndpointInnerRef = Arc<EndpointInner>;
pub type TransactionReceiver = UnboundedReceiver<ServerTransaction>;

pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub cancel_token: CancellationToken,
    pub(crate) client_transactions: TransactionStore<ClientTransaction>,
    pub(crate) server_transactions: TransactionStore<ServerTransaction>,
    incoming_tx: UnboundedSender<ServerTransaction>,
    incoming_rx: Mutex<Option<TransactionReceiver>>,
    unhandled_tx: Mutex<Option<UnboundedSender<Response>>>,
    transport_rx: Mutex<Option<TransportReceiver>>,
}

/// A SIP endpoint: transaction layer plus its transport pool.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

#[derive(Default)]
pub struct EndpointBuilder {
    user_agent: Option<String>,
    option: Option<EndpointOption>,
    cancel_token: Option<CancellationToken>,
    transport_layer: Option<TransportLayer>,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = Some(option);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn build(self) -> Endpoint {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let (transport_tx, transport_rx) = unbounded_channel();
        transport_layer.set_sender(transport_tx);
        let (incoming_tx, incoming_rx) = unbounded_channel();

        Endpoint {
            inner: Arc::new(EndpointInner {
                user_agent: self.user_agent.unwrap_or_else(|| crate::USER_AGENT.to_string()),
                option: self.option.unwrap_or_default(),
                timers: Timer::new(),
                transport_layer,
                cancel_token,
                client_transactions: TransactionStore::new(),
                server_transactions: TransactionStore::new(),
                incoming_tx,
                incoming_rx: Mutex::new(Some(incoming_rx)),
                unhandled_tx: Mutex::new(None),
                transport_rx: Mutex::new(Some(transport_rx)),
            }),
        }
    }
}

impl Endpoint {
    /// Run the endpoint: serve every registered listener, poll timers and
    /// route transport events. Returns once the cancel token fires.
    pub async fn serve(&self) {
        let mut transport_rx = match self.inner.transport_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!("endpoint already served");
                return;
            }
        };
        if let Err(e) = self.inner.transport_layer.serve_listens() {
            warn!("error serving listeners: {}", e);
        }

        let mut tick = tokio::time::interval(self.inner.option.timer_interval);
        info!("endpoint serving, user agent {}", self.inner.user_agent);
        loop {
            tokio::select! {
                _ = self.inner.cancel_token.cancelled() => break,
                _ = tick.tick() => {
                    for timer in self.inner.timers.poll(Instant::now()) {
                        self.inner.dispatch_timer(timer);
                    }
                }
                event = transport_rx.recv() => {
                    match event {
                        Some(event) => self.inner.on_transport_event(event),
                        None => break,
                    }
                }
            }
        }
        info!("endpoint stopped");
    }

    /// New server transactions, one per unmatched incoming request. Can be
    /// taken once.
    pub fn incoming_transactions(&self) -> Result<TransactionReceiver> {
        self.inner
            .incoming_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::EndpointError("incoming transactions already taken".to_string()))
    }

    /// Responses that matched no client transaction. Log-only until taken.
    pub fn unhandled_responses(&self) -> UnboundedReceiver<Response> {
        let (tx, rx) = unbounded_channel();
        self.inner.unhandled_tx.lock().unwrap().replace(tx);
        rx
    }

    /// Send `request` as a new client transaction.
    ///
    /// ACK is refused: acknowledgments of 2xx travel outside transactions,
    /// straight through the transport layer. Connection acquisition is
    /// bounded by [`EndpointOption::lookup_timeout`]; a duplicate key
    /// refuses creation and releases the connection.
    pub async fn request(&self, mut request: Request) -> Result<ClientTransaction> {
        if request.method == rsip::Method::Ack {
            return Err(Error::EndpointError(
                "ACK must be sent via the transport layer, not as a transaction".to_string(),
            ));
        }
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let target = SipAddr::try_from(&request.uri)?;
        let (connection, destination) = tokio::time::timeout(
            self.inner.option.lookup_timeout,
            self.inner.transport_layer.lookup(&target),
        )
        .await
        .map_err(|_| Error::EndpointError(format!("connection lookup timed out for {}", target)))??;

        request
            .headers
            .unique_push(rsip::Header::ContentLength((request.body.len() as u32).into()));

        let tx = ClientTransaction::new(
            self.inner.clone(),
            key.clone(),
            request,
            connection,
            Some(destination),
        );
        if !self.inner.client_transactions.put(key.clone(), tx.clone()) {
            tx.discard();
            return Err(Error::TransactionError(
                "client transaction already exists".to_string(),
                key,
            ));
        }
        tx.send().await?;
        Ok(tx)
    }

    /// Send `response` through the server transaction its Via/CSeq key
    /// points at.
    pub async fn respond(&self, response: Response) -> Result<ServerTransaction> {
        let key = TransactionKey::from_response(&response, TransactionRole::Server)?;
        let tx = self
            .inner
            .server_transactions
            .get(&key)
            .ok_or_else(|| Error::TransactionError("server transaction not found".to_string(), key))?;
        tx.respond(response).await?;
        Ok(tx)
    }

    /// Terminate every live transaction and close the transport layer.
    pub async fn shutdown(&self) {
        info!("endpoint shutting down");
        for tx in self.inner.client_transactions.snapshot() {
            tx.terminate().await;
        }
        for tx in self.inner.server_transactions.snapshot() {
            tx.terminate().await;
        }
        self.inner.transport_layer.close();
        self.inner.cancel_token.cancel();
    }
}

impl EndpointInner {
    fn dispatch_timer(self: &Arc<Self>, timer: TransactionTimer) {
        if timer.is_client() {
            if let Some(tx) = self.client_transactions.get(timer.key()) {
                tokio::spawn(async move {
                    if let Err(e) = tx.on_timer(timer).await {
                        debug!("client timer error: {}", e);
                    }
                });
            }
        } else if let Some(tx) = self.server_transactions.get(timer.key()) {
            tokio::spawn(async move {
                if let Err(e) = tx.on_timer(timer).await {
                    debug!("server timer error: {}", e);
                }
            });
        }
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Incoming(msg, connection, source) => {
                // Fresh task per message: a transaction blocked on its
                // consumer must not stall the transport reader.
                let inner = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.on_incoming_message(msg, connection, source).await {
                        debug!("error handling incoming message: {}", e);
                    }
                });
            }
            TransportEvent::New(connection) => {
                debug!("new connection {}", connection);
                self.transport_layer
                    .bind_remote(connection.get_addr().clone(), connection.clone());
                if let Err(e) = self.transport_layer.serve_connection(connection) {
                    warn!("error serving new connection: {}", e);
                }
            }
            TransportEvent::Closed(connection) => {
                debug!("connection closed {}", connection);
            }
        }
    }

    pub(crate) async fn on_incoming_message(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: SipConnection,
        source: SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Request(req) => self.on_incoming_request(req, connection, source).await,
            SipMessage::Response(resp) => self.on_incoming_response(resp).await,
        }
    }

    async fn on_incoming_request(
        self: &Arc<Self>,
        req: Request,
        connection: SipConnection,
        source: SipAddr,
    ) -> Result<()> {
        if req.method == rsip::Method::Cancel {
            // A CANCEL aims at the INVITE transaction with the same branch.
            let target = TransactionKey::from_request_with_method(
                &req,
                TransactionRole::Server,
                rsip::Method::Invite,
            )?;
            if let Some(tx) = self.server_transactions.get(&target) {
                tx.receive_cancel(req.clone()).await.ok();
                let ok = self.make_response(&req, rsip::StatusCode::OK, None);
                connection.send(ok.into(), Some(&source)).await?;
                return Ok(());
            }
            // No INVITE in progress: the CANCEL is a transaction of its
            // own and falls through.
        }

        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
        if req.method == rsip::Method::Ack {
            // An ACK either hits the INVITE transaction by key or belongs
            // to a 2xx dialog no transaction tracks anymore.
            match self.server_transactions.get(&key) {
                Some(tx) => return tx.receive(req).await,
                None => {
                    debug!(key = %key, "dropping unmatched ack");
                    return Ok(());
                }
            }
        }

        let fresh = ServerTransaction::new(
            self.clone(),
            key.clone(),
            req.clone(),
            connection,
            source,
        );
        let (tx, inserted) = self.server_transactions.put_or_get(key, fresh.clone());
        if inserted {
            tx.init().await;
            if self.incoming_tx.send(tx.clone()).is_err() {
                warn!(key = %tx.key(), "no incoming transaction consumer, terminating");
                tx.terminate().await;
            }
        } else {
            // Retransmission raced us; the occupant replays its latest
            // response and the loser gives back its connection reference.
            fresh.discard();
            tx.receive(req).await?;
        }
        Ok(())
    }

    async fn on_incoming_response(self: &Arc<Self>, resp: Response) -> Result<()> {
        let key = TransactionKey::from_response(&resp, TransactionRole::Client)?;
        match self.client_transactions.get(&key) {
            Some(tx) => tx.receive(resp).await,
            None => {
                self.unhandled_response(resp);
                Ok(())
            }
        }
    }

    fn unhandled_response(&self, resp: Response) {
        let sender = self.unhandled_tx.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                if let Err(e) = sender.send(resp) {
                    info!("unhandled response dropped: {}", e.0.status_code);
                }
            }
            None => info!("unhandled response: {}", resp.status_code),
        }
    }

    pub(crate) fn detach_client_transaction(&self, key: &TransactionKey) {
        self.client_transactions.remove(key);
    }

    pub(crate) fn detach_server_transaction(&self, key: &TransactionKey) {
        self.server_transactions.remove(key);
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint({})", self.inner.user_agent)
    }
}
