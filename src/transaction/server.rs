//! Server transactions (RFC 3261 section 17.2, RFC 6026 section 7.1).

use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use super::TransactionTimer;
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use rsip::{Request, Response, StatusCodeKind};
use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// States of a server transaction. `Trying` is non-INVITE only;
/// `Confirmed` and `Accepted` are INVITE only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Accepted,
    Terminated,
}

enum ServerInput {
    /// A retransmission of the origin request.
    Retransmit,
    Ack(Request),
    Cancel(Request),
    Provisional(Response),
    Success(Response),
    Failure(Response),
    TimerG(Duration),
    TimerH,
    TimerI,
    TimerJ,
    TimerL,
    Timer100,
    TransportError(Error),
    Delete,
}

type CancelHandler = Box<dyn FnOnce(&Request) + Send>;
type TerminatedHandler = Box<dyn FnOnce(&TransactionKey, Option<&Error>) + Send>;

struct ServerFsm {
    state: ServerState,
    last_response: Option<Response>,
    timer_g: Option<u64>,
    timer_h: Option<u64>,
    timer_i: Option<u64>,
    timer_j: Option<u64>,
    timer_l: Option<u64>,
    timer_trying: Option<u64>,
    cleaned_up: bool,
}

pub(crate) struct ServerInner {
    pub key: TransactionKey,
    pub original: Request,
    invite: bool,
    endpoint: EndpointInnerRef,
    connection: SipConnection,
    /// Where the request came from; responses go back there.
    destination: SipAddr,
    fsm: tokio::sync::Mutex<ServerFsm>,
    ack_tx: mpsc::Sender<Request>,
    ack_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    done: CancellationToken,
    last_error: Mutex<Option<Error>>,
    canceled: AtomicBool,
    on_cancel: Mutex<Option<CancelHandler>>,
    on_terminate: Mutex<Option<TerminatedHandler>>,
}

/// A server transaction handle.
///
/// Created by the endpoint for every unmatched incoming request and handed
/// to the application through
/// [`Endpoint::incoming_transactions`](super::endpoint::Endpoint::incoming_transactions).
/// The application answers with [`respond`](ServerTransaction::respond);
/// retransmissions of the origin request are absorbed by replaying the
/// latest response, and for INVITE the ACK handshake and 487-on-CANCEL are
/// handled here.
#[derive(Clone)]
pub struct ServerTransaction {
    pub(crate) inner: Arc<ServerInner>,
}

impl ServerTransaction {
    pub(crate) fn new(
        endpoint: EndpointInnerRef,
        key: TransactionKey,
        original: Request,
        connection: SipConnection,
        destination: SipAddr,
    ) -> Self {
        let invite = original.method == rsip::Method::Invite;
        let (ack_tx, ack_rx) = mpsc::channel(1);
        connection.add_ref();
        info!(key = %key, invite, "server transaction created");
        ServerTransaction {
            inner: Arc::new(ServerInner {
                key,
                original,
                invite,
                endpoint,
                connection,
                destination,
                fsm: tokio::sync::Mutex::new(ServerFsm {
                    state: if invite {
                        ServerState::Proceeding
                    } else {
                        ServerState::Trying
                    },
                    last_response: None,
                    timer_g: None,
                    timer_h: None,
                    timer_i: None,
                    timer_j: None,
                    timer_l: None,
                    timer_trying: None,
                    cleaned_up: false,
                }),
                ack_tx,
                ack_rx: Mutex::new(Some(ack_rx)),
                done: CancellationToken::new(),
                last_error: Mutex::new(None),
                canceled: AtomicBool::new(false),
                on_cancel: Mutex::new(None),
                on_terminate: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.inner.key
    }

    pub fn original(&self) -> &Request {
        &self.inner.original
    }

    /// The address the origin request came from.
    pub fn source(&self) -> &SipAddr {
        &self.inner.destination
    }

    pub async fn state(&self) -> ServerState {
        self.inner.fsm.lock().await.state
    }

    /// Arm the automatic 100 Trying for INVITE. Non-INVITE has nothing to
    /// do until the application responds.
    pub(crate) async fn init(&self) {
        if !self.inner.invite {
            return;
        }
        let mut fsm = self.inner.fsm.lock().await;
        fsm.timer_trying = Some(self.inner.endpoint.timers.timeout(
            self.inner.endpoint.option.timer_100,
            TransactionTimer::Timer100(self.inner.key.clone()),
        ));
    }

    /// Feed a matched request into the FSM: a retransmission of the
    /// origin, an ACK for a non-2xx final, or a CANCEL. Anything else is an
    /// error.
    pub async fn receive(&self, request: Request) -> Result<()> {
        {
            let mut fsm = self.inner.fsm.lock().await;
            self.cancel_timer(&mut fsm.timer_trying);
        }
        let input = if request.method == self.inner.original.method {
            ServerInput::Retransmit
        } else if request.method == rsip::Method::Ack && self.inner.invite {
            ServerInput::Ack(request)
        } else if request.method == rsip::Method::Cancel {
            ServerInput::Cancel(request)
        } else {
            return Err(Error::TransactionError(
                format!("unexpected {} for server transaction", request.method),
                self.inner.key.clone(),
            ));
        };
        self.spin(input).await
    }

    /// Send a response through the transaction.
    ///
    /// A response to a bare CANCEL is written straight to the connection
    /// without touching the FSM. When the transaction is already
    /// terminated, the stored terminal error comes back and nothing is
    /// written.
    pub async fn respond(&self, response: Response) -> Result<()> {
        use crate::rsip_ext::HeadersViewExt;

        let cseq_method = response
            .cseq()
            .map(|cseq| cseq.method)
            .unwrap_or(self.inner.original.method);
        if cseq_method == rsip::Method::Cancel && self.inner.original.method != rsip::Method::Cancel
        {
            return self
                .inner
                .connection
                .send(response.into(), Some(&self.inner.destination))
                .await;
        }

        {
            let fsm = self.inner.fsm.lock().await;
            if fsm.state == ServerState::Terminated {
                return Err(self
                    .err()
                    .unwrap_or_else(|| Error::TransactionTerminated(self.inner.key.clone())));
            }
        }

        let input = match response.status_code.kind() {
            StatusCodeKind::Provisional => {
                if response.status_code != rsip::StatusCode::Trying {
                    let mut fsm = self.inner.fsm.lock().await;
                    self.cancel_timer(&mut fsm.timer_trying);
                }
                ServerInput::Provisional(response)
            }
            StatusCodeKind::Successful => {
                let mut fsm = self.inner.fsm.lock().await;
                self.cancel_timer(&mut fsm.timer_trying);
                drop(fsm);
                ServerInput::Success(response)
            }
            _ => {
                let mut fsm = self.inner.fsm.lock().await;
                self.cancel_timer(&mut fsm.timer_trying);
                drop(fsm);
                ServerInput::Failure(response)
            }
        };
        self.spin(input).await
    }

    /// Deliver a CANCEL aimed at this transaction. In Proceeding it turns
    /// into a 487 plus the cancel hook; later it is a no-op.
    pub(crate) async fn receive_cancel(&self, cancel: Request) -> Result<()> {
        {
            let mut fsm = self.inner.fsm.lock().await;
            self.cancel_timer(&mut fsm.timer_trying);
        }
        self.spin(ServerInput::Cancel(cancel)).await
    }

    /// ACKs absorbed for non-2xx finals (and surfaced in Accepted for the
    /// dialog layer). `None` once taken.
    pub fn acks(&self) -> Option<mpsc::Receiver<Request>> {
        self.inner.ack_rx.lock().unwrap().take()
    }

    /// Register a CANCEL observer. Returns `false` when the transaction is
    /// already closed or canceled.
    pub fn on_cancel<F>(&self, handler: F) -> bool
    where
        F: FnOnce(&Request) + Send + 'static,
    {
        if self.inner.done.is_cancelled() || self.inner.canceled.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.on_cancel.lock().unwrap().replace(Box::new(handler));
        true
    }

    /// Release the connection reference without ever having run. Used when
    /// an insert lost the duplicate-key race.
    pub(crate) fn discard(&self) {
        self.inner.connection.try_close();
    }

    /// Fires once the transaction reaches a terminal state; the terminal
    /// error is reported after the done latch closes.
    pub fn set_on_terminate<F>(&self, handler: F)
    where
        F: FnOnce(&TransactionKey, Option<&Error>) + Send + 'static,
    {
        self.inner
            .on_terminate
            .lock()
            .unwrap()
            .replace(Box::new(handler));
    }

    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    pub fn err(&self) -> Option<Error> {
        self.inner.last_error.lock().unwrap().clone()
    }

    /// Force the transaction into the terminated state. Idempotent.
    pub async fn terminate(&self) {
        self.inner
            .last_error
            .lock()
            .unwrap()
            .get_or_insert_with(|| Error::TransactionTerminated(self.inner.key.clone()));
        self.inner.done.cancel();
        self.spin(ServerInput::Delete).await.ok();
    }

    /// Like [`terminate`](Self::terminate), but when an unreliable final
    /// response is still being retransmitted, wait for the linger timers to
    /// run their course instead of cutting them short.
    pub async fn terminate_gracefully(&self) {
        let pending = {
            let fsm = self.inner.fsm.lock().await;
            fsm.state != ServerState::Terminated
                && !self.inner.connection.is_reliable()
                && fsm
                    .last_response
                    .as_ref()
                    .map(|r| r.status_code.kind() != StatusCodeKind::Provisional)
                    .unwrap_or(false)
        };
        if pending {
            self.inner.done.cancelled().await;
        } else {
            self.terminate().await;
        }
    }

    pub(crate) async fn on_timer(&self, timer: TransactionTimer) -> Result<()> {
        let input = match timer {
            TransactionTimer::TimerG(_, duration) => ServerInput::TimerG(duration),
            TransactionTimer::TimerH(_) => ServerInput::TimerH,
            TransactionTimer::TimerI(_) => ServerInput::TimerI,
            TransactionTimer::TimerJ(_) => ServerInput::TimerJ,
            TransactionTimer::TimerL(_) => ServerInput::TimerL,
            TransactionTimer::Timer100(_) => ServerInput::Timer100,
            _ => return Ok(()),
        };
        self.spin(input).await
    }

    async fn spin(&self, input: ServerInput) -> Result<()> {
        let mut fsm = self.inner.fsm.lock().await;
        let mut first_error = None;
        let mut next = Some(input);
        while let Some(input) = next {
            if let ServerInput::TransportError(ref e) = input {
                first_error.get_or_insert_with(|| e.clone());
            }
            next = if self.inner.invite {
                self.step_invite(&mut fsm, input).await
            } else {
                self.step(&mut fsm, input).await
            };
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Non-INVITE FSM (RFC 3261 section 17.2.2).
    async fn step(&self, fsm: &mut ServerFsm, input: ServerInput) -> Option<ServerInput> {
        use ServerInput::*;
        use ServerState::*;
        match (fsm.state, input) {
            (Trying, Provisional(response)) => {
                if let Some(error) = self.write(&response).await {
                    return Some(error);
                }
                fsm.last_response = Some(response);
                self.transition(fsm, Proceeding);
                None
            }
            (Proceeding, Provisional(response)) => {
                if let Some(error) = self.write(&response).await {
                    return Some(error);
                }
                fsm.last_response = Some(response);
                None
            }
            (Trying | Proceeding, Success(response)) | (Trying | Proceeding, Failure(response)) => {
                if let Some(error) = self.write(&response).await {
                    return Some(error);
                }
                fsm.last_response = Some(response);
                self.transition(fsm, Completed);
                self.start_timer_j(fsm)
            }
            (Proceeding | Completed, Retransmit) => {
                // Replay the latest response at the retransmitted request.
                if let Some(response) = fsm.last_response.clone() {
                    if let Some(error) = self.write(&response).await {
                        return Some(error);
                    }
                }
                None
            }
            (Completed, TimerJ) => {
                self.terminate_in(fsm, Error::TransactionTerminated(self.inner.key.clone()));
                None
            }
            (Terminated, _) => None,
            (_, Delete) => {
                self.terminate_in(fsm, Error::TransactionTerminated(self.inner.key.clone()));
                None
            }
            (_, TransportError(error)) => {
                self.terminate_in(fsm, error);
                None
            }
            _ => None,
        }
    }

    /// INVITE FSM (RFC 3261 section 17.2.1 with the RFC 6026 Accepted
    /// state).
    async fn step_invite(&self, fsm: &mut ServerFsm, input: ServerInput) -> Option<ServerInput> {
        use ServerInput::*;
        use ServerState::*;
        match (fsm.state, input) {
            (Proceeding, Timer100) => {
                // The application has not answered within the grace
                // period; stand in with a 100 Trying.
                if fsm.last_response.is_some() {
                    return None;
                }
                let trying = self
                    .inner
                    .endpoint
                    .make_response(&self.inner.original, rsip::StatusCode::Trying, None);
                Some(Provisional(trying))
            }
            (Proceeding, Provisional(response)) => {
                if let Some(error) = self.write(&response).await {
                    return Some(error);
                }
                fsm.last_response = Some(response);
                None
            }
            (Proceeding, Retransmit) => {
                if let Some(response) = fsm.last_response.clone() {
                    if let Some(error) = self.write(&response).await {
                        return Some(error);
                    }
                }
                None
            }
            (Proceeding, Cancel(cancel)) => {
                // Stay in Proceeding; the fabricated 487 below re-enters
                // the ordinary failure path.
                self.inner.canceled.store(true, Ordering::SeqCst);
                self.inner
                    .last_error
                    .lock()
                    .unwrap()
                    .get_or_insert_with(|| Error::TransactionCanceled(self.inner.key.clone()));
                if let Some(hook) = self.inner.on_cancel.lock().unwrap().take() {
                    hook(&cancel);
                }
                let terminated = self.inner.endpoint.make_response(
                    &self.inner.original,
                    rsip::StatusCode::RequestTerminated,
                    None,
                );
                Some(Failure(terminated))
            }
            (Proceeding, Success(response)) => {
                if let Some(error) = self.write(&response).await {
                    return Some(error);
                }
                fsm.last_response = Some(response);
                self.transition(fsm, Accepted);
                fsm.timer_l = Some(self.inner.endpoint.timers.timeout(
                    self.inner.endpoint.option.t1x64,
                    TransactionTimer::TimerL(self.inner.key.clone()),
                ));
                None
            }
            (Proceeding, Failure(response)) => {
                if let Some(error) = self.write(&response).await {
                    return Some(error);
                }
                fsm.last_response = Some(response);
                self.transition(fsm, Completed);
                if !self.inner.connection.is_reliable() {
                    fsm.timer_g = Some(self.inner.endpoint.timers.timeout(
                        self.inner.endpoint.option.t1,
                        TransactionTimer::TimerG(self.inner.key.clone(), self.inner.endpoint.option.t1),
                    ));
                }
                fsm.timer_h = Some(self.inner.endpoint.timers.timeout(
                    self.inner.endpoint.option.t1x64,
                    TransactionTimer::TimerH(self.inner.key.clone()),
                ));
                None
            }
            (Completed, Retransmit) => {
                if let Some(response) = fsm.last_response.clone() {
                    if let Some(error) = self.write(&response).await {
                        return Some(error);
                    }
                }
                None
            }
            (Completed, Ack(ack)) => {
                self.cancel_timer(&mut fsm.timer_g);
                self.cancel_timer(&mut fsm.timer_h);
                self.transition(fsm, Confirmed);
                self.pass_ack(ack);
                let duration = if self.inner.connection.is_reliable() {
                    Duration::ZERO
                } else {
                    self.inner.endpoint.option.t4
                };
                if duration.is_zero() {
                    return Some(Delete);
                }
                fsm.timer_i = Some(self
                    .inner
                    .endpoint
                    .timers
                    .timeout(duration, TransactionTimer::TimerI(self.inner.key.clone())));
                None
            }
            (Completed, TimerG(duration)) => {
                if let Some(response) = fsm.last_response.clone() {
                    if let Some(error) = self.write(&response).await {
                        return Some(error);
                    }
                }
                let next = cmp::min(duration * 2, self.inner.endpoint.option.t2);
                fsm.timer_g = Some(self.inner.endpoint.timers.timeout(
                    next,
                    TransactionTimer::TimerG(self.inner.key.clone(), next),
                ));
                None
            }
            (Completed, TimerH) => {
                // The ACK never arrived.
                self.terminate_in(fsm, Error::TransactionTimeout(self.inner.key.clone()));
                None
            }
            (Confirmed, TimerI) => {
                self.terminate_in(fsm, Error::TransactionTerminated(self.inner.key.clone()));
                None
            }
            (Accepted, Ack(ack)) => {
                // RFC 6026: the 2xx ACK is its own transaction, but the
                // dialog layer wants to see it.
                self.pass_ack(ack);
                None
            }
            (Accepted, Success(response)) => {
                // The TU retransmits its 2xx through us.
                if let Some(error) = self.write(&response).await {
                    return Some(error);
                }
                fsm.last_response = Some(response);
                None
            }
            (Accepted, TimerL) => {
                self.terminate_in(fsm, Error::TransactionTerminated(self.inner.key.clone()));
                None
            }
            (Accepted, TransportError(error)) => {
                warn!(key = %self.inner.key, "transport error in accepted state: {}", error);
                None
            }
            (Terminated, _) => None,
            (_, Delete) => {
                self.terminate_in(fsm, Error::TransactionTerminated(self.inner.key.clone()));
                None
            }
            (_, TransportError(error)) => {
                self.terminate_in(fsm, error);
                None
            }
            _ => None,
        }
    }

    async fn write(&self, response: &Response) -> Option<ServerInput> {
        debug!(key = %self.inner.key, "responding {}", response.status_code);
        match self
            .inner
            .connection
            .send(response.clone().into(), Some(&self.inner.destination))
            .await
        {
            Ok(()) => None,
            Err(e) => Some(ServerInput::TransportError(Error::TransactionTransport(
                e.to_string(),
                self.inner.key.clone(),
            ))),
        }
    }

    /// Hand an ACK to whoever listens without ever blocking the FSM: if
    /// the slot is taken, a one-shot task finishes the delivery.
    fn pass_ack(&self, ack: Request) {
        use tokio::sync::mpsc::error::TrySendError;
        match self.inner.ack_tx.try_send(ack) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                debug!(key = %self.inner.key, "dropping ack, receiver gone");
            }
            Err(TrySendError::Full(ack)) => {
                let ack_tx = self.inner.ack_tx.clone();
                let done = self.inner.done.clone();
                let key = self.inner.key.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = done.cancelled() => {
                            debug!(key = %key, "dropping ack, transaction done");
                        }
                        result = ack_tx.send(ack) => {
                            if result.is_err() {
                                debug!(key = %key, "dropping ack, receiver gone");
                            }
                        }
                    }
                });
            }
        }
    }

    /// Timer J: 64·T1 of retransmit absorption on unreliable transport,
    /// nothing on reliable.
    fn start_timer_j(&self, fsm: &mut ServerFsm) -> Option<ServerInput> {
        let duration = if self.inner.connection.is_reliable() {
            Duration::ZERO
        } else {
            self.inner.endpoint.option.t1x64
        };
        if duration.is_zero() {
            return Some(ServerInput::Delete);
        }
        fsm.timer_j = Some(self
            .inner
            .endpoint
            .timers
            .timeout(duration, TransactionTimer::TimerJ(self.inner.key.clone())));
        None
    }

    fn transition(&self, fsm: &mut ServerFsm, state: ServerState) {
        debug!(key = %self.inner.key, "transition {:?} -> {:?}", fsm.state, state);
        fsm.state = state;
    }

    fn cancel_timer(&self, slot: &mut Option<u64>) {
        if let Some(id) = slot.take() {
            self.inner.endpoint.timers.cancel(id);
        }
    }

    fn terminate_in(&self, fsm: &mut ServerFsm, error: Error) {
        if fsm.state == ServerState::Terminated {
            return;
        }
        self.transition(fsm, ServerState::Terminated);
        if fsm.cleaned_up {
            return;
        }
        fsm.cleaned_up = true;

        self.cancel_timer(&mut fsm.timer_g);
        self.cancel_timer(&mut fsm.timer_h);
        self.cancel_timer(&mut fsm.timer_i);
        self.cancel_timer(&mut fsm.timer_j);
        self.cancel_timer(&mut fsm.timer_l);
        self.cancel_timer(&mut fsm.timer_trying);

        self.inner.last_error.lock().unwrap().get_or_insert(error);
        self.inner.done.cancel();
        self.inner.endpoint.detach_server_transaction(&self.inner.key);
        if let Some(hook) = self.inner.on_terminate.lock().unwrap().take() {
            let error = self.inner.last_error.lock().unwrap().clone();
            hook(&self.inner.key, error.as_ref());
        }
        self.inner.connection.try_close();
        info!(key = %self.inner.key, "server transaction terminated");
    }
}

impl std::fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerTransaction({})", self.inner.key)
    }
}
