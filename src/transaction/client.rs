//! Client transactions (RFC 3261 section 17.1, RFC 6026 section 7.2).

use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use super::message::make_non_2xx_ack;
use super::TransactionTimer;
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use rsip::{Request, Response, StatusCodeKind};
use std::cmp;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// States of a client transaction. INVITE and non-INVITE share the enum;
/// `Accepted` is only ever entered by INVITE (RFC 6026).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Calling,
    Proceeding,
    Completed,
    Accepted,
    Terminated,
}

/// One step of FSM input. Timer inputs carry what the expired timer knew;
/// a step may return a follow-up input, and the spin loop runs the chain
/// to completion under the FSM lock.
enum ClientInput {
    Provisional(Response),
    Success(Response),
    Failure(Response),
    TimerA(Duration),
    TimerB,
    TimerD,
    TimerM,
    TransportError(Error),
    Delete,
}

type RetransmissionHandler = Box<dyn Fn(&Response) + Send + Sync>;
type TerminatedHandler = Box<dyn FnOnce(&TransactionKey, Option<&Error>) + Send>;

struct ClientFsm {
    state: ClientState,
    last_response: Option<Response>,
    last_ack: Option<Request>,
    ack_sent_at: Option<Instant>,
    timer_a: Option<u64>,
    timer_b: Option<u64>,
    timer_d: Option<u64>,
    timer_m: Option<u64>,
    cleaned_up: bool,
}

pub(crate) struct ClientInner {
    pub key: TransactionKey,
    pub original: Request,
    invite: bool,
    endpoint: EndpointInnerRef,
    connection: SipConnection,
    destination: Option<SipAddr>,
    fsm: tokio::sync::Mutex<ClientFsm>,
    resp_tx: mpsc::Sender<Response>,
    resp_rx: Mutex<Option<mpsc::Receiver<Response>>>,
    done: CancellationToken,
    last_error: Mutex<Option<Error>>,
    on_retransmission: Mutex<Option<RetransmissionHandler>>,
    on_terminate: Mutex<Option<TerminatedHandler>>,
}

/// A client transaction handle.
///
/// Created by [`Endpoint::request`](super::endpoint::Endpoint::request).
/// Responses matched to this transaction arrive through
/// [`responses`](ClientTransaction::responses); the transaction retransmits
/// the request over unreliable transport, times out on Timer B, and for
/// INVITE acknowledges non-2xx finals itself. Once a terminal state is
/// reached [`done`](ClientTransaction::done) resolves and
/// [`err`](ClientTransaction::err) carries the terminal error.
#[derive(Clone)]
pub struct ClientTransaction {
    pub(crate) inner: Arc<ClientInner>,
}

impl ClientTransaction {
    pub(crate) fn new(
        endpoint: EndpointInnerRef,
        key: TransactionKey,
        original: Request,
        connection: SipConnection,
        destination: Option<SipAddr>,
    ) -> Self {
        let invite = original.method == rsip::Method::Invite;
        // Rendezvous channel: the FSM hands each response directly to the
        // consumer, gated by the done token.
        let (resp_tx, resp_rx) = mpsc::channel(1);
        connection.add_ref();
        info!(key = %key, invite, "client transaction created");
        ClientTransaction {
            inner: Arc::new(ClientInner {
                key,
                original,
                invite,
                endpoint,
                connection,
                destination,
                fsm: tokio::sync::Mutex::new(ClientFsm {
                    state: ClientState::Calling,
                    last_response: None,
                    last_ack: None,
                    ack_sent_at: None,
                    timer_a: None,
                    timer_b: None,
                    timer_d: None,
                    timer_m: None,
                    cleaned_up: false,
                }),
                resp_tx,
                resp_rx: Mutex::new(Some(resp_rx)),
                done: CancellationToken::new(),
                last_error: Mutex::new(None),
                on_retransmission: Mutex::new(None),
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

    /// The resolved address the request was sent to.
    pub fn destination(&self) -> Option<&SipAddr> {
        self.inner.destination.as_ref()
    }

    pub async fn state(&self) -> ClientState {
        self.inner.fsm.lock().await.state
    }

    /// Write the request and arm the timers: A (retransmit, unreliable
    /// only) and B (timeout). A write failure terminates the transaction
    /// immediately with a transport error.
    pub async fn send(&self) -> Result<()> {
        let mut fsm = self.inner.fsm.lock().await;
        debug!(key = %self.inner.key, "sending request");
        if let Err(e) = self
            .inner
            .connection
            .send(self.inner.original.clone().into(), self.inner.destination.as_ref())
            .await
        {
            let error = Error::TransactionTransport(e.to_string(), self.inner.key.clone());
            self.terminate_in(&mut fsm, error.clone());
            return Err(error);
        }

        let option = &self.inner.endpoint.option;
        if !self.inner.connection.is_reliable() {
            fsm.timer_a = Some(self.inner.endpoint.timers.timeout(
                option.t1,
                TransactionTimer::TimerA(self.inner.key.clone(), option.t1),
            ));
        }
        fsm.timer_b = Some(self.inner.endpoint.timers.timeout(
            option.t1x64,
            TransactionTimer::TimerB(self.inner.key.clone()),
        ));
        Ok(())
    }

    /// Feed a matched response into the FSM.
    pub async fn receive(&self, response: Response) -> Result<()> {
        let input = match response.status_code.kind() {
            StatusCodeKind::Provisional => ClientInput::Provisional(response),
            StatusCodeKind::Successful => ClientInput::Success(response),
            _ => ClientInput::Failure(response),
        };
        self.spin(input).await
    }

    /// The response channel. There is no backlog: the FSM waits on the
    /// consumer (or the done token) for every message. `None` once taken.
    pub fn responses(&self) -> Option<mpsc::Receiver<Response>> {
        self.inner.resp_rx.lock().unwrap().take()
    }

    /// Resolves when the transaction reaches a terminal state.
    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// The terminal error. `None` while the transaction is live.
    pub fn err(&self) -> Option<Error> {
        self.inner.last_error.lock().unwrap().clone()
    }

    /// Observe 2xx retransmissions absorbed in the Accepted state
    /// (RFC 6026). They are never re-delivered through
    /// [`responses`](ClientTransaction::responses).
    pub fn set_on_retransmission<F>(&self, handler: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.inner
            .on_retransmission
            .lock()
            .unwrap()
            .replace(Box::new(handler));
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

    /// Force the transaction into the terminated state. Idempotent.
    pub async fn terminate(&self) {
        // Settle the terminal error and unblock any rendezvous in flight
        // before taking the FSM lock.
        self.inner
            .last_error
            .lock()
            .unwrap()
            .get_or_insert_with(|| Error::TransactionTerminated(self.inner.key.clone()));
        self.inner.done.cancel();
        self.spin(ClientInput::Delete).await.ok();
    }

    pub(crate) async fn on_timer(&self, timer: TransactionTimer) -> Result<()> {
        let input = match timer {
            TransactionTimer::TimerA(_, duration) => ClientInput::TimerA(duration),
            TransactionTimer::TimerB(_) => ClientInput::TimerB,
            TransactionTimer::TimerD(_) => ClientInput::TimerD,
            TransactionTimer::TimerM(_) => ClientInput::TimerM,
            _ => return Ok(()),
        };
        self.spin(input).await
    }

    /// Run one input, and whatever it chains into, under the FSM lock.
    /// Returns the first transport error the chain produced.
    async fn spin(&self, input: ClientInput) -> Result<()> {
        let mut fsm = self.inner.fsm.lock().await;
        let mut first_error = None;
        let mut next = Some(input);
        while let Some(input) = next {
            if let ClientInput::TransportError(ref e) = input {
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

    /// Non-INVITE FSM (RFC 3261 section 17.1.2).
    async fn step(&self, fsm: &mut ClientFsm, input: ClientInput) -> Option<ClientInput> {
        use ClientInput::*;
        use ClientState::*;
        match (fsm.state, input) {
            (Calling, Provisional(response)) => {
                self.cancel_timer(&mut fsm.timer_a);
                self.transition(fsm, Proceeding);
                self.pass_up(fsm, response).await;
                None
            }
            (Proceeding, Provisional(response)) => {
                self.pass_up(fsm, response).await;
                None
            }
            (Calling | Proceeding, Success(response)) | (Calling | Proceeding, Failure(response)) => {
                self.cancel_timer(&mut fsm.timer_a);
                self.cancel_timer(&mut fsm.timer_b);
                self.transition(fsm, Completed);
                self.pass_up(fsm, response).await;
                self.start_completed_linger(fsm)
            }
            (Calling | Proceeding, TimerA(duration)) => {
                if let Err(e) = self
                    .inner
                    .connection
                    .send(self.inner.original.clone().into(), self.inner.destination.as_ref())
                    .await
                {
                    return Some(TransportError(Error::TransactionTransport(
                        e.to_string(),
                        self.inner.key.clone(),
                    )));
                }
                let next = cmp::min(duration * 2, self.inner.endpoint.option.t2);
                fsm.timer_a = Some(self.inner.endpoint.timers.timeout(
                    next,
                    TransactionTimer::TimerA(self.inner.key.clone(), next),
                ));
                None
            }
            (Calling | Proceeding, TimerB) => {
                self.terminate_in(fsm, Error::TransactionTimeout(self.inner.key.clone()));
                None
            }
            (Completed, TimerD) => {
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

    /// INVITE FSM (RFC 3261 section 17.1.1 with the RFC 6026 Accepted
    /// state).
    async fn step_invite(&self, fsm: &mut ClientFsm, input: ClientInput) -> Option<ClientInput> {
        use ClientInput::*;
        use ClientState::*;
        match (fsm.state, input) {
            (Calling, Provisional(response)) => {
                self.cancel_timer(&mut fsm.timer_a);
                self.cancel_timer(&mut fsm.timer_b);
                self.transition(fsm, Proceeding);
                self.pass_up(fsm, response).await;
                None
            }
            (Proceeding, Provisional(response)) => {
                self.pass_up(fsm, response).await;
                None
            }
            (Calling | Proceeding, Success(response)) => {
                self.cancel_timer(&mut fsm.timer_a);
                self.cancel_timer(&mut fsm.timer_b);
                self.transition(fsm, Accepted);
                self.pass_up(fsm, response).await;
                fsm.timer_m = Some(self.inner.endpoint.timers.timeout(
                    self.inner.endpoint.option.t1x64,
                    TransactionTimer::TimerM(self.inner.key.clone()),
                ));
                None
            }
            (Calling | Proceeding, Failure(response)) => {
                self.cancel_timer(&mut fsm.timer_a);
                self.cancel_timer(&mut fsm.timer_b);
                self.transition(fsm, Completed);
                let ack = match make_non_2xx_ack(&self.inner.original, &response) {
                    Ok(ack) => ack,
                    Err(e) => {
                        warn!(key = %self.inner.key, "failed to build ack: {}", e);
                        self.pass_up(fsm, response).await;
                        return self.start_completed_linger(fsm);
                    }
                };
                // The ACK goes to the address the INVITE actually went to,
                // not wherever Contact would resolve.
                if let Err(e) = self
                    .inner
                    .connection
                    .send(ack.clone().into(), self.inner.destination.as_ref())
                    .await
                {
                    return Some(TransportError(Error::TransactionTransport(
                        e.to_string(),
                        self.inner.key.clone(),
                    )));
                }
                fsm.last_ack = Some(ack);
                fsm.ack_sent_at = Some(Instant::now());
                self.pass_up(fsm, response).await;
                self.start_completed_linger(fsm)
            }
            (Completed, Failure(_)) => {
                // A retransmitted final retriggers the ACK, but not more
                // often than once per T2.
                let cooled_down = fsm
                    .ack_sent_at
                    .map(|at| at.elapsed() >= self.inner.endpoint.option.t2)
                    .unwrap_or(true);
                if let Some(ack) = fsm.last_ack.clone() {
                    if cooled_down {
                        if let Err(e) = self
                            .inner
                            .connection
                            .send(ack.into(), self.inner.destination.as_ref())
                            .await
                        {
                            return Some(TransportError(Error::TransactionTransport(
                                e.to_string(),
                                self.inner.key.clone(),
                            )));
                        }
                        fsm.ack_sent_at = Some(Instant::now());
                    }
                }
                None
            }
            (Calling | Proceeding, TimerA(duration)) => {
                if let Err(e) = self
                    .inner
                    .connection
                    .send(self.inner.original.clone().into(), self.inner.destination.as_ref())
                    .await
                {
                    return Some(TransportError(Error::TransactionTransport(
                        e.to_string(),
                        self.inner.key.clone(),
                    )));
                }
                // INVITE retransmits double without the T2 cap.
                let next = duration * 2;
                fsm.timer_a = Some(self.inner.endpoint.timers.timeout(
                    next,
                    TransactionTimer::TimerA(self.inner.key.clone(), next),
                ));
                None
            }
            (Calling | Proceeding, TimerB) => {
                self.terminate_in(fsm, Error::TransactionTimeout(self.inner.key.clone()));
                None
            }
            (Completed, TimerD) => {
                self.terminate_in(fsm, Error::TransactionTerminated(self.inner.key.clone()));
                None
            }
            (Accepted, Success(response)) => {
                // RFC 6026: a 2xx retransmission never reaches the primary
                // channel again.
                match self.inner.on_retransmission.lock().unwrap().as_ref() {
                    Some(handler) => handler(&response),
                    None => {
                        debug!(key = %self.inner.key, "dropping 2xx retransmission in accepted state")
                    }
                }
                None
            }
            (Accepted, Provisional(_)) => None,
            (Accepted, TransportError(error)) => {
                // Keep waiting for retransmissions; the dialog layer owns
                // delivery of the 2xx ACK.
                warn!(key = %self.inner.key, "transport error in accepted state: {}", error);
                None
            }
            (Accepted, TimerM) => {
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

    /// Hand a response to the consumer, racing the done token so a gone
    /// consumer cannot wedge the FSM forever.
    async fn pass_up(&self, fsm: &mut ClientFsm, response: Response) {
        fsm.last_response = Some(response.clone());
        tokio::select! {
            _ = self.inner.done.cancelled() => {
                info!(key = %self.inner.key, "dropping response, transaction done");
            }
            result = self.inner.resp_tx.send(response) => {
                if result.is_err() {
                    info!(key = %self.inner.key, "dropping response, receiver gone");
                }
            }
        }
    }

    /// Timer D: 32s of lingering on unreliable transport, nothing on
    /// reliable (Completed terminates on entry).
    fn start_completed_linger(&self, fsm: &mut ClientFsm) -> Option<ClientInput> {
        let duration = if self.inner.connection.is_reliable() {
            Duration::ZERO
        } else {
            self.inner.endpoint.option.timer_d
        };
        if duration.is_zero() {
            return Some(ClientInput::Delete);
        }
        fsm.timer_d = Some(self
            .inner
            .endpoint
            .timers
            .timeout(duration, TransactionTimer::TimerD(self.inner.key.clone())));
        None
    }

    fn transition(&self, fsm: &mut ClientFsm, state: ClientState) {
        debug!(key = %self.inner.key, "transition {:?} -> {:?}", fsm.state, state);
        fsm.state = state;
    }

    fn cancel_timer(&self, slot: &mut Option<u64>) {
        if let Some(id) = slot.take() {
            self.inner.endpoint.timers.cancel(id);
        }
    }

    fn terminate_in(&self, fsm: &mut ClientFsm, error: Error) {
        if fsm.state == ClientState::Terminated {
            return;
        }
        self.transition(fsm, ClientState::Terminated);
        if fsm.cleaned_up {
            return;
        }
        fsm.cleaned_up = true;

        self.cancel_timer(&mut fsm.timer_a);
        self.cancel_timer(&mut fsm.timer_b);
        self.cancel_timer(&mut fsm.timer_d);
        self.cancel_timer(&mut fsm.timer_m);

        self.inner.last_error.lock().unwrap().get_or_insert(error);
        self.inner.done.cancel();
        self.inner.endpoint.detach_client_transaction(&self.inner.key);
        if let Some(hook) = self.inner.on_terminate.lock().unwrap().take() {
            let error = self.inner.last_error.lock().unwrap().clone();
            hook(&self.inner.key, error.as_ref());
        }
        self.inner.connection.try_close();
        info!(key = %self.inner.key, "client transaction terminated");
    }
}

impl std::fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientTransaction({})", self.inner.key)
    }
}
