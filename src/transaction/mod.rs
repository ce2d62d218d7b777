//! SIP Transaction Layer.
//!
//! Implements the four transaction state machines of RFC 3261 section 17
//! (client/server, INVITE/non-INVITE) with the RFC 6026 "Accepted" states,
//! and the [`Endpoint`](endpoint::Endpoint) that routes messages between
//! the transport layer and live transactions.
//!
//! A transaction is created either by
//! [`Endpoint::request`](endpoint::Endpoint::request) (client side) or by
//! the endpoint when an unmatched request arrives (server side, surfaced
//! through [`Endpoint::incoming_transactions`](endpoint::Endpoint::incoming_transactions)).
//! It lives until a terminal state is reached; at that point its done token
//! fires, its terminal error is set, and the store entry is dropped.

use key::TransactionKey;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::time::Duration;

pub mod client;
pub mod endpoint;
pub mod key;
pub(crate) mod message;
pub mod server;
pub mod store;
pub mod timer;

#[cfg(test)]
mod tests;

pub use client::ClientTransaction;
pub use server::ServerTransaction;

/// A pending timer owned by one transaction. The key routes the expiry
/// back to its owner; retransmit timers carry the interval to double on
/// the next rearm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionTimer {
    /// Client request retransmit (also used by non-INVITE clients).
    TimerA(TransactionKey, Duration),
    /// Client transaction timeout.
    TimerB(TransactionKey),
    /// Client completed-state linger.
    TimerD(TransactionKey),
    /// Client accepted-state linger (RFC 6026).
    TimerM(TransactionKey),
    /// Server INVITE final-response retransmit.
    TimerG(TransactionKey, Duration),
    /// Server INVITE ACK-wait timeout.
    TimerH(TransactionKey),
    /// Server INVITE confirmed-state linger.
    TimerI(TransactionKey),
    /// Server non-INVITE completed-state linger.
    TimerJ(TransactionKey),
    /// Server INVITE accepted-state linger (RFC 6026).
    TimerL(TransactionKey),
    /// Automatic 100 Trying for INVITE server transactions.
    Timer100(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerM(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerL(key)
            | TransactionTimer::Timer100(key) => key,
        }
    }

    /// Whether the expiry belongs to a client transaction (else server).
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionTimer::TimerA(_, _)
                | TransactionTimer::TimerB(_)
                | TransactionTimer::TimerD(_)
                | TransactionTimer::TimerM(_)
        )
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::TimerA(key, duration) => {
                write!(f, "TimerA({}, {:?})", key, duration)
            }
            TransactionTimer::TimerB(key) => write!(f, "TimerB({})", key),
            TransactionTimer::TimerD(key) => write!(f, "TimerD({})", key),
            TransactionTimer::TimerM(key) => write!(f, "TimerM({})", key),
            TransactionTimer::TimerG(key, duration) => {
                write!(f, "TimerG({}, {:?})", key, duration)
            }
            TransactionTimer::TimerH(key) => write!(f, "TimerH({})", key),
            TransactionTimer::TimerI(key) => write!(f, "TimerI({})", key),
            TransactionTimer::TimerJ(key) => write!(f, "TimerJ({})", key),
            TransactionTimer::TimerL(key) => write!(f, "TimerL({})", key),
            TransactionTimer::Timer100(key) => write!(f, "Timer100({})", key),
        }
    }
}

pub(crate) fn random_text(count: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

/// A fresh To/From tag value.
pub fn make_tag() -> rsip::param::Tag {
    rsip::param::Tag::new(random_text(8))
}

/// A fresh RFC 3261 branch: the magic cookie plus a random suffix.
pub fn make_branch() -> rsip::param::Branch {
    rsip::param::Branch::new(format!("{}{}", key::BRANCH_MAGIC_COOKIE, random_text(12)))
}

/// A fresh Call-ID, optionally qualified with `@suffix`.
pub fn make_call_id(suffix: Option<&str>) -> rsip::headers::CallId {
    match suffix {
        Some(suffix) => format!("{}@{}", random_text(16), suffix).into(),
        None => random_text(16).into(),
    }
}
