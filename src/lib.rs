//! # siptx
//!
//! A SIP transaction layer for building SIP applications in Rust.
//!
//! `siptx` sits between a SIP transport (UDP/TCP/TLS/WS/WSS) and the
//! transaction user, implementing the client and server transaction state
//! machines of RFC 3261 section 17 together with the RFC 6026 update for
//! INVITE 2xx handling. Message parsing is delegated to the
//! [`rsip`](https://crates.io/crates/rsip) crate; this crate makes a single
//! request/response exchange reliable over unreliable transport, suppresses
//! duplicates, drives retransmissions and exposes a small API to the layer
//! above.
//!
//! # Architecture
//!
//! * [`transport`] - the `SipConnection` abstraction, per-transport
//!   demultiplexers and the connection pool
//! * [`transaction`] - transaction keys, stores, the client/server state
//!   machines and the [`Endpoint`](transaction::endpoint::Endpoint) that
//!   ties them together
//!
//! # Example
//!
//! ```rust,no_run
//! use siptx::transaction::endpoint::EndpointBuilder;
//!
//! # async fn example() -> siptx::Result<()> {
//! let endpoint = EndpointBuilder::new().with_user_agent("myapp/1.0").build();
//!
//! let mut incoming = endpoint.incoming_transactions()?;
//! tokio::select! {
//!     _ = endpoint.serve() => {}
//!     _tx = incoming.recv() => {
//!         // hand the new server transaction to the application
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod error;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;

pub use error::{Error, Result};

pub const USER_AGENT: &str = concat!("siptx/", env!("CARGO_PKG_VERSION"));
