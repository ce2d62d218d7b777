use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the transaction and transport layers.
///
/// Terminal transaction errors (`TransactionTimeout`, `TransactionTransport`,
/// `TransactionTerminated`, `TransactionCanceled`) are stored on the
/// transaction once and surfaced again through
/// [`err()`](crate::transaction::ClientTransaction::err), so the type is
/// cheap to clone.
#[derive(Debug, Clone)]
pub enum Error {
    Error(String),
    SipMessageError(String),
    TransactionKeyError(String),
    TransactionError(String, TransactionKey),
    /// A connection write failed; wraps the underlying cause.
    TransactionTransport(String, TransactionKey),
    /// Timer B, H or M fired before the transaction could complete.
    TransactionTimeout(TransactionKey),
    /// The transaction was terminated, either explicitly or by a linger
    /// timer running out.
    TransactionTerminated(TransactionKey),
    /// An incoming CANCEL ended an INVITE server transaction.
    TransactionCanceled(TransactionKey),
    TransportLayerError(String, SipAddr),
    /// The serialized message exceeds what fits into a single UDP datagram.
    UdpMtuCongestion(usize, usize),
    DnsResolutionError(String),
    EndpointError(String),
}

impl Error {
    /// True for any write failure surfaced by a connection, regardless of
    /// the wrapped cause.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::TransactionTransport(_, _))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TransactionTimeout(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Error::TransactionTerminated(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::TransactionCanceled(_))
    }

    /// The key of the transaction this error belongs to, if any.
    pub fn transaction_key(&self) -> Option<&TransactionKey> {
        match self {
            Error::TransactionError(_, key)
            | Error::TransactionTransport(_, key)
            | Error::TransactionTimeout(key)
            | Error::TransactionTerminated(key)
            | Error::TransactionCanceled(key) => Some(key),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Error(msg) => write!(f, "{}", msg),
            Error::SipMessageError(msg) => write!(f, "sip message error: {}", msg),
            Error::TransactionKeyError(msg) => write!(f, "transaction key error: {}", msg),
            Error::TransactionError(msg, key) => write!(f, "transaction error: {} ({})", msg, key),
            Error::TransactionTransport(msg, key) => {
                write!(f, "transaction transport error: {} ({})", msg, key)
            }
            Error::TransactionTimeout(key) => write!(f, "transaction timeout ({})", key),
            Error::TransactionTerminated(key) => write!(f, "transaction terminated ({})", key),
            Error::TransactionCanceled(key) => write!(f, "transaction canceled ({})", key),
            Error::TransportLayerError(msg, addr) => {
                write!(f, "transport layer error: {} ({})", msg, addr)
            }
            Error::UdpMtuCongestion(size, limit) => {
                write!(f, "udp message of {} bytes exceeds mtu budget of {}", size, limit)
            }
            Error::DnsResolutionError(msg) => write!(f, "dns resolution error: {}", msg),
            Error::EndpointError(msg) => write!(f, "endpoint error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Error(e.to_string())
    }
}

#[cfg(feature = "websocket")]
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Error(e.to_string())
    }
}
