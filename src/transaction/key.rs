//! Transaction keys per RFC 3261 section 17.1.3 / 17.2.3, with the
//! RFC 2543 fallback for pre-cookie peers.

use crate::rsip_ext::HeadersViewExt;
use crate::transport::default_port;
use crate::{Error, Result};
use rsip::message::HasHeaders;

pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Separator between key components.
const SEP: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRole {
    Client,
    Server,
}

/// An opaque matching key.
///
/// Two messages belong to the same transaction exactly when their keys are
/// equal; comparison is an exact string match, so the case of the Via
/// transport/host is preserved as received.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey(String);

impl TransactionKey {
    /// The key of the transaction `req` belongs to. ACK and CANCEL match
    /// the INVITE they refer to.
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        Self::compute(req, role, None)
    }

    /// Like [`from_request`](Self::from_request) but matching as if the
    /// CSeq method were `method`. The endpoint uses this to aim a CANCEL at
    /// its INVITE server transaction.
    pub fn from_request_with_method(
        req: &rsip::Request,
        role: TransactionRole,
        method: rsip::Method,
    ) -> Result<Self> {
        Self::compute(req, role, Some(method))
    }

    /// The key of the transaction `resp` belongs to, from the Via/CSeq the
    /// peer copied out of the request.
    pub fn from_response(resp: &rsip::Response, role: TransactionRole) -> Result<Self> {
        Self::compute(resp, role, None)
    }

    fn compute<T: HasHeaders>(
        msg: &T,
        role: TransactionRole,
        override_method: Option<rsip::Method>,
    ) -> Result<Self> {
        let via = msg.top_via()?;
        let cseq = msg.cseq()?;
        let method = override_method.unwrap_or_else(|| method_for_matching(cseq.method));

        let branch = via.branch().map(|b| b.value().to_string());
        match role {
            TransactionRole::Client => {
                let branch = branch
                    .filter(|b| is_rfc3261_branch(b))
                    .ok_or_else(|| Error::TransactionKeyError(
                        "missing or empty branch in top Via".to_string(),
                    ))?;
                Ok(TransactionKey(format!("{}{}{}", branch, SEP, method)))
            }
            TransactionRole::Server => {
                if let Some(branch) = branch.filter(|b| is_rfc3261_branch(b)) {
                    let host = via.uri.host_with_port.host.to_string();
                    let port = via
                        .uri
                        .host_with_port
                        .port
                        .as_ref()
                        .map(|p| *p.value())
                        .unwrap_or_else(|| default_port(via.transport));
                    Ok(TransactionKey(format!(
                        "{}{}{}{}{}{}{}",
                        branch, SEP, host, SEP, port, SEP, method
                    )))
                } else {
                    // RFC 2543 peer: no usable branch, fall back to the
                    // legacy tuple.
                    let from_tag = msg
                        .from_tag()?
                        .map(|t| t.value().to_string())
                        .filter(|t| !t.is_empty())
                        .ok_or_else(|| {
                            Error::TransactionKeyError("missing From tag".to_string())
                        })?;
                    let call_id = msg.call_id()?.to_string();
                    Ok(TransactionKey(format!(
                        "{}{}{}{}{}{}{}{}{}{}",
                        from_tag, SEP, call_id, SEP, method, SEP, cseq.seq, SEP, via, SEP
                    )))
                }
            }
        }
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransactionKey({})", self.0)
    }
}

/// ACK always matches the INVITE it acknowledges. CANCEL keys as itself;
/// the endpoint aims it at the INVITE explicitly via
/// [`TransactionKey::from_request_with_method`].
fn method_for_matching(method: rsip::Method) -> rsip::Method {
    match method {
        rsip::Method::Ack => rsip::Method::Invite,
        other => other,
    }
}

/// A branch complies with RFC 3261 when it is the magic cookie plus a
/// non-empty suffix.
fn is_rfc3261_branch(branch: &str) -> bool {
    branch.starts_with(BRANCH_MAGIC_COOKIE) && branch.len() > BRANCH_MAGIC_COOKIE.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: rsip::Method, via: &str, cseq: &str) -> rsip::Request {
        rsip::Request {
            method,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            version: rsip::Version::V2,
            headers: vec![
                rsip::Header::Via(via.into()),
                rsip::Header::From("<sip:alice@example.com>;tag=fromtag1".into()),
                rsip::Header::To("<sip:bob@example.com>".into()),
                rsip::Header::CallId("callid-1".into()),
                rsip::Header::CSeq(cseq.into()),
            ]
            .into(),
            body: Default::default(),
        }
    }

    #[test]
    fn test_server_key_rfc3261() {
        let invite = request(
            rsip::Method::Invite,
            "SIP/2.0/UDP client.example.com;branch=z9hG4bK74bf9",
            "1 INVITE",
        );
        let key = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
        // Absent Via port is replaced by the transport default.
        assert_eq!(key.to_string(), "z9hG4bK74bf9__client.example.com__5060__INVITE");

        // ACK matches the INVITE it acknowledges.
        let ack = request(
            rsip::Method::Ack,
            "SIP/2.0/UDP client.example.com;branch=z9hG4bK74bf9",
            "1 ACK",
        );
        assert_eq!(
            TransactionKey::from_request(&ack, TransactionRole::Server).unwrap(),
            key
        );

        // A CANCEL keys as its own transaction unless explicitly aimed at
        // the INVITE.
        let cancel = request(
            rsip::Method::Cancel,
            "SIP/2.0/UDP client.example.com;branch=z9hG4bK74bf9",
            "1 CANCEL",
        );
        let cancel_key = TransactionKey::from_request(&cancel, TransactionRole::Server).unwrap();
        assert_eq!(
            cancel_key.to_string(),
            "z9hG4bK74bf9__client.example.com__5060__CANCEL"
        );
    }

    #[test]
    fn test_server_key_keeps_explicit_port() {
        let invite = request(
            rsip::Method::Invite,
            "SIP/2.0/TLS client.example.com:5071;branch=z9hG4bK74bf9",
            "1 INVITE",
        );
        let key = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
        assert_eq!(key.to_string(), "z9hG4bK74bf9__client.example.com__5071__INVITE");
    }

    #[test]
    fn test_server_key_rfc2543_fallback() {
        let invite = request(
            rsip::Method::Invite,
            "SIP/2.0/UDP client.example.com:5060;branch=1",
            "42 INVITE",
        );
        let key = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
        let key = key.to_string();
        assert!(key.starts_with("fromtag1__callid-1__INVITE__42__"), "{}", key);
        assert!(key.ends_with("__"), "{}", key);
    }

    #[test]
    fn test_client_key_requires_branch() {
        let ok = request(
            rsip::Method::Register,
            "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKabc",
            "2 REGISTER",
        );
        let key = TransactionKey::from_request(&ok, TransactionRole::Client).unwrap();
        assert_eq!(key.to_string(), "z9hG4bKabc__REGISTER");

        // The bare magic cookie is not a branch.
        let bare = request(
            rsip::Method::Register,
            "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK",
            "2 REGISTER",
        );
        assert!(TransactionKey::from_request(&bare, TransactionRole::Client).is_err());

        let missing = request(rsip::Method::Register, "SIP/2.0/UDP 127.0.0.1:5060", "2 REGISTER");
        assert!(TransactionKey::from_request(&missing, TransactionRole::Client).is_err());
    }

    #[test]
    fn test_cancel_target_override() {
        let cancel = request(
            rsip::Method::Cancel,
            "SIP/2.0/UDP client.example.com;branch=z9hG4bK74bf9",
            "1 CANCEL",
        );
        let key = TransactionKey::from_request_with_method(
            &cancel,
            TransactionRole::Server,
            rsip::Method::Invite,
        )
        .unwrap();
        assert_eq!(key.to_string(), "z9hG4bK74bf9__client.example.com__5060__INVITE");
    }
}
