//! Read-only views over the `rsip` message model.
//!
//! The state machines only ever consult a handful of header fields: the top
//! Via, From/To tags, Call-ID, CSeq, the route set and Contact. These
//! extension traits provide that access on top of the untyped header list
//! without pulling in the full typed conversion for every header.

use crate::{Error, Result};
use rsip::message::HasHeaders;
use rsip::prelude::{ToTypedHeader, UntypedHeader};
use rsip::Header;

/// Field access shared by requests and responses.
pub trait HeadersViewExt: HasHeaders {
    /// The first Via header of the message, fully parsed.
    fn top_via(&self) -> Result<rsip::typed::Via> {
        for header in self.headers().iter() {
            if let Header::Via(via) = header {
                return via.typed().map_err(Into::into);
            }
        }
        Err(Error::SipMessageError("missing Via header".into()))
    }

    /// The CSeq header, fully parsed.
    fn cseq(&self) -> Result<rsip::typed::CSeq> {
        for header in self.headers().iter() {
            if let Header::CSeq(cseq) = header {
                return cseq.typed().map_err(Into::into);
            }
        }
        Err(Error::SipMessageError("missing CSeq header".into()))
    }

    /// The Call-ID value.
    fn call_id(&self) -> Result<&rsip::headers::CallId> {
        for header in self.headers().iter() {
            if let Header::CallId(call_id) = header {
                return Ok(call_id);
            }
        }
        Err(Error::SipMessageError("missing Call-ID header".into()))
    }

    /// The tag parameter of the From header, if present.
    fn from_tag(&self) -> Result<Option<rsip::param::Tag>> {
        for header in self.headers().iter() {
            if let Header::From(from) = header {
                return from.tag().map_err(Into::into);
            }
        }
        Err(Error::SipMessageError("missing From header".into()))
    }

    /// The tag parameter of the To header, if present.
    fn to_tag(&self) -> Result<Option<rsip::param::Tag>> {
        for header in self.headers().iter() {
            if let Header::To(to) = header {
                return to.tag().map_err(Into::into);
            }
        }
        Err(Error::SipMessageError("missing To header".into()))
    }
}

impl<T: HasHeaders> HeadersViewExt for T {}

/// Response-side views used when building the ACK for a non-2xx final.
pub trait ResponseViewExt {
    /// The Record-Route set of the response in reverse order, merged into a
    /// single Route header value. `None` when the response carries no
    /// Record-Route.
    fn reversed_record_route(&self) -> Option<rsip::headers::Route>;
}

impl ResponseViewExt for rsip::Response {
    fn reversed_record_route(&self) -> Option<rsip::headers::Route> {
        let mut hops: Vec<String> = Vec::new();
        for header in self.headers().iter() {
            if let Header::RecordRoute(rr) = header {
                // A single header line may carry a comma separated list.
                hops.extend(rr.value().split(',').map(|hop| hop.trim().to_string()));
            }
        }
        if hops.is_empty() {
            return None;
        }
        hops.reverse();
        Some(rsip::headers::Route::new(hops.join(", ")))
    }
}
