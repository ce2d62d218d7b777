use super::{endpoint::EndpointInner, make_branch, make_call_id};
use crate::rsip_ext::{HeadersViewExt, ResponseViewExt};
use crate::Result;
use rsip::prelude::HeadersExt;
use rsip::{Header, Request, Response, StatusCode};

impl EndpointInner {
    /// Create a transaction-ready SIP request.
    ///
    /// [`Endpoint::request`](super::endpoint::Endpoint::request) refuses a
    /// request whose top Via lacks an RFC 3261 branch, so a branch is
    /// generated here when the caller's Via carries none. The mandatory
    /// headers go out in the RFC 3261 section 8.1.1 order (Via, From, To,
    /// Call-ID, CSeq, Max-Forwards), followed by this endpoint's
    /// User-Agent and a Content-Length for the empty body; callers append
    /// the rest and replace Content-Length when they attach one.
    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        mut via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> rsip::Request {
        if via.branch().is_none() {
            via.params.push(rsip::Param::Branch(make_branch()));
        }
        let headers = vec![
            Header::Via(via.into()),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CallId(make_call_id(self.option.callid_suffix.as_deref())),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
            Header::ContentLength(0.into()),
        ];
        rsip::Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    /// Create a response to `req`.
    ///
    /// Copies the headers a response must mirror (every Via, Record-Route,
    /// Call-ID, From, To, CSeq), stamps User-Agent and Content-Length, and
    /// leaves everything else out.
    pub fn make_response(&self, req: &Request, status_code: StatusCode, body: Option<Vec<u8>>) -> Response {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::RecordRoute(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
            )
        });
        headers.unique_push(Header::UserAgent(self.user_agent.clone().into()));
        let body = body.unwrap_or_default();
        headers.unique_push(Header::ContentLength((body.len() as u32).into()));
        Response {
            status_code,
            version: req.version.clone(),
            headers,
            body,
        }
    }
}

/// The ACK acknowledging a non-2xx final response, per RFC 3261
/// section 17.1.1.3.
///
/// It reuses the origin's Request-URI and top Via (same branch, no new
/// hop), takes To from the response so the peer's tag is captured, and
/// routes like the origin did: the origin's Route set when present, else
/// the reversed Record-Route of the response.
pub(crate) fn make_non_2xx_ack(original: &Request, response: &Response) -> Result<Request> {
    let mut headers: Vec<Header> = Vec::with_capacity(8);

    let via = original
        .headers
        .iter()
        .find_map(|h| match h {
            Header::Via(via) => Some(via.clone()),
            _ => None,
        })
        .ok_or_else(|| crate::Error::SipMessageError("missing Via header".into()))?;
    headers.push(Header::Via(via));

    let routes: Vec<Header> = original
        .headers
        .iter()
        .filter(|h| matches!(h, Header::Route(_)))
        .cloned()
        .collect();
    if !routes.is_empty() {
        headers.extend(routes);
    } else if let Some(route) = response.reversed_record_route() {
        headers.push(Header::Route(route));
    }

    headers.push(Header::MaxForwards(70.into()));
    headers.push(Header::From(original.from_header()?.clone()));
    headers.push(Header::To(response.to_header()?.clone()));
    headers.push(Header::CallId(original.call_id_header()?.clone()));

    let cseq = original.cseq()?;
    headers.push(Header::CSeq(
        rsip::typed::CSeq {
            seq: cseq.seq,
            method: rsip::Method::Ack,
        }
        .into(),
    ));

    if let Some(contact) = original.headers.iter().find_map(|h| match h {
        Header::Contact(contact) => Some(contact.clone()),
        _ => None,
    }) {
        headers.push(Header::Contact(contact));
    }
    headers.push(Header::ContentLength(0.into()));

    Ok(Request {
        method: rsip::Method::Ack,
        uri: original.uri.clone(),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    })
}
