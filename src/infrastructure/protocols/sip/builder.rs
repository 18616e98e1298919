//! SIP message builders and identifier generation

use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Request, Response, StatusCode, Uri, Version};
use uuid::Uuid;

/// Magic cookie every RFC 3261 branch starts with
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Fresh Via branch
pub fn make_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, random_token(16))
}

/// Fresh From/To tag
pub fn make_tag() -> String {
    random_token(10)
}

/// Fresh Call-ID, qualified with the local host
pub fn make_call_id(host: &str) -> String {
    format!("{}@{}", Uuid::new_v4().simple(), host)
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn ringing() -> Self {
        Self::new(180)
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn call_does_not_exist() -> Self {
        Self::new(481)
    }

    pub fn request_terminated() -> Self {
        Self::new(487)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    pub fn not_implemented() -> Self {
        Self::new(501)
    }

    /// Overrides the default reason phrase
    pub fn reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    /// Local tag for the To header, unless the request already carries one
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn contact(self, uri: &str) -> Self {
        self.header(Header::Contact(rsip::headers::Contact::new(format!(
            "<{}>",
            uri
        ))))
    }

    pub fn user_agent(self, user_agent: &str) -> Self {
        self.header(Header::UserAgent(user_agent.into()))
    }

    pub fn body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.headers
            .push(Header::ContentType(content_type.into()));
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_)
                | Header::From(_)
                | Header::CallId(_)
                | Header::CSeq(_)
                | Header::RecordRoute(_) => {
                    headers.push(header.clone());
                }
                Header::To(to) => match &self.to_tag {
                    Some(tag) if request.to_tag().is_none() => {
                        headers.push(Header::To(rsip::headers::To::new(format!(
                            "{};tag={}",
                            to.value(),
                            tag
                        ))));
                    }
                    _ => headers.push(header.clone()),
                },
                _ => {}
            }
        }

        if !headers.iter().any(|h| matches!(h, Header::Via(_))) {
            return Err(SipError::InvalidMessage(
                "request has no Via header".to_string(),
            ));
        }

        headers.extend(self.headers);
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let status_code = match self.reason {
            Some(reason) => StatusCode::Other(self.status_code, reason),
            None => StatusCode::from(self.status_code),
        };

        let response = Response {
            status_code,
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Build an outbound SIP request header by header
pub struct RequestBuilder {
    method: SipMethod,
    uri: Uri,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Via with the given branch, asking for `rport`
    pub fn via(self, transport: &str, sent_by: &str, branch: &str) -> Self {
        self.header(Header::Via(rsip::headers::Via::new(format!(
            "SIP/2.0/{} {};branch={};rport",
            transport, sent_by, branch
        ))))
    }

    pub fn from(self, uri: &str, tag: &str) -> Self {
        self.header(Header::From(rsip::headers::From::new(format!(
            "<{}>;tag={}",
            uri, tag
        ))))
    }

    pub fn to(self, uri: &str, tag: Option<&str>) -> Self {
        let value = match tag {
            Some(tag) => format!("<{}>;tag={}", uri, tag),
            None => format!("<{}>", uri),
        };
        self.header(Header::To(rsip::headers::To::new(value)))
    }

    pub fn call_id(self, call_id: &str) -> Self {
        self.header(Header::CallId(call_id.into()))
    }

    pub fn cseq(self, seq: u32, method: SipMethod) -> Self {
        self.header(Header::CSeq(rsip::headers::CSeq::new(format!(
            "{} {}",
            seq, method
        ))))
    }

    pub fn max_forwards(self, hops: u32) -> Self {
        self.header(Header::MaxForwards(hops.into()))
    }

    pub fn contact(self, uri: &str) -> Self {
        self.header(Header::Contact(rsip::headers::Contact::new(format!(
            "<{}>",
            uri
        ))))
    }

    pub fn route(self, route: &str) -> Self {
        self.header(Header::Route(rsip::headers::Route::new(route)))
    }

    pub fn user_agent(self, user_agent: &str) -> Self {
        self.header(Header::UserAgent(user_agent.into()))
    }

    pub fn expires(self, seconds: u32) -> Self {
        self.header(Header::Expires(rsip::headers::Expires::from(seconds)))
    }

    pub fn body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.headers
            .push(Header::ContentType(content_type.into()));
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build(mut self) -> SipRequest {
        self.headers
            .push(Header::ContentLength(self.body.len().to_string().into()));

        SipRequest::new(Request {
            method: self.method.to_rsip(),
            uri: self.uri,
            version: Version::V2,
            headers: Headers::from(self.headers),
            body: self.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn invite() -> SipRequest {
        let uri = Uri::try_from("sip:server@example.org").unwrap();
        RequestBuilder::new(SipMethod::Invite, uri)
            .via("UDP", "10.0.0.2:5060", "z9hG4bKabc")
            .max_forwards(70)
            .from("sip:client@example.org", "ftag")
            .to("sip:server@example.org", None)
            .call_id("cid@10.0.0.2")
            .cseq(1, SipMethod::Invite)
            .contact("sip:client@10.0.0.2:5060")
            .build()
    }

    #[test]
    fn test_request_round_trips_through_parser() {
        let bytes = invite().to_bytes();
        let parsed = SipRequest::parse(&bytes).unwrap();

        assert_eq!(parsed.method(), Some(SipMethod::Invite));
        assert_eq!(parsed.branch(), Some("z9hG4bKabc".to_string()));
        assert_eq!(parsed.from_tag(), Some("ftag".to_string()));
        assert_eq!(parsed.to_tag(), None);
        assert_eq!(parsed.cseq(), Some(1));
        assert_eq!(parsed.call_id(), Some("cid@10.0.0.2".to_string()));
    }

    #[test]
    fn test_response_adds_to_tag() {
        let response = ResponseBuilder::ringing()
            .to_tag("ttag")
            .contact("sip:server@10.0.0.3:5070")
            .build_for_request(&invite())
            .unwrap();

        let parsed = SipResponse::parse(&response.to_bytes()).unwrap();
        assert_eq!(parsed.status_code(), 180);
        assert_eq!(parsed.to_tag(), Some("ttag".to_string()));
        assert_eq!(parsed.branch(), Some("z9hG4bKabc".to_string()));
        assert_eq!(parsed.cseq_method(), Some(SipMethod::Invite));
    }

    #[test]
    fn test_reason_override() {
        let response = ResponseBuilder::new(486)
            .reason("Busy Here Now")
            .build_for_request(&invite())
            .unwrap();
        assert_eq!(response.status_code(), 486);
        assert!(String::from_utf8_lossy(&response.to_bytes()).starts_with("SIP/2.0 486 Busy Here Now"));
    }

    #[test]
    fn test_identifiers_are_unique() {
        let branches: HashSet<String> = (0..1000).map(|_| make_branch()).collect();
        let tags: HashSet<String> = (0..1000).map(|_| make_tag()).collect();
        let call_ids: HashSet<String> = (0..1000).map(|_| make_call_id("10.0.0.2")).collect();

        assert_eq!(branches.len(), 1000);
        assert_eq!(tags.len(), 1000);
        assert_eq!(call_ids.len(), 1000);
        assert!(branches.iter().all(|b| b.starts_with(BRANCH_MAGIC_COOKIE)));
    }
}
