//! SIP message types and parsing

use bytes::Bytes;
use rsip::headers::UntypedHeader;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Transaction is mid-send and cannot be terminated yet
    #[error("Transaction in use: {0}")]
    TransactionInUse(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            Method::Update => Some(SipMethod::Update),
            Method::PRack => Some(SipMethod::Prack),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            Method::Publish => Some(SipMethod::Publish),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Prack => Method::PRack,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Publish => Method::Publish,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// Replaces the body and its Content-Type / Content-Length headers
    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) {
        self.inner
            .headers
            .unique_push(Header::ContentType(content_type.into()));
        self.inner
            .headers
            .unique_push(Header::ContentLength(body.len().to_string().into()));
        self.inner.body = body;
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner
            .call_id_header()
            .ok()
            .map(|h| h.value().to_string())
    }

    pub fn from_tag(&self) -> Option<String> {
        let tag = self.inner.from_header().ok()?.tag().ok()??;
        Some(tag.value().to_string())
    }

    pub fn to_tag(&self) -> Option<String> {
        let tag = self.inner.to_header().ok()?.tag().ok()??;
        Some(tag.value().to_string())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.inner.cseq_header().ok()?.seq().ok()
    }

    /// Branch parameter of the topmost Via
    pub fn branch(&self) -> Option<String> {
        let via = self.inner.via_header().ok()?.typed().ok()?;
        via.branch().map(|b| b.to_string())
    }

    pub fn from_uri(&self) -> Option<Uri> {
        Some(self.inner.from_header().ok()?.typed().ok()?.uri)
    }

    pub fn to_uri(&self) -> Option<Uri> {
        Some(self.inner.to_header().ok()?.typed().ok()?.uri)
    }

    /// URI of the first Contact header
    pub fn contact_uri(&self) -> Option<Uri> {
        Some(self.inner.contact_header().ok()?.typed().ok()?.uri)
    }

    /// Record-Route values in the order they appear
    pub fn record_routes(&self) -> Vec<String> {
        record_routes(&self.inner.headers)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

fn record_routes(headers: &Headers) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| match h {
            Header::RecordRoute(rr) => Some(rr.value()),
            _ => None,
        })
        // One header may carry several comma separated entries
        .flat_map(|value| value.split(','))
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// SIP Response wrapper
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner
            .call_id_header()
            .ok()
            .map(|h| h.value().to_string())
    }

    pub fn to_tag(&self) -> Option<String> {
        let tag = self.inner.to_header().ok()?.tag().ok()??;
        Some(tag.value().to_string())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.inner.cseq_header().ok()?.seq().ok()
    }

    /// Method named in the CSeq header
    pub fn cseq_method(&self) -> Option<SipMethod> {
        let method = self.inner.cseq_header().ok()?.method().ok()?;
        SipMethod::from_rsip(&method)
    }

    pub fn branch(&self) -> Option<String> {
        let via = self.inner.via_header().ok()?.typed().ok()?;
        via.branch().map(|b| b.to_string())
    }

    /// URI of the first Contact header
    pub fn contact_uri(&self) -> Option<Uri> {
        Some(self.inner.contact_header().ok()?.typed().ok()?.uri)
    }

    /// Record-Route values in the order they appear
    pub fn record_routes(&self) -> Vec<String> {
        record_routes(&self.inner.headers)
    }

    /// Expires header value in seconds
    pub fn expires(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Expires(expires) => expires.value().trim().parse().ok(),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<String> {
        match self {
            SipMessage::Request(req) => req.call_id(),
            SipMessage::Response(resp) => resp.call_id(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:server@example.org SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK776asdhds;rport\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:client@example.org>;tag=1928301774\r\n\
        To: <sip:server@example.org>\r\n\
        Call-ID: a84b4c76e66710@10.0.0.2\r\n\
        CSeq: 1 INVITE\r\n\
        Contact: <sip:client@10.0.0.2:5060>\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_invite_request() {
        let msg = SipMessage::parse(INVITE).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Invite));
        assert_eq!(req.call_id(), Some("a84b4c76e66710@10.0.0.2".to_string()));
        assert_eq!(req.cseq(), Some(1));
        assert_eq!(req.from_tag(), Some("1928301774".to_string()));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.branch(), Some("z9hG4bK776asdhds".to_string()));
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 200 OK\r\n\
                     Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK776asdhds\r\n\
                     Record-Route: <sip:proxy.example.org;lr>\r\n\
                     From: <sip:client@example.org>;tag=1928301774\r\n\
                     To: <sip:server@example.org>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@10.0.0.2\r\n\
                     CSeq: 1 INVITE\r\n\
                     Contact: <sip:server@10.0.0.3:5070>\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 200);
        assert!(resp.is_success());
        assert_eq!(resp.to_tag(), Some("a6c85cf".to_string()));
        assert_eq!(resp.cseq_method(), Some(SipMethod::Invite));
        assert_eq!(resp.branch(), Some("z9hG4bK776asdhds".to_string()));
        assert_eq!(
            resp.contact_uri().map(|u| u.to_string()),
            Some("sip:server@10.0.0.3:5070".to_string())
        );
        assert_eq!(resp.record_routes().len(), 1);
    }

    #[test]
    fn test_set_body_updates_length() {
        let mut req = SipRequest::parse(INVITE).unwrap();
        req.set_body(b"v=0\r\n".to_vec(), "application/sdp");

        let reparsed = SipRequest::parse(&req.to_bytes()).unwrap();
        assert_eq!(reparsed.body(), b"v=0\r\n");
        let text = String::from_utf8_lossy(&req.to_bytes()).to_string();
        assert!(text.contains("Content-Type: application/sdp"));
        assert!(text.contains("Content-Length: 5"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(SipMessage::parse(b"\r\n\r\n").is_err());
    }
}
