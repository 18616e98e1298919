//! Message stack seam
//!
//! The user agent core never touches sockets. It talks to a `MessageStack`
//! that owns the wire transactions and reports back through `StackEvent`s.

use super::builder::{make_branch, make_call_id, make_tag};
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::transport::TransportProtocol;
use std::fmt;
use std::net::SocketAddr;

/// Identity of a wire transaction: topmost Via branch plus method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: SipMethod,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: SipMethod) -> Self {
        Self {
            branch: branch.into(),
            method,
        }
    }

    pub fn from_request(request: &SipRequest) -> Result<Self, SipError> {
        let branch = request
            .branch()
            .ok_or_else(|| SipError::InvalidMessage("no Via branch in request".to_string()))?;
        let method = request
            .method()
            .ok_or_else(|| SipError::InvalidMessage("unsupported request method".to_string()))?;
        Ok(Self::new(branch, method))
    }

    /// Key of the client transaction a response belongs to (method from CSeq)
    pub fn from_response(response: &SipResponse) -> Result<Self, SipError> {
        let branch = response
            .branch()
            .ok_or_else(|| SipError::InvalidMessage("no Via branch in response".to_string()))?;
        let method = response
            .cseq_method()
            .ok_or_else(|| SipError::InvalidMessage("no CSeq method in response".to_string()))?;
        Ok(Self::new(branch, method))
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.method, self.branch)
    }
}

/// Address the stack advertises in Via and Contact headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub host: String,
    pub port: u16,
    pub transport: TransportProtocol,
}

impl LocalEndpoint {
    /// `host:port`, bracketing IPv6 literals
    pub fn sent_by(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Which side of a transaction an event refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionRef {
    Client(TransactionKey),
    Server(TransactionKey),
}

impl TransactionRef {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionRef::Client(key) | TransactionRef::Server(key) => key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    /// Server transaction the stack created or matched for the request
    pub key: TransactionKey,
    pub request: SipRequest,
    pub source: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    /// Matching client transaction, `None` when the stack knows of none
    pub key: Option<TransactionKey>,
    pub response: SipResponse,
}

#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    pub transaction: TransactionRef,
    pub call_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TerminatedEvent {
    pub transaction: TransactionRef,
    pub call_id: Option<String>,
}

/// Everything a stack reports to the user agent
#[derive(Debug, Clone)]
pub enum StackEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Timeout(TimeoutEvent),
    TransactionTerminated(TerminatedEvent),
}

impl StackEvent {
    /// Call-ID the event belongs to, used to keep per-call ordering
    pub fn call_id(&self) -> Option<String> {
        match self {
            StackEvent::Request(ev) => ev.request.call_id(),
            StackEvent::Response(ev) => ev.response.call_id(),
            StackEvent::Timeout(ev) => ev.call_id.clone(),
            StackEvent::TransactionTerminated(ev) => ev.call_id.clone(),
        }
    }
}

/// Message stack operations consumed by the user agent
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MessageStack: Send + Sync {
    /// Advertised endpoint, `None` while no transport is active
    fn local_endpoint(&self) -> Option<LocalEndpoint>;

    fn new_call_id(&self, host: &str) -> String {
        make_call_id(host)
    }

    fn new_tag(&self) -> String {
        make_tag()
    }

    fn new_branch(&self) -> String {
        make_branch()
    }

    /// Creates the client wire transaction (none for ACK) and transmits
    async fn send_request(&self, request: SipRequest) -> Result<TransactionKey, SipError>;

    /// Sends a response within an existing server wire transaction
    async fn send_response(
        &self,
        key: &TransactionKey,
        response: SipResponse,
    ) -> Result<(), SipError>;

    /// Ends a wire transaction; unknown keys are not an error
    async fn terminate(&self, key: &TransactionKey) -> Result<(), SipError>;

    /// NAT keep-alive towards the outbound proxy
    async fn send_heartbeat(&self) -> Result<(), SipError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;

    fn register() -> SipRequest {
        SipRequest::parse(
            b"REGISTER sip:example.org SIP/2.0\r\n\
              Via: SIP/2.0/UDP 10.0.0.2:5070;branch=z9hG4bKreg1;rport\r\n\
              From: <sip:client@example.org>;tag=1\r\n\
              To: <sip:client@example.org>\r\n\
              Call-ID: reg@10.0.0.2\r\n\
              CSeq: 7 REGISTER\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap()
    }

    #[test]
    fn test_request_and_response_keys_match() {
        let request = register();
        let response = ResponseBuilder::ok().build_for_request(&request).unwrap();

        let request_key = TransactionKey::from_request(&request).unwrap();
        let response_key = TransactionKey::from_response(&response).unwrap();
        assert_eq!(request_key, response_key);
        assert_eq!(request_key.to_string(), "REGISTER/z9hG4bKreg1");
    }

    #[test]
    fn test_same_branch_different_method() {
        let invite = TransactionKey::new("z9hG4bK1", SipMethod::Invite);
        let cancel = TransactionKey::new("z9hG4bK1", SipMethod::Cancel);
        assert_ne!(invite, cancel);
    }

    #[test]
    fn test_sent_by_brackets_ipv6() {
        let endpoint = LocalEndpoint {
            host: "::1".to_string(),
            port: 5070,
            transport: TransportProtocol::Udp,
        };
        assert_eq!(endpoint.sent_by(), "[::1]:5070");
    }
}
