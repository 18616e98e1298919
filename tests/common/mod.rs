//! In-memory stack connecting two user agents without sockets

#![allow(dead_code)]

use sipua::config::SipConfig;
use sipua::domain::call::{CallEvent, CallEventKind, CallListener};
use sipua::infrastructure::protocols::sip::{
    LocalEndpoint, MessageStack, RequestEvent, ResponseEvent, SipError, SipRequest, SipResponse,
    StackEvent, TransactionKey, TransportProtocol,
};
use sipua::{EndpointHandler, RegistrationState, SipCall, UserAgent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const ALICE: &str = "sip:alice@example.com";
pub const BOB: &str = "sip:bob@127.0.0.1:5070";

#[derive(Debug, Clone)]
pub enum Wire {
    Request(SipRequest),
    Response(SipResponse),
}

/// Records what a user agent puts on the wire. Messages are serialized and
/// parsed again, as a socket would.
pub struct LoopbackStack {
    endpoint: LocalEndpoint,
    outbox: Mutex<Vec<Wire>>,
    sent: Mutex<Vec<Wire>>,
    terminated: Mutex<Vec<TransactionKey>>,
    pub fail_sends: AtomicBool,
    pub fail_responses: AtomicBool,
    pub up: AtomicBool,
}

impl LoopbackStack {
    pub fn new(port: u16) -> Self {
        Self {
            endpoint: LocalEndpoint {
                host: "127.0.0.1".to_string(),
                port,
                transport: TransportProtocol::Udp,
            },
            outbox: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            fail_responses: AtomicBool::new(false),
            up: AtomicBool::new(true),
        }
    }

    /// Messages sent since the last call
    pub fn take(&self) -> Vec<Wire> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }

    /// Every message ever sent
    pub fn sent(&self) -> Vec<Wire> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_requests(&self) -> Vec<SipRequest> {
        self.sent()
            .into_iter()
            .filter_map(|wire| match wire {
                Wire::Request(request) => Some(request),
                Wire::Response(_) => None,
            })
            .collect()
    }

    pub fn sent_statuses(&self) -> Vec<u16> {
        self.sent()
            .into_iter()
            .filter_map(|wire| match wire {
                Wire::Response(response) => Some(response.status_code()),
                Wire::Request(_) => None,
            })
            .collect()
    }

    pub fn terminated(&self) -> Vec<TransactionKey> {
        self.terminated.lock().unwrap().clone()
    }

    fn push(&self, wire: Wire) {
        self.sent.lock().unwrap().push(wire.clone());
        self.outbox.lock().unwrap().push(wire);
    }
}

#[async_trait::async_trait]
impl MessageStack for LoopbackStack {
    fn local_endpoint(&self) -> Option<LocalEndpoint> {
        self.up
            .load(Ordering::SeqCst)
            .then(|| self.endpoint.clone())
    }

    async fn send_request(&self, request: SipRequest) -> Result<TransactionKey, SipError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SipError::TransportError("network unreachable".to_string()));
        }
        let request = SipRequest::parse(&request.to_bytes())?;
        let key = TransactionKey::from_request(&request)?;
        self.push(Wire::Request(request));
        Ok(key)
    }

    async fn send_response(
        &self,
        _key: &TransactionKey,
        response: SipResponse,
    ) -> Result<(), SipError> {
        if self.fail_responses.load(Ordering::SeqCst) {
            return Err(SipError::TransportError("network unreachable".to_string()));
        }
        let response = SipResponse::parse(&response.to_bytes())?;
        self.push(Wire::Response(response));
        Ok(())
    }

    async fn terminate(&self, key: &TransactionKey) -> Result<(), SipError> {
        self.terminated.lock().unwrap().push(key.clone());
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), SipError> {
        Ok(())
    }
}

/// A user agent and the stack under it
#[derive(Clone)]
pub struct Peer {
    pub ua: UserAgent,
    pub stack: Arc<LoopbackStack>,
}

impl Peer {
    pub fn new(port: u16) -> Self {
        Self::with_config(port, SipConfig::default())
    }

    pub fn with_config(port: u16, config: SipConfig) -> Self {
        let stack = Arc::new(LoopbackStack::new(port));
        Self {
            ua: UserAgent::new(stack.clone(), config),
            stack,
        }
    }
}

pub fn request_event(request: SipRequest) -> StackEvent {
    StackEvent::Request(RequestEvent {
        key: TransactionKey::from_request(&request).unwrap(),
        request,
        source: None,
    })
}

pub fn response_event(response: SipResponse) -> StackEvent {
    StackEvent::Response(ResponseEvent {
        key: TransactionKey::from_response(&response).ok(),
        response,
    })
}

/// Moves messages between the two peers until both go quiet
pub async fn pump(a: &Peer, b: &Peer) {
    loop {
        let from_a = a.stack.take();
        let from_b = b.stack.take();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        deliver(from_a, &b.ua).await;
        deliver(from_b, &a.ua).await;
    }
}

async fn deliver(messages: Vec<Wire>, to: &UserAgent) {
    for wire in messages {
        let event = match wire {
            Wire::Request(request) => request_event(request),
            Wire::Response(response) => response_event(response),
        };
        to.handle_event(event).await;
    }
}

/// Collects call events
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<CallEventKind>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<CallEventKind> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.kinds().iter().map(|kind| kind.name()).collect()
    }
}

impl CallListener for RecordingListener {
    fn on_call_event(&self, event: &CallEvent) {
        self.events.lock().unwrap().push(event.kind.clone());
    }
}

/// Keeps incoming calls for the test to act on
#[derive(Default)]
pub struct RecordingEndpoint {
    calls: Mutex<Vec<SipCall>>,
    registrations: Mutex<Vec<RegistrationState>>,
}

impl RecordingEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SipCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_call(&self) -> SipCall {
        self.calls().pop().expect("no incoming call")
    }

    pub fn registrations(&self) -> Vec<RegistrationState> {
        self.registrations.lock().unwrap().clone()
    }
}

impl EndpointHandler for RecordingEndpoint {
    fn on_incoming_call(&self, call: SipCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn on_registration_state(&self, _uri: &str, state: RegistrationState) {
        self.registrations.lock().unwrap().push(state);
    }
}
