//! User agent dispatcher
//!
//! Owns the registries of local addresses, calls and transactions, and
//! routes every `StackEvent` to the transaction or call it belongs to.

use super::call::{CallKey, SipCall};
use super::client_transaction::ClientTransaction;
use super::endpoint::{EndpointEntry, EndpointHandler, RegistrationState};
use super::server_transaction::ServerTransaction;
use crate::config::SipConfig;
use crate::domain::call::{Call, CallDirection, CallListener};
use crate::domain::shared::error::UaError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::SipUri;
use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
use crate::infrastructure::protocols::sip::dialog::Dialog;
use crate::infrastructure::protocols::sip::message::{SipMethod, SipRequest};
use crate::infrastructure::protocols::sip::stack::{
    LocalEndpoint, MessageStack, RequestEvent, ResponseEvent, StackEvent, TerminatedEvent,
    TimeoutEvent, TransactionKey, TransactionRef,
};
use metrics::{counter, gauge};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Queue depth of each dispatcher worker
const WORKER_QUEUE: usize = 256;

pub(crate) struct CallEntry {
    call: SipCall,
    /// Peer tag, known once the peer answered (outbound) or from the INVITE
    remote_tag: Option<String>,
}

/// State shared by the dispatcher, calls and transactions
pub(crate) struct UaCore {
    pub(crate) stack: Arc<dyn MessageStack>,
    pub(crate) config: SipConfig,
    endpoints: RwLock<HashMap<SipUri, EndpointEntry>>,
    client_transactions: RwLock<HashMap<TransactionKey, Arc<ClientTransaction>>>,
    server_transactions: RwLock<HashMap<TransactionKey, Arc<ServerTransaction>>>,
    calls: RwLock<HashMap<CallKey, CallEntry>>,
}

impl UaCore {
    pub(crate) fn local_endpoint(&self) -> Result<LocalEndpoint> {
        self.stack
            .local_endpoint()
            .ok_or_else(|| UaError::TransportUnavailable("no active transport".to_string()))
    }

    pub(crate) async fn register_client(&self, transaction: Arc<ClientTransaction>) {
        self.client_transactions
            .write()
            .await
            .insert(transaction.key().clone(), transaction);
    }

    pub(crate) async fn unregister_client(&self, key: &TransactionKey) {
        self.client_transactions.write().await.remove(key);
    }

    pub(crate) async fn set_remote_tag(&self, key: &CallKey, remote_tag: Option<String>) {
        if let Some(entry) = self.calls.write().await.get_mut(key) {
            if entry.remote_tag.is_none() {
                entry.remote_tag = remote_tag;
            }
        }
    }

    pub(crate) async fn update_registration(&self, aor: &SipUri, state: RegistrationState) {
        match self.endpoints.write().await.get_mut(aor) {
            Some(entry) => entry.set_registration(state),
            None => debug!("Registration update for unknown address {}", aor),
        }
    }

    async fn insert_call(&self, call: &SipCall, remote_tag: Option<String>) {
        let mut calls = self.calls.write().await;
        calls.insert(
            call.key().clone(),
            CallEntry {
                call: call.clone(),
                remote_tag,
            },
        );
        gauge!("sip_active_calls").set(calls.len() as f64);
    }

    async fn remove_call(&self, key: &CallKey) {
        let mut calls = self.calls.write().await;
        if calls.remove(key).is_some() {
            debug!("Call {} released", key);
        }
        gauge!("sip_active_calls").set(calls.len() as f64);
    }

    /// Handler for a Request-URI: an exact registered address, or our own
    /// Contact (sent-by) with the user of a registered address
    async fn lookup_endpoint(&self, uri: &rsip::Uri) -> Option<Arc<dyn EndpointHandler>> {
        let target = SipUri::parse(&uri.to_string()).ok()?;
        let endpoints = self.endpoints.read().await;

        if let Some(entry) = endpoints
            .get(&target)
            .or_else(|| endpoints.get(&target.without_port()))
        {
            return Some(entry.handler.clone());
        }

        let endpoint = self.stack.local_endpoint()?;
        let ours = target.host() == endpoint.host.to_ascii_lowercase()
            && target.port().unwrap_or(endpoint.transport.default_port()) == endpoint.port;
        if !ours {
            return None;
        }
        endpoints
            .iter()
            .find(|(aor, _)| aor.user() == target.user())
            .map(|(_, entry)| entry.handler.clone())
    }

    /// Call a request belongs to: by our tag when the request carries one,
    /// otherwise by Call-ID and the peer's tag
    async fn find_call(&self, request: &SipRequest) -> Option<SipCall> {
        let call_id = request.call_id()?;
        let calls = self.calls.read().await;

        match request.to_tag() {
            Some(local_tag) => calls
                .get(&CallKey { call_id, local_tag })
                .map(|entry| entry.call.clone()),
            None => {
                let from_tag = request.from_tag();
                calls
                    .values()
                    .find(|entry| {
                        entry.call.call_id() == call_id && entry.remote_tag == from_tag
                    })
                    .map(|entry| entry.call.clone())
            }
        }
    }
}

/// SIP user agent: places and receives calls over a `MessageStack`
#[derive(Clone)]
pub struct UserAgent {
    core: Arc<UaCore>,
}

impl UserAgent {
    pub fn new(stack: Arc<dyn MessageStack>, config: SipConfig) -> Self {
        Self {
            core: Arc::new(UaCore {
                stack,
                config,
                endpoints: RwLock::new(HashMap::new()),
                client_transactions: RwLock::new(HashMap::new()),
                server_transactions: RwLock::new(HashMap::new()),
                calls: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SipConfig {
        &self.core.config
    }

    /// Places a call from `local_uri` to `remote_uri`. `listener` sees every
    /// state change, starting with DIALING once the INVITE is out.
    pub async fn dial(
        &self,
        local_uri: &str,
        remote_uri: &str,
        body: Option<&str>,
        listener: Arc<dyn CallListener>,
    ) -> Result<SipCall> {
        let core = &self.core;
        let endpoint = core.local_endpoint()?;
        SipUri::parse(local_uri)?;
        SipUri::parse(remote_uri)?;

        let key = CallKey {
            call_id: core.stack.new_call_id(&endpoint.host),
            local_tag: core.stack.new_tag(),
        };
        let mut domain_call = Call::new(
            CallDirection::Outbound,
            local_uri.to_string(),
            remote_uri.to_string(),
        );
        domain_call.add_listener(listener);
        let call = SipCall::new(Arc::downgrade(core), key, domain_call, None);

        let mut session = call.lock().await;
        let seq = session.next_local_seq();
        let invite = Arc::new(ClientTransaction::create(
            core,
            SipMethod::Invite,
            Some((&call, &mut *session)),
            local_uri,
            remote_uri,
            seq,
        )?);
        session.invite_client = Some(invite.clone());

        core.insert_call(&call, None).await;
        core.register_client(invite.clone()).await;

        if let Err(e) = invite.send_request(core, body).await {
            error!("INVITE to {} failed: {}", remote_uri, e);
            core.unregister_client(invite.key()).await;
            core.remove_call(call.key()).await;
            counter!("sip_calls_failed", "status" => "send").increment(1);
            return Err(e);
        }

        session.call.dial()?;
        drop(session);

        counter!("sip_calls_total", "direction" => "outbound").increment(1);
        info!("Dialing {} from {} as {}", remote_uri, local_uri, call.key());
        Ok(call)
    }

    /// Starts answering requests for `uri`. REGISTERs it when a registrar
    /// is configured; if that REGISTER cannot be sent the endpoint is not
    /// kept.
    pub async fn register_endpoint(
        &self,
        uri: &str,
        handler: Arc<dyn EndpointHandler>,
    ) -> Result<()> {
        let aor = SipUri::parse(uri)?;
        self.core
            .endpoints
            .write()
            .await
            .insert(aor.clone(), EndpointEntry::new(uri, handler));

        if self.core.config.registrar.is_some() {
            if let Err(e) = self.send_register(&aor, self.core.config.expires).await {
                self.core.endpoints.write().await.remove(&aor);
                warn!("Endpoint {} dropped, REGISTER not sent: {}", aor, e);
                return Err(e);
            }
        }
        info!("Endpoint {} registered", aor);
        Ok(())
    }

    /// Stops answering for `uri`; drops the binding at the registrar
    pub async fn unregister_endpoint(&self, uri: &str) -> Result<()> {
        let aor = SipUri::parse(uri)?;
        if self.core.config.registrar.is_some() {
            if let Err(e) = self.send_register(&aor, 0).await {
                warn!("Unregister of {} not sent: {}", aor, e);
            }
        }

        let entry = self
            .core
            .endpoints
            .write()
            .await
            .remove(&aor)
            .ok_or_else(|| UaError::NotFound(format!("endpoint {}", aor)))?;
        entry
            .handler
            .on_registration_state(&entry.uri, RegistrationState::Unregistered);
        info!("Endpoint {} unregistered", aor);
        Ok(())
    }

    pub async fn registration_state(&self, uri: &str) -> Option<RegistrationState> {
        let aor = SipUri::parse(uri).ok()?;
        self.core
            .endpoints
            .read()
            .await
            .get(&aor)
            .map(|entry| entry.registration)
    }

    async fn send_register(&self, aor: &SipUri, expires: u32) -> Result<()> {
        let core = &self.core;
        let (uri, call_id, seq) = {
            let mut endpoints = core.endpoints.write().await;
            let entry = endpoints
                .get_mut(aor)
                .ok_or_else(|| UaError::NotFound(format!("endpoint {}", aor)))?;
            entry.register_seq += 1;
            let call_id = entry
                .register_call_id
                .get_or_insert_with(|| core.stack.new_call_id(aor.host()))
                .clone();
            (entry.uri.clone(), call_id, entry.register_seq)
        };

        let register = Arc::new(ClientTransaction::register(core, &uri, &call_id, seq, expires)?);
        core.register_client(register.clone()).await;
        if let Err(e) = register.send_request(core, None).await {
            core.unregister_client(register.key()).await;
            core.update_registration(aor, RegistrationState::Failed { status_code: 503 })
                .await;
            return Err(e);
        }
        if expires > 0 {
            core.update_registration(aor, RegistrationState::Registering).await;
        }
        Ok(())
    }

    pub async fn active_calls(&self) -> usize {
        self.core.calls.read().await.len()
    }

    pub async fn client_transaction_count(&self) -> usize {
        self.core.client_transactions.read().await.len()
    }

    pub async fn server_transaction_count(&self) -> usize {
        self.core.server_transactions.read().await.len()
    }

    /// Sends a CRLF keep-alive through the stack
    pub async fn send_heartbeat(&self) -> Result<()> {
        Ok(self.core.stack.send_heartbeat().await?)
    }

    /// Handles one stack event. Failures are logged, never returned.
    pub async fn handle_event(&self, event: StackEvent) {
        match event {
            StackEvent::Request(ev) => self.on_incoming_request(ev).await,
            StackEvent::Response(ev) => self.on_incoming_response(ev).await,
            StackEvent::Timeout(ev) => self.on_timeout(ev).await,
            StackEvent::TransactionTerminated(ev) => self.on_transaction_terminated(ev).await,
        }
    }

    pub async fn on_incoming_request(&self, event: RequestEvent) {
        let core = &self.core;
        let RequestEvent { key, request, source } = event;
        debug!("{} from {:?}", key, source);

        if core.server_transactions.read().await.contains_key(&key) {
            debug!("{} already being handled", key);
            return;
        }

        let existing = core.find_call(&request).await;
        let handler = core.lookup_endpoint(request.uri()).await;
        if existing.is_none() && handler.is_none() {
            if key.method != SipMethod::Ack {
                warn!("No endpoint for {}, answering 404", request.uri());
                self.respond_stateless(&key, &request, ResponseBuilder::not_found())
                    .await;
            }
            return;
        }

        if !matches!(
            key.method,
            SipMethod::Invite | SipMethod::Ack | SipMethod::Bye | SipMethod::Cancel
        ) {
            debug!("{} not supported, answering 501", key.method);
            self.respond_stateless(&key, &request, ResponseBuilder::not_implemented())
                .await;
            return;
        }

        let call = match existing {
            Some(call) => Some(call),
            None if key.method == SipMethod::Invite && request.to_tag().is_none() => {
                match self.create_inbound_call(&request).await {
                    Ok(call) => Some(call),
                    Err(e) => {
                        warn!("Cannot accept INVITE {}: {}", key, e);
                        self.respond_stateless(
                            &key,
                            &request,
                            ResponseBuilder::new(400).reason(&e.to_string()),
                        )
                        .await;
                        return;
                    }
                }
            }
            None => None,
        };

        match ServerTransaction::create(core, key.clone(), request, call.clone(), handler).await {
            Ok(transaction) => {
                if key.method != SipMethod::Ack {
                    core.server_transactions
                        .write()
                        .await
                        .insert(key, transaction);
                }
            }
            Err(e) => {
                error!("Handling {} failed: {}", key, e);
                // No transaction is kept, so no termination will release the call
                if let Some(call) = call {
                    if call.abandon(&key).await {
                        core.remove_call(call.key()).await;
                    }
                }
            }
        }
    }

    async fn create_inbound_call(&self, request: &SipRequest) -> Result<SipCall> {
        let core = &self.core;
        let local_tag = core.stack.new_tag();
        let dialog = Dialog::from_uas(request, &local_tag, core.config.max_forwards)?;
        let key = CallKey {
            call_id: dialog.id().call_id.clone(),
            local_tag,
        };
        let remote_tag = dialog.id().remote_tag.clone();
        let local_uri = request.to_uri().map(|u| u.to_string()).unwrap_or_default();
        let remote_uri = request.from_uri().map(|u| u.to_string()).unwrap_or_default();

        let call = SipCall::new(
            Arc::downgrade(core),
            key,
            Call::new(CallDirection::Inbound, local_uri, remote_uri),
            Some(dialog),
        );
        core.insert_call(&call, Some(remote_tag)).await;
        counter!("sip_calls_total", "direction" => "inbound").increment(1);
        Ok(call)
    }

    /// Final answer on a wire transaction nothing else will own
    async fn respond_stateless(&self, key: &TransactionKey, request: &SipRequest, builder: ResponseBuilder) {
        let builder = builder
            .to_tag(&self.core.stack.new_tag())
            .user_agent(&self.core.config.user_agent);
        let response = match builder.build_for_request(request) {
            Ok(response) => response,
            Err(e) => {
                warn!("Cannot answer {}: {}", key, e);
                return;
            }
        };
        let status = response.status_code();
        counter!("sip_requests_rejected_total", "code" => status.to_string()).increment(1);
        if let Err(e) = self.core.stack.send_response(key, response).await {
            warn!("Sending {} for {} failed: {}", status, key, e);
        }
    }

    pub async fn on_incoming_response(&self, event: ResponseEvent) {
        let Some(key) = event.key else {
            debug!(
                "Response {} for no transaction discarded",
                event.response.status_code()
            );
            counter!("sip_unmatched_responses_total").increment(1);
            return;
        };

        let transaction = self.core.client_transactions.read().await.get(&key).cloned();
        match transaction {
            Some(transaction) => {
                if let Err(e) = transaction.process_response(&self.core, event.response).await {
                    error!("Processing response on {} failed: {}", key, e);
                }
            }
            None => {
                debug!("Response for unknown transaction {} discarded", key);
                counter!("sip_unmatched_responses_total").increment(1);
            }
        }
    }

    pub async fn on_timeout(&self, event: TimeoutEvent) {
        let core = &self.core;
        match &event.transaction {
            TransactionRef::Client(key) => {
                let transaction = core.client_transactions.read().await.get(key).cloned();
                let Some(transaction) = transaction else {
                    debug!("Timeout for unknown client transaction {}", key);
                    return;
                };
                if let Err(e) = transaction.process_timeout(core).await {
                    error!("Timeout handling on {} failed: {}", key, e);
                }
                if let Err(e) = transaction.terminate(core).await {
                    warn!("Terminating {} failed: {}", key, e);
                }
            }
            TransactionRef::Server(key) => {
                let transaction = core.server_transactions.read().await.get(key).cloned();
                let Some(transaction) = transaction else {
                    debug!("Timeout for unknown server transaction {}", key);
                    return;
                };
                if let Err(e) = transaction.process_timeout().await {
                    error!("Timeout handling on {} failed: {}", key, e);
                }
                if let Err(e) = transaction.terminate(core).await {
                    warn!("Terminating {} failed: {}", key, e);
                }
            }
        }
    }

    /// The stack dropped a wire transaction: forget it, and the call too
    /// once nothing of it is left
    pub async fn on_transaction_terminated(&self, event: TerminatedEvent) {
        let core = &self.core;
        let call = match &event.transaction {
            TransactionRef::Client(key) => core
                .client_transactions
                .write()
                .await
                .remove(key)
                .and_then(|txn| txn.call().cloned()),
            TransactionRef::Server(key) => core
                .server_transactions
                .write()
                .await
                .remove(key)
                .and_then(|txn| txn.call().cloned()),
        };

        if let Some(call) = call {
            if call.transaction_finished(event.transaction.key()).await {
                core.remove_call(call.key()).await;
            }
        }
    }

    /// Dispatches stack events until the channel closes. Events of one call
    /// always go to the same worker, so they are handled in arrival order.
    pub async fn run(&self, mut events: mpsc::Receiver<StackEvent>) {
        let workers = self.core.config.dispatch_workers.max(1);
        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<StackEvent>(WORKER_QUEUE);
            let ua = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let ua = ua.clone();
                    // A panicking handler takes down its own task only
                    if let Err(e) = tokio::spawn(async move { ua.handle_event(event).await }).await {
                        error!("Dispatcher worker {} event task failed: {}", worker, e);
                    }
                }
            }));
            lanes.push(tx);
        }
        info!("User agent dispatching with {} workers", workers);

        while let Some(event) = events.recv().await {
            let lane = lane_for(event.call_id().as_deref(), workers);
            if lanes[lane].send(event).await.is_err() {
                error!("Dispatcher worker {} stopped", lane);
                break;
            }
        }

        drop(lanes);
        for handle in handles {
            let _ = handle.await;
        }
        info!("User agent dispatcher stopped");
    }
}

fn lane_for(call_id: Option<&str>, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    call_id.unwrap_or_default().hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::{CallEvent, CallState, TerminationReason};
    use crate::infrastructure::protocols::sip::builder::{make_branch, make_call_id, make_tag};
    use crate::infrastructure::protocols::sip::message::{SipError, SipResponse};
    use crate::infrastructure::protocols::sip::stack::MockMessageStack;
    use crate::infrastructure::protocols::sip::transport::TransportProtocol;

    struct Quiet;

    impl CallListener for Quiet {
        fn on_call_event(&self, _event: &CallEvent) {}
    }

    fn mock_stack() -> MockMessageStack {
        let mut stack = MockMessageStack::new();
        stack.expect_local_endpoint().returning(|| {
            Some(LocalEndpoint {
                host: "192.0.2.10".to_string(),
                port: 5060,
                transport: TransportProtocol::Udp,
            })
        });
        stack
            .expect_new_call_id()
            .returning(|host: &str| make_call_id(host));
        stack.expect_new_tag().returning(make_tag);
        stack.expect_new_branch().returning(make_branch);
        stack
            .expect_send_request()
            .returning(|request| TransactionKey::from_request(&request));
        stack
    }

    #[tokio::test]
    async fn test_timeout_terminates_wire_transaction_once() {
        let mut stack = mock_stack();
        stack.expect_terminate().times(1).returning(|_| Ok(()));
        let ua = UserAgent::new(Arc::new(stack), SipConfig::default());

        let call = ua
            .dial("sip:alice@example.com", "sip:bob@example.com", None, Arc::new(Quiet))
            .await
            .unwrap();
        let invite = call.transactions().await[0].clone();

        for _ in 0..3 {
            ua.handle_event(StackEvent::Timeout(TimeoutEvent {
                transaction: TransactionRef::Client(invite.clone()),
                call_id: Some(call.call_id().to_string()),
            }))
            .await;
        }
        assert_eq!(
            call.state().await,
            CallState::Terminated(TerminationReason::Timeout)
        );
    }

    #[tokio::test]
    async fn test_busy_wire_transaction_is_reported() {
        let mut stack = mock_stack();
        stack
            .expect_terminate()
            .returning(|key| Err(SipError::TransactionInUse(key.to_string())));
        let ua = UserAgent::new(Arc::new(stack), SipConfig::default());

        let call = ua
            .dial("sip:alice@example.com", "sip:bob@example.com", None, Arc::new(Quiet))
            .await
            .unwrap();
        let invite = ua
            .core
            .client_transactions
            .read()
            .await
            .values()
            .next()
            .cloned()
            .unwrap();

        let err = invite.terminate(&ua.core).await.unwrap_err();
        assert!(matches!(err, UaError::TransactionBusy(_)));
        assert!(!invite.is_terminated().await);
        assert_eq!(call.state().await, CallState::Dialing);
    }

    #[tokio::test]
    async fn test_run_dispatches_until_channel_closes() {
        let ua = UserAgent::new(Arc::new(mock_stack()), SipConfig::default());
        let (tx, rx) = mpsc::channel(8);
        let runner = {
            let ua = ua.clone();
            tokio::spawn(async move { ua.run(rx).await })
        };

        // Unmatched responses are logged and dropped
        let response = SipResponse::parse(
            b"SIP/2.0 200 OK\r\n\
              Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKnone\r\n\
              From: <sip:a@b>;tag=1\r\n\
              To: <sip:a@b>;tag=2\r\n\
              Call-ID: nobody@b\r\n\
              CSeq: 1 INVITE\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        tx.send(StackEvent::Response(ResponseEvent {
            key: None,
            response,
        }))
        .await
        .unwrap();
        drop(tx);

        tokio::time::timeout(std::time::Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ua.active_calls().await, 0);
    }

    #[derive(Default)]
    struct CountingEndpoint {
        calls: std::sync::Mutex<usize>,
    }

    impl EndpointHandler for CountingEndpoint {
        fn on_incoming_call(&self, _call: SipCall) {
            *self.calls.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn test_unsent_ringing_releases_inbound_call() {
        let mut stack = mock_stack();
        stack
            .expect_send_response()
            .returning(|_, _| Err(SipError::TransportError("unreachable".to_string())));
        let ua = UserAgent::new(Arc::new(stack), SipConfig::default());
        let endpoint = Arc::new(CountingEndpoint::default());
        ua.register_endpoint("sip:bob@example.com", endpoint.clone())
            .await
            .unwrap();

        let invite = SipRequest::parse(
            b"INVITE sip:bob@example.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP 192.0.2.20:5060;branch=z9hG4bKunsent\r\n\
              Max-Forwards: 70\r\n\
              From: <sip:alice@example.org>;tag=atag\r\n\
              To: <sip:bob@example.com>\r\n\
              Call-ID: unsent@192.0.2.20\r\n\
              CSeq: 1 INVITE\r\n\
              Contact: <sip:alice@192.0.2.20:5060>\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        let key = TransactionKey::from_request(&invite).unwrap();
        ua.handle_event(StackEvent::Request(RequestEvent {
            key: key.clone(),
            request: invite,
            source: None,
        }))
        .await;

        assert_eq!(ua.active_calls().await, 0);
        assert_eq!(ua.server_transaction_count().await, 0);
        assert_eq!(*endpoint.calls.lock().unwrap(), 0);

        ua.handle_event(StackEvent::TransactionTerminated(TerminatedEvent {
            transaction: TransactionRef::Server(key),
            call_id: Some("unsent@192.0.2.20".to_string()),
        }))
        .await;
        assert_eq!(ua.active_calls().await, 0);
    }

    #[test]
    fn test_lane_is_stable_per_call() {
        let a = lane_for(Some("abc@host"), 4);
        assert_eq!(a, lane_for(Some("abc@host"), 4));
        assert!(a < 4);
        assert_eq!(lane_for(None, 1), 0);
    }
}
