//! Requests received from the network and the answers the user agent gives

use super::call::SipCall;
use super::client_transaction::{contact_for, SDP_CONTENT_TYPE};
use super::endpoint::EndpointHandler;
use super::user_agent::UaCore;
use crate::domain::call::{CallState, TerminationReason};
use crate::domain::shared::result::Result;
use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
use crate::infrastructure::protocols::sip::message::{SipMethod, SipRequest};
use crate::infrastructure::protocols::sip::stack::TransactionKey;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct ServerState {
    responses: Vec<u16>,
    terminated: bool,
}

/// A request received from the network and the wire transaction answering it
pub struct ServerTransaction {
    key: TransactionKey,
    method: SipMethod,
    request: SipRequest,
    call: Option<SipCall>,
    /// To tag used when the request did not carry one
    local_tag: String,
    state: Mutex<ServerState>,
}

impl ServerTransaction {
    /// Binds the request to `call` (if any) and runs the method's behaviour
    pub(crate) async fn create(
        ua: &UaCore,
        key: TransactionKey,
        request: SipRequest,
        call: Option<SipCall>,
        handler: Option<Arc<dyn EndpointHandler>>,
    ) -> Result<Arc<Self>> {
        let local_tag = match (&call, request.to_tag()) {
            (_, Some(tag)) => tag,
            (Some(call), None) => call.local_tag().to_string(),
            (None, None) => ua.stack.new_tag(),
        };
        let transaction = Arc::new(Self {
            method: key.method,
            key,
            request,
            call,
            local_tag,
            state: Mutex::new(ServerState {
                responses: Vec::new(),
                terminated: false,
            }),
        });
        debug!("Created server transaction {}", transaction.key);

        match transaction.method {
            SipMethod::Invite => transaction.on_invite(ua, handler).await?,
            SipMethod::Ack => transaction.on_ack().await?,
            SipMethod::Bye => transaction.on_bye(ua).await?,
            SipMethod::Cancel => transaction.on_cancel(ua).await?,
            _ => {
                transaction
                    .send_response(ua, 501, None, None)
                    .await?;
            }
        }
        Ok(transaction)
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn method(&self) -> SipMethod {
        self.method
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    pub fn call(&self) -> Option<&SipCall> {
        self.call.as_ref()
    }

    /// Status codes sent so far, in order
    pub async fn responses(&self) -> Vec<u16> {
        self.state.lock().await.responses.clone()
    }

    /// Answers the request. Dialog-forming INVITE responses carry our tag
    /// and Contact.
    pub(crate) async fn send_response(
        &self,
        ua: &UaCore,
        status_code: u16,
        reason: Option<&str>,
        body: Option<&str>,
    ) -> Result<()> {
        let mut builder = ResponseBuilder::new(status_code).user_agent(&ua.config.user_agent);
        if status_code > 100 {
            builder = builder.to_tag(&self.local_tag);
        }
        if let Some(reason) = reason {
            builder = builder.reason(reason);
        }
        if self.method == SipMethod::Invite && (101..300).contains(&status_code) {
            let local_uri = self
                .request
                .to_uri()
                .map(|uri| uri.to_string())
                .unwrap_or_default();
            builder = builder.contact(&contact_for(&local_uri, &ua.local_endpoint()?));
        }
        if let Some(body) = body {
            builder = builder.body(body.as_bytes().to_vec(), SDP_CONTENT_TYPE);
        }
        let response = builder.build_for_request(&self.request)?;

        let mut state = self.state.lock().await;
        ua.stack.send_response(&self.key, response).await?;
        state.responses.push(status_code);
        debug!("{} answered {}", self.key, status_code);
        Ok(())
    }

    /// Releases the wire transaction; idempotent
    pub(crate) async fn terminate(&self, ua: &UaCore) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.terminated {
            return Ok(());
        }
        if self.method != SipMethod::Ack {
            ua.stack.terminate(&self.key).await?;
        }
        state.terminated = true;
        debug!("Server transaction {} terminated", self.key);
        Ok(())
    }

    async fn on_invite(
        self: &Arc<Self>,
        ua: &UaCore,
        handler: Option<Arc<dyn EndpointHandler>>,
    ) -> Result<()> {
        let Some(call) = &self.call else {
            return self.send_response(ua, 481, None, None).await;
        };

        {
            let mut session = call.lock().await;
            if session.call.state() != CallState::Idle {
                // Mid-call session changes are not supported
                drop(session);
                return self
                    .send_response(ua, 488, Some("Session Modification Not Supported"), None)
                    .await;
            }
            session.record_transaction(self.key.clone(), true);
            session.invite_server = Some(self.clone());
            session.call.incoming()?;
            self.send_response(ua, 180, None, None).await?;
            session.call.ring()?;
        }

        info!("Incoming call {} from {}", call.key(), call_remote(&self.request));
        if let Some(handler) = handler {
            handler.on_incoming_call(call.clone());
        }
        Ok(())
    }

    async fn on_ack(&self) -> Result<()> {
        let Some(call) = &self.call else {
            debug!("ACK {} matches no call", self.key);
            return Ok(());
        };
        let mut session = call.lock().await;
        if !session.answered || !session.call.state().is_early() {
            debug!("ACK {} absorbed", self.key);
            return Ok(());
        }
        session.answered = false;
        if let Some(dialog) = session.dialog.as_mut() {
            dialog.confirm(None);
        }
        session.call.establish()
    }

    async fn on_bye(&self, ua: &UaCore) -> Result<()> {
        let Some(call) = &self.call else {
            return self.send_response(ua, 481, None, None).await;
        };
        let mut session = call.lock().await;
        session.record_transaction(self.key.clone(), true);

        let in_order = match (session.dialog.as_mut(), self.request.cseq()) {
            (Some(dialog), Some(seq)) => dialog.accept_remote_seq(seq),
            _ => false,
        };
        if !in_order {
            warn!("BYE {} out of order for call {}", self.key, call.key());
            return self.send_response(ua, 500, None, None).await;
        }

        self.send_response(ua, 200, None, None).await?;
        session.terminate_dialog();
        if !session.call.state().is_terminated() {
            session.call.end(TerminationReason::RemoteHangup)?;
        }
        Ok(())
    }

    async fn on_cancel(&self, ua: &UaCore) -> Result<()> {
        let Some(call) = &self.call else {
            return self.send_response(ua, 481, None, None).await;
        };
        let mut session = call.lock().await;
        session.record_transaction(self.key.clone(), true);
        self.send_response(ua, 200, None, None).await?;

        if !session.call.state().is_early() || session.answered {
            debug!("CANCEL {} too late for call {}", self.key, call.key());
            return Ok(());
        }
        if let Some(invite) = session.invite_server.clone() {
            invite.send_response(ua, 487, None, None).await?;
        }
        session.terminate_dialog();
        session.call.cancel()
    }

    /// The stack gave up waiting on this transaction
    pub(crate) async fn process_timeout(&self) -> Result<()> {
        let Some(call) = &self.call else {
            return Ok(());
        };
        let mut session = call.lock().await;
        if self.method == SipMethod::Invite && !session.call.state().is_terminated() {
            warn!("No ACK for call {}", call.key());
            session.terminate_dialog();
            session.call.time_out()?;
        }
        Ok(())
    }
}

fn call_remote(request: &SipRequest) -> String {
    request
        .from_uri()
        .map(|uri| uri.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
