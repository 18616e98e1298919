//! Requests the user agent originates and what their responses do to calls

use super::call::{CallSession, SipCall};
use super::endpoint::RegistrationState;
use super::user_agent::UaCore;
use crate::domain::call::{CallState, TerminationReason};
use crate::domain::shared::error::UaError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::SipUri;
use crate::infrastructure::protocols::sip::builder::RequestBuilder;
use crate::infrastructure::protocols::sip::dialog::{Dialog, DialogState};
use crate::infrastructure::protocols::sip::message::{SipMethod, SipRequest, SipResponse};
use crate::infrastructure::protocols::sip::stack::{LocalEndpoint, TransactionKey};
use rsip::Header;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// SDP is the only body the user agent attaches
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

struct ClientState {
    request: SipRequest,
    sent: bool,
    terminated: bool,
    last_status: Option<u16>,
}

/// A locally originated request and its wire transaction
pub struct ClientTransaction {
    key: TransactionKey,
    method: SipMethod,
    call: Option<SipCall>,
    seq: u32,
    local_uri: String,
    remote_uri: String,
    /// Built from a confirmed dialog
    in_dialog: bool,
    /// Address of record a REGISTER refreshes
    registration: Option<(SipUri, u32)>,
    state: Mutex<ClientState>,
}

fn parse_uri(uri: &str) -> Result<rsip::Uri> {
    rsip::Uri::try_from(uri)
        .map_err(|e| UaError::ProtocolBuild(format!("invalid SIP URI {}: {}", uri, e)))
}

/// Contact we advertise for a local address: its user at our sent-by
pub(crate) fn contact_for(local_uri: &str, endpoint: &LocalEndpoint) -> String {
    match SipUri::parse(local_uri).ok().and_then(|uri| uri.user().map(str::to_string)) {
        Some(user) => format!("sip:{}@{}", user, endpoint.sent_by()),
        None => format!("sip:{}", endpoint.sent_by()),
    }
}

impl ClientTransaction {
    /// Builds a request for `method`. With a usable dialog on `call` the
    /// request comes from the dialog and `seq` is ignored; otherwise it is
    /// an out-of-dialog request carrying the call's Call-ID and tag.
    pub(crate) fn create(
        ua: &UaCore,
        method: SipMethod,
        call: Option<(&SipCall, &mut CallSession)>,
        local_uri: &str,
        remote_uri: &str,
        seq: u32,
    ) -> Result<Self> {
        let endpoint = ua.local_endpoint()?;
        let branch = ua.stack.new_branch();

        let Some((call, session)) = call else {
            let call_id = ua.stack.new_call_id(&endpoint.host);
            let tag = ua.stack.new_tag();
            let request = Self::out_of_dialog(
                ua, method, local_uri, remote_uri, &call_id, &tag, seq, &branch, &endpoint,
            )?;
            return Self::from_request(request, method, None, seq, local_uri, remote_uri);
        };

        let (request, seq, in_dialog) = match session.dialog.as_mut() {
            Some(dialog) if dialog.is_usable() => {
                let seq = dialog.next_local_seq();
                let in_dialog = dialog.state() == DialogState::Confirmed;
                (dialog.create_request(method, seq, &branch, &endpoint)?, seq, in_dialog)
            }
            _ => {
                let request = Self::out_of_dialog(
                    ua,
                    method,
                    local_uri,
                    remote_uri,
                    call.call_id(),
                    call.local_tag(),
                    seq,
                    &branch,
                    &endpoint,
                )?;
                (request, seq, false)
            }
        };

        let mut transaction =
            Self::from_request(request, method, Some(call.clone()), seq, local_uri, remote_uri)?;
        transaction.in_dialog = in_dialog;
        session.record_transaction(transaction.key.clone(), method != SipMethod::Ack);
        Ok(transaction)
    }

    /// REGISTER for `aor`, reusing the binding's Call-ID with CSeq `seq`
    pub(crate) fn register(
        ua: &UaCore,
        aor: &str,
        call_id: &str,
        seq: u32,
        expires: u32,
    ) -> Result<Self> {
        let endpoint = ua.local_endpoint()?;
        let target = SipUri::parse(aor)?;
        let registrar = match ua.config.registrar.as_deref() {
            Some(registrar) => parse_uri(registrar)?,
            None => parse_uri(&format!("sip:{}", target.host()))?,
        };
        let from = parse_uri(aor)?.to_string();
        let tag = ua.stack.new_tag();
        let branch = ua.stack.new_branch();

        let request = RequestBuilder::new(SipMethod::Register, registrar)
            .via(endpoint.transport.as_str(), &endpoint.sent_by(), &branch)
            .max_forwards(ua.config.max_forwards)
            .from(&from, &tag)
            .to(&from, None)
            .call_id(call_id)
            .cseq(seq, SipMethod::Register)
            .contact(&contact_for(aor, &endpoint))
            .expires(expires)
            .user_agent(&ua.config.user_agent)
            .build();

        let mut transaction = Self::from_request(request, SipMethod::Register, None, seq, aor, aor)?;
        transaction.registration = Some((target, expires));
        Ok(transaction)
    }

    /// Builds, registers and sends the CANCEL for `invite`
    pub(crate) async fn cancel(
        ua: &UaCore,
        invite: &ClientTransaction,
        call: &SipCall,
        session: &mut CallSession,
    ) -> Result<Arc<Self>> {
        let invite_request = invite.request().await;
        let mut headers: Vec<Header> = Vec::new();

        // Same top Via, so the CANCEL lands on the INVITE's server transaction
        if let Some(via) = invite_request
            .headers()
            .iter()
            .find(|h| matches!(h, Header::Via(_)))
        {
            headers.push(via.clone());
        }
        headers.push(Header::MaxForwards(ua.config.max_forwards.into()));
        for header in invite_request.headers().iter() {
            if matches!(header, Header::From(_) | Header::To(_) | Header::CallId(_) | Header::Route(_)) {
                headers.push(header.clone());
            }
        }

        let mut builder = RequestBuilder::new(SipMethod::Cancel, invite_request.uri().clone());
        for header in headers {
            builder = builder.header(header);
        }
        let builder = builder
            .cseq(invite.seq, SipMethod::Cancel)
            .user_agent(&ua.config.user_agent);

        let cancel = Arc::new(Self::from_request(
            builder.build(),
            SipMethod::Cancel,
            Some(call.clone()),
            invite.seq,
            &invite.local_uri,
            &invite.remote_uri,
        )?);
        session.record_transaction(cancel.key.clone(), true);

        ua.register_client(cancel.clone()).await;
        if let Err(e) = cancel.send_request(ua, None).await {
            ua.unregister_client(&cancel.key).await;
            return Err(e);
        }
        Ok(cancel)
    }

    fn from_request(
        request: SipRequest,
        method: SipMethod,
        call: Option<SipCall>,
        seq: u32,
        local_uri: &str,
        remote_uri: &str,
    ) -> Result<Self> {
        let key = TransactionKey::from_request(&request)?;
        debug!("Created client transaction {}", key);
        Ok(Self {
            key,
            method,
            call,
            seq,
            local_uri: local_uri.to_string(),
            remote_uri: remote_uri.to_string(),
            in_dialog: false,
            registration: None,
            state: Mutex::new(ClientState {
                request,
                sent: false,
                terminated: false,
                last_status: None,
            }),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn out_of_dialog(
        ua: &UaCore,
        method: SipMethod,
        local_uri: &str,
        remote_uri: &str,
        call_id: &str,
        local_tag: &str,
        seq: u32,
        branch: &str,
        endpoint: &LocalEndpoint,
    ) -> Result<SipRequest> {
        let target = parse_uri(remote_uri)?;
        let from = parse_uri(local_uri)?.to_string();

        let mut builder = RequestBuilder::new(method, target.clone())
            .via(endpoint.transport.as_str(), &endpoint.sent_by(), branch)
            .max_forwards(ua.config.max_forwards)
            .from(&from, local_tag)
            .to(&target.to_string(), None)
            .call_id(call_id)
            .cseq(seq, method)
            .user_agent(&ua.config.user_agent);
        if matches!(method, SipMethod::Invite | SipMethod::Subscribe | SipMethod::Refer) {
            builder = builder.contact(&contact_for(local_uri, endpoint));
        }
        Ok(builder.build())
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn method(&self) -> SipMethod {
        self.method
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn is_in_dialog(&self) -> bool {
        self.in_dialog
    }

    pub fn call(&self) -> Option<&SipCall> {
        self.call.as_ref()
    }

    pub async fn request(&self) -> SipRequest {
        self.state.lock().await.request.clone()
    }

    pub async fn last_status(&self) -> Option<u16> {
        self.state.lock().await.last_status
    }

    pub async fn is_terminated(&self) -> bool {
        self.state.lock().await.terminated
    }

    /// Hands the request to the stack, with `body` as SDP when given
    pub(crate) async fn send_request(&self, ua: &UaCore, body: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.terminated {
            return Err(UaError::InvalidStateTransition(format!(
                "client transaction {} already terminated",
                self.key
            )));
        }
        if let Some(body) = body {
            state.request.set_body(body.as_bytes().to_vec(), SDP_CONTENT_TYPE);
        }

        let key = ua.stack.send_request(state.request.clone()).await?;
        if key != self.key {
            warn!("Stack keyed {} as {}", self.key, key);
        }
        state.sent = true;
        if self.in_dialog {
            debug!("Sent in-dialog {}", self.key);
        } else {
            debug!("Sent {}", self.key);
        }
        Ok(())
    }

    /// Releases the wire transaction. Idempotent; refused while the stack
    /// is still sending on it.
    pub(crate) async fn terminate(&self, ua: &UaCore) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.terminated {
            return Ok(());
        }
        if state.sent {
            ua.stack.terminate(&self.key).await?;
        }
        state.terminated = true;
        debug!("Client transaction {} terminated", self.key);
        Ok(())
    }

    pub(crate) async fn process_response(&self, ua: &UaCore, response: SipResponse) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.terminated {
                debug!("Response for terminated {} dropped", self.key);
                return Ok(());
            }
            state.last_status = Some(response.status_code());
        }

        match self.method {
            SipMethod::Invite => self.on_invite_response(ua, &response).await,
            SipMethod::Bye => self.on_bye_response(&response).await,
            SipMethod::Register => self.on_register_response(ua, &response).await,
            _ => {
                debug!("{} answered {}", self.key, response.status_code());
                Ok(())
            }
        }
    }

    async fn on_invite_response(&self, ua: &UaCore, response: &SipResponse) -> Result<()> {
        let Some(call) = &self.call else {
            return Ok(());
        };
        let status = response.status_code();
        let invite = self.request().await;
        let mut session = call.lock().await;
        let state = session.call.state();

        match status {
            100 => Ok(()),
            101..=199 => {
                if session.dialog.is_none() && response.to_tag().is_some() {
                    session.dialog = Some(Dialog::from_uac(&invite, response, ua.config.max_forwards)?);
                    ua.set_remote_tag(call.key(), response.to_tag()).await;
                }
                if state == CallState::Dialing {
                    session.call.ring()?;
                }
                Ok(())
            }
            200..=299 => {
                let remote_tag = response.to_tag();
                match session.dialog.as_mut() {
                    Some(dialog)
                        if dialog.is_usable()
                            && Some(&dialog.id().remote_tag) == remote_tag.as_ref() =>
                    {
                        dialog.confirm(Some(response));
                    }
                    _ => {
                        session.dialog =
                            Some(Dialog::from_uac(&invite, response, ua.config.max_forwards)?);
                    }
                }
                ua.set_remote_tag(call.key(), remote_tag).await;
                self.send_ack(ua, call, &mut session).await?;

                match state {
                    CallState::Dialing | CallState::Ringing => session.call.establish(),
                    CallState::Established => Ok(()),
                    _ => {
                        // Answered after we gave up on it
                        info!("Late 2xx on {}, hanging up", call.key());
                        call.send_bye(ua, &mut session).await
                    }
                }
            }
            _ => {
                if let Some(dialog) = session.dialog.as_mut() {
                    if dialog.state() == DialogState::Early {
                        dialog.terminate();
                    }
                }
                if state.is_early() {
                    session.call.reject(status)?;
                    metrics::counter!("sip_calls_failed", "status" => status.to_string())
                        .increment(1);
                }
                Ok(())
            }
        }
    }

    async fn send_ack(&self, ua: &UaCore, call: &SipCall, session: &mut CallSession) -> Result<()> {
        let endpoint = ua.local_endpoint()?;
        let dialog = session.dialog.as_ref().ok_or_else(|| {
            UaError::InvalidStateTransition(format!("no dialog to acknowledge {}", self.key))
        })?;
        let ack = dialog.create_request(SipMethod::Ack, self.seq, &ua.stack.new_branch(), &endpoint)?;

        let ack = Self::from_request(
            ack,
            SipMethod::Ack,
            Some(call.clone()),
            self.seq,
            &self.local_uri,
            &self.remote_uri,
        )?;
        // ACK for a 2xx has no wire transaction to wait for
        session.record_transaction(ack.key.clone(), false);
        ack.send_request(ua, None).await
    }

    async fn on_bye_response(&self, response: &SipResponse) -> Result<()> {
        if response.is_provisional() {
            return Ok(());
        }
        let Some(call) = &self.call else {
            return Ok(());
        };
        let mut session = call.lock().await;
        session.terminate_dialog();
        if !session.call.state().is_terminated() {
            session.call.end(TerminationReason::LocalHangup)?;
        }
        Ok(())
    }

    async fn on_register_response(&self, ua: &UaCore, response: &SipResponse) -> Result<()> {
        if response.is_provisional() {
            return Ok(());
        }
        let Some((aor, requested)) = &self.registration else {
            return Ok(());
        };

        let state = if response.is_success() {
            let granted = response.expires().unwrap_or(*requested);
            if granted == 0 {
                RegistrationState::Unregistered
            } else {
                RegistrationState::Registered { expires: granted }
            }
        } else {
            RegistrationState::Failed {
                status_code: response.status_code(),
            }
        };
        info!("Registration of {} is now {}", aor, state);
        ua.update_registration(aor, state).await;
        Ok(())
    }

    /// The stack gave up on the request
    pub(crate) async fn process_timeout(&self, ua: &UaCore) -> Result<()> {
        if let Some(call) = &self.call {
            let mut session = call.lock().await;
            session.terminate_dialog();
            if !session.call.state().is_terminated() {
                warn!("{} timed out, call {} lost", self.key, call.key());
                session.call.time_out()?;
            }
        } else if let Some((aor, _)) = &self.registration {
            warn!("REGISTER for {} timed out", aor);
            ua.update_registration(aor, RegistrationState::Failed { status_code: 408 })
                .await;
        }
        Ok(())
    }
}
