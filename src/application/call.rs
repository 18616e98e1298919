//! Call sessions: a domain `Call` bound to its dialog and transactions

use super::client_transaction::ClientTransaction;
use super::server_transaction::ServerTransaction;
use super::user_agent::UaCore;
use crate::domain::call::{Call, CallDirection, CallListener, CallState, CallStats, TerminationReason};
use crate::domain::shared::error::UaError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use crate::infrastructure::protocols::sip::dialog::{Dialog, DialogId};
use crate::infrastructure::protocols::sip::message::SipMethod;
use crate::infrastructure::protocols::sip::stack::TransactionKey;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Status sent by `reject` when the application gives none
pub const DEFAULT_REJECT_STATUS: u16 = 486;
/// Status sent when an unanswered inbound call is hung up
pub const DECLINE_STATUS: u16 = 603;

/// Registry key of a call: SIP Call-ID plus our own tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub call_id: String,
    pub local_tag: String,
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};tag={}", self.call_id, self.local_tag)
    }
}

/// Mutable part of a call, guarded by the session lock
pub(crate) struct CallSession {
    pub(crate) call: Call,
    pub(crate) dialog: Option<Dialog>,
    /// CSeq counter until a dialog takes over
    local_seq: u32,
    pub(crate) invite_client: Option<Arc<ClientTransaction>>,
    pub(crate) invite_server: Option<Arc<ServerTransaction>>,
    /// 2xx sent on the inbound INVITE, ACK not seen yet
    pub(crate) answered: bool,
    transactions: Vec<TransactionKey>,
    pending: HashSet<TransactionKey>,
}

impl CallSession {
    /// Next CSeq for a locally originated request
    pub(crate) fn next_local_seq(&mut self) -> u32 {
        match self.dialog.as_mut() {
            Some(dialog) if dialog.is_usable() => dialog.next_local_seq(),
            _ => {
                self.local_seq += 1;
                self.local_seq
            }
        }
    }

    /// Remembers a transaction of this call. `pending` ones keep the call
    /// registered until the stack reports them terminated.
    pub(crate) fn record_transaction(&mut self, key: TransactionKey, pending: bool) {
        if pending {
            self.pending.insert(key.clone());
        }
        self.transactions.push(key);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.call.state().is_terminated() && self.pending.is_empty()
    }

    pub(crate) fn terminate_dialog(&mut self) {
        if let Some(dialog) = self.dialog.as_mut() {
            dialog.terminate();
        }
    }
}

/// Handle on one call. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct SipCall {
    id: CallId,
    key: CallKey,
    direction: CallDirection,
    session: Arc<Mutex<CallSession>>,
    ua: Weak<UaCore>,
}

impl SipCall {
    pub(crate) fn new(ua: Weak<UaCore>, key: CallKey, call: Call, dialog: Option<Dialog>) -> Self {
        Self {
            id: call.id(),
            direction: call.direction(),
            key,
            session: Arc::new(Mutex::new(CallSession {
                call,
                dialog,
                local_seq: 0,
                invite_client: None,
                invite_server: None,
                answered: false,
                transactions: Vec::new(),
                pending: HashSet::new(),
            })),
            ua,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn key(&self) -> &CallKey {
        &self.key
    }

    /// SIP Call-ID of the call
    pub fn call_id(&self) -> &str {
        &self.key.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.key.local_tag
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub async fn state(&self) -> CallState {
        self.session.lock().await.call.state()
    }

    pub async fn stats(&self) -> CallStats {
        self.session.lock().await.call.stats()
    }

    pub async fn add_listener(&self, listener: Arc<dyn CallListener>) {
        self.session.lock().await.call.add_listener(listener);
    }

    pub async fn dialog_id(&self) -> Option<DialogId> {
        self.session
            .lock()
            .await
            .dialog
            .as_ref()
            .map(|dialog| dialog.id().clone())
    }

    /// Every transaction the call has used, oldest first
    pub async fn transactions(&self) -> Vec<TransactionKey> {
        self.session.lock().await.transactions.clone()
    }

    /// Answers a ringing inbound call with 200 OK. The call is established
    /// when the caller's ACK arrives.
    pub async fn accept(&self, body: Option<&str>) -> Result<()> {
        let ua = self.ua()?;
        let mut session = self.lock().await;
        let invite = self.unanswered_invite(&session)?;

        invite.send_response(&ua, 200, None, body).await?;
        session.answered = true;
        info!("Call {} answered", self.key);
        Ok(())
    }

    /// Refuses a ringing inbound call, 486 Busy Here unless told otherwise
    pub async fn reject(&self, status_code: Option<u16>) -> Result<()> {
        let ua = self.ua()?;
        let mut session = self.lock().await;
        self.reject_locked(&ua, &mut session, status_code.unwrap_or(DEFAULT_REJECT_STATUS))
            .await
    }

    /// Ends the call by whatever means its state allows: BYE once answered,
    /// CANCEL while an outbound call rings, a decline for an inbound one.
    pub async fn hangup(&self) -> Result<()> {
        let ua = self.ua()?;
        let mut session = self.lock().await;
        let state = session.call.state();

        match (self.direction, state) {
            (_, CallState::Established) => self.send_bye(&ua, &mut session).await,
            (CallDirection::Inbound, CallState::Incoming | CallState::Ringing)
                if session.answered =>
            {
                self.send_bye(&ua, &mut session).await
            }
            (CallDirection::Inbound, CallState::Incoming | CallState::Ringing) => {
                self.reject_locked(&ua, &mut session, DECLINE_STATUS).await
            }
            (CallDirection::Outbound, CallState::Dialing | CallState::Ringing) => {
                self.cancel_locked(&ua, &mut session).await
            }
            _ => Err(UaError::InvalidStateTransition(format!(
                "cannot hang up call {} in state {}",
                self.key, state
            ))),
        }
    }

    /// Cancels an outbound call that has not been answered
    pub async fn cancel(&self) -> Result<()> {
        let ua = self.ua()?;
        let mut session = self.lock().await;
        self.cancel_locked(&ua, &mut session).await
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, CallSession> {
        self.session.lock().await
    }

    pub(crate) fn ua(&self) -> Result<Arc<UaCore>> {
        self.ua
            .upgrade()
            .ok_or_else(|| UaError::NotFound("user agent has shut down".to_string()))
    }

    /// The stack dropped one of our wire transactions. `true` once the call
    /// is over and nothing of it is left in flight.
    pub(crate) async fn transaction_finished(&self, key: &TransactionKey) -> bool {
        let mut session = self.lock().await;
        session.pending.remove(key);
        session.is_finished()
    }

    /// Handling of a received request failed part way. An INVITE or BYE
    /// already bound to the call ends it with `Error`; the key stops
    /// counting as in flight. `true` once nothing of the call is left.
    pub(crate) async fn abandon(&self, key: &TransactionKey) -> bool {
        let mut session = self.lock().await;
        let bound = session.pending.remove(key);
        let ends_call = matches!(key.method, SipMethod::Invite | SipMethod::Bye);
        if bound && ends_call && !session.call.state().is_terminated() {
            session.terminate_dialog();
            if let Err(e) = session.call.end(TerminationReason::Error) {
                debug!("Call {} not ended after failed {}: {}", self.key, key, e);
            }
        }
        session.is_finished()
    }

    fn unanswered_invite(&self, session: &CallSession) -> Result<Arc<ServerTransaction>> {
        let state = session.call.state();
        if self.direction != CallDirection::Inbound || !state.is_early() || session.answered {
            return Err(UaError::InvalidStateTransition(format!(
                "call {} is not waiting for an answer ({})",
                self.key, state
            )));
        }
        session.invite_server.clone().ok_or_else(|| {
            UaError::InvalidStateTransition(format!("call {} has no pending INVITE", self.key))
        })
    }

    async fn reject_locked(
        &self,
        ua: &UaCore,
        session: &mut CallSession,
        status_code: u16,
    ) -> Result<()> {
        if !(300..700).contains(&status_code) {
            return Err(UaError::ProtocolBuild(format!(
                "{} is not a final error status",
                status_code
            )));
        }
        let invite = self.unanswered_invite(session)?;

        invite.send_response(ua, status_code, None, None).await?;
        session.terminate_dialog();
        session.call.reject(status_code)?;
        info!("Call {} rejected with {}", self.key, status_code);
        Ok(())
    }

    async fn cancel_locked(&self, ua: &UaCore, session: &mut CallSession) -> Result<()> {
        let state = session.call.state();
        if self.direction != CallDirection::Outbound || !state.is_early() {
            return Err(UaError::InvalidStateTransition(format!(
                "cannot cancel call {} in state {}",
                self.key, state
            )));
        }
        let invite = session.invite_client.clone().ok_or_else(|| {
            UaError::InvalidStateTransition(format!("call {} has no INVITE to cancel", self.key))
        })?;

        ClientTransaction::cancel(ua, &invite, self, session).await?;
        session.terminate_dialog();
        session.call.cancel()?;
        info!("Call {} cancelled", self.key);
        Ok(())
    }

    /// BYE within the dialog; the call ends when the BYE is answered
    pub(crate) async fn send_bye(&self, ua: &UaCore, session: &mut CallSession) -> Result<()> {
        let local_uri = session.call.local_uri().to_string();
        let remote_uri = session.call.remote_uri().to_string();
        let bye = Arc::new(ClientTransaction::create(
            ua,
            SipMethod::Bye,
            Some((self, &mut *session)),
            &local_uri,
            &remote_uri,
            0,
        )?);

        ua.register_client(bye.clone()).await;
        if let Err(e) = bye.send_request(ua, None).await {
            ua.unregister_client(bye.key()).await;
            return Err(e);
        }
        debug!("Call {} sent BYE {}", self.key, bye.key());
        Ok(())
    }
}

impl fmt::Debug for SipCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipCall")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("direction", &self.direction)
            .finish()
    }
}
