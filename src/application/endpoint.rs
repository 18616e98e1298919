//! Local addresses the user agent answers for

use super::call::SipCall;
use std::fmt;

/// Registration status of a local address with the configured registrar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered { expires: u32 },
    Failed { status_code: u16 },
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "UNREGISTERED"),
            RegistrationState::Registering => write!(f, "REGISTERING"),
            RegistrationState::Registered { expires } => write!(f, "REGISTERED({}s)", expires),
            RegistrationState::Failed { status_code } => write!(f, "FAILED({})", status_code),
        }
    }
}

/// Application callbacks for one local address.
///
/// Called from dispatcher workers; implementations should hand long work
/// off to their own tasks.
pub trait EndpointHandler: Send + Sync {
    /// A new inbound call is ringing. Answer with `SipCall::accept` or
    /// `SipCall::reject`.
    fn on_incoming_call(&self, call: SipCall);

    fn on_registration_state(&self, uri: &str, state: RegistrationState) {
        let _ = (uri, state);
    }
}

/// Registry entry of a local address
pub(crate) struct EndpointEntry {
    pub(crate) uri: String,
    pub(crate) handler: std::sync::Arc<dyn EndpointHandler>,
    pub(crate) registration: RegistrationState,
    /// REGISTER refreshes reuse one Call-ID with increasing CSeq
    pub(crate) register_call_id: Option<String>,
    pub(crate) register_seq: u32,
}

impl EndpointEntry {
    pub(crate) fn new(uri: &str, handler: std::sync::Arc<dyn EndpointHandler>) -> Self {
        Self {
            uri: uri.to_string(),
            handler,
            registration: RegistrationState::Unregistered,
            register_call_id: None,
            register_seq: 0,
        }
    }

    pub(crate) fn set_registration(&mut self, state: RegistrationState) {
        self.registration = state;
        self.handler.on_registration_state(&self.uri, state);
    }
}
