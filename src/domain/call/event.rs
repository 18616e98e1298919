//! Call events and the listener seam

use crate::domain::call::value_object::{CallState, TerminationReason};
use crate::domain::shared::events::{DomainEvent, EventMetadata};
use crate::domain::shared::value_objects::CallId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEventKind {
    Dialing,
    IncomingCall,
    Ringing,
    Established,
    /// Final non-2xx response sent or received
    Rejected { status_code: u16 },
    Cancelled,
    Timeout,
    Terminated(TerminationReason),
}

impl CallEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            CallEventKind::Dialing => "call.dialing",
            CallEventKind::IncomingCall => "call.incoming",
            CallEventKind::Ringing => "call.ringing",
            CallEventKind::Established => "call.established",
            CallEventKind::Rejected { .. } => "call.rejected",
            CallEventKind::Cancelled => "call.cancelled",
            CallEventKind::Timeout => "call.timeout",
            CallEventKind::Terminated(_) => "call.terminated",
        }
    }
}

/// One call-state transition, delivered to every listener of the call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub metadata: EventMetadata,
    pub call_id: CallId,
    pub kind: CallEventKind,
    /// State entered by the transition
    pub state: CallState,
}

impl CallEvent {
    pub fn new(call_id: CallId, sequence: u64, kind: CallEventKind, state: CallState) -> Self {
        Self {
            metadata: EventMetadata::new(sequence),
            call_id,
            kind,
            state,
        }
    }
}

impl DomainEvent for CallEvent {
    fn event_type(&self) -> &'static str {
        self.kind.name()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }

    fn sequence(&self) -> u64 {
        self.metadata.sequence
    }
}

/// Receives call events.
///
/// Invoked synchronously while the call is locked: implementations must not
/// block, and must spawn a task before calling back into the call.
pub trait CallListener: Send + Sync {
    fn on_call_event(&self, event: &CallEvent);
}
