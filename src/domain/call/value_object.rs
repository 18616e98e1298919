//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Received from the remote peer
    Inbound,
    /// Dialed by the local application
    Outbound,
}

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Created, nothing exchanged yet
    Idle,
    /// Outbound INVITE sent, no response yet
    Dialing,
    /// Inbound INVITE received
    Incoming,
    /// Provisional response sent or received
    Ringing,
    /// Final 2xx exchanged and acknowledged
    Established,
    /// Call is over
    Terminated(TerminationReason),
}

impl CallState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: &CallState) -> bool {
        use CallState::*;

        match (self, new_state) {
            (Idle, Dialing) | (Idle, Incoming) => true,
            (Idle, Terminated(TerminationReason::Error)) => true,

            (Dialing, Ringing) | (Dialing, Established) => true,
            (Incoming, Ringing) | (Incoming, Established) => true,
            (Ringing, Established) => true,
            (Dialing, Terminated(_)) | (Incoming, Terminated(_)) | (Ringing, Terminated(_)) => {
                true
            }

            // An answered call can no longer be rejected or cancelled
            (Established, Terminated(reason)) => !matches!(
                reason,
                TerminationReason::Rejected | TerminationReason::Cancelled
            ),

            // Nothing leaves Terminated
            (Terminated(_), _) => false,

            _ => false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, CallState::Terminated(_))
    }

    /// Inbound or outbound setup still in progress
    pub fn is_early(&self) -> bool {
        matches!(
            self,
            CallState::Dialing | CallState::Incoming | CallState::Ringing
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "IDLE"),
            CallState::Dialing => write!(f, "DIALING"),
            CallState::Incoming => write!(f, "INCOMING"),
            CallState::Ringing => write!(f, "RINGING"),
            CallState::Established => write!(f, "ESTABLISHED"),
            CallState::Terminated(reason) => write!(f, "TERMINATED({})", reason),
        }
    }
}

/// Why a call reached `Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationReason {
    RemoteHangup,
    LocalHangup,
    Rejected,
    Cancelled,
    Timeout,
    Error,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminationReason::RemoteHangup => "REMOTE_HANGUP",
            TerminationReason::LocalHangup => "LOCAL_HANGUP",
            TerminationReason::Rejected => "REJECTED",
            TerminationReason::Cancelled => "CANCELLED",
            TerminationReason::Timeout => "TIMEOUT",
            TerminationReason::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}
