//! Call aggregate root

use crate::domain::call::event::{CallEvent, CallEventKind, CallListener};
use crate::domain::call::value_object::{CallDirection, CallState, TerminationReason};
use crate::domain::shared::error::UaError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Call timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallStats {
    /// Talk time, once the call was answered and has ended
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.answered_at, self.ended_at) {
            (Some(answered), Some(ended)) => Some((ended - answered).num_seconds()),
            _ => None,
        }
    }
}

/// Call aggregate root
///
/// Owns the call state machine. Every accepted transition produces exactly one
/// `CallEvent`, handed to each registered listener before the method returns.
/// Rejected transitions leave the state untouched and notify nobody.
pub struct Call {
    id: CallId,
    state: CallState,
    direction: CallDirection,
    local_uri: String,
    remote_uri: String,
    stats: CallStats,
    listeners: Vec<Arc<dyn CallListener>>,
    events_emitted: u64,
}

impl Call {
    pub fn new(direction: CallDirection, local_uri: String, remote_uri: String) -> Self {
        Self {
            id: CallId::new(),
            state: CallState::Idle,
            direction,
            local_uri,
            remote_uri,
            stats: CallStats {
                created_at: Utc::now(),
                answered_at: None,
                ended_at: None,
            },
            listeners: Vec::new(),
            events_emitted: 0,
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn CallListener>) {
        self.listeners.push(listener);
    }

    /// Outbound INVITE went out
    pub fn dial(&mut self) -> Result<()> {
        self.transition_to(CallState::Dialing, CallEventKind::Dialing)
    }

    /// Inbound INVITE arrived
    pub fn incoming(&mut self) -> Result<()> {
        self.transition_to(CallState::Incoming, CallEventKind::IncomingCall)
    }

    pub fn ring(&mut self) -> Result<()> {
        self.transition_to(CallState::Ringing, CallEventKind::Ringing)
    }

    pub fn establish(&mut self) -> Result<()> {
        self.transition_to(CallState::Established, CallEventKind::Established)?;
        self.stats.answered_at = Some(Utc::now());
        Ok(())
    }

    pub fn reject(&mut self, status_code: u16) -> Result<()> {
        self.transition_to(
            CallState::Terminated(TerminationReason::Rejected),
            CallEventKind::Rejected { status_code },
        )
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition_to(
            CallState::Terminated(TerminationReason::Cancelled),
            CallEventKind::Cancelled,
        )
    }

    pub fn time_out(&mut self) -> Result<()> {
        self.transition_to(
            CallState::Terminated(TerminationReason::Timeout),
            CallEventKind::Timeout,
        )
    }

    /// Ends the call for any other reason (hangups, errors)
    pub fn end(&mut self, reason: TerminationReason) -> Result<()> {
        let kind = match reason {
            TerminationReason::Rejected => CallEventKind::Rejected { status_code: 0 },
            TerminationReason::Cancelled => CallEventKind::Cancelled,
            TerminationReason::Timeout => CallEventKind::Timeout,
            other => CallEventKind::Terminated(other),
        };
        self.transition_to(CallState::Terminated(reason), kind)
    }

    fn transition_to(&mut self, new_state: CallState, kind: CallEventKind) -> Result<()> {
        if !self.state.can_transition_to(&new_state) {
            debug!(
                "Call {} refused transition {} -> {}",
                self.id, self.state, new_state
            );
            return Err(UaError::InvalidStateTransition(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            )));
        }

        info!("Call {}: {} -> {}", self.id, self.state, new_state);
        self.state = new_state;
        if new_state.is_terminated() {
            self.stats.ended_at = Some(Utc::now());
        }

        self.events_emitted += 1;
        let event = CallEvent::new(self.id, self.events_emitted, kind, new_state);
        for listener in &self.listeners {
            listener.on_call_event(&event);
        }
        Ok(())
    }

    // Getters
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn local_uri(&self) -> &str {
        &self.local_uri
    }

    pub fn remote_uri(&self) -> &str {
        &self.remote_uri
    }

    pub fn stats(&self) -> CallStats {
        self.stats
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("direction", &self.direction)
            .field("local_uri", &self.local_uri)
            .field("remote_uri", &self.remote_uri)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::events::DomainEvent;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<CallEventKind>>,
        sequences: Mutex<Vec<u64>>,
    }

    impl CallListener for Recorder {
        fn on_call_event(&self, event: &CallEvent) {
            self.events.lock().unwrap().push(event.kind);
            self.sequences.lock().unwrap().push(event.sequence());
        }
    }

    fn outbound() -> (Call, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut call = Call::new(
            CallDirection::Outbound,
            "sip:client@example.org".to_string(),
            "sip:server@example.org".to_string(),
        );
        call.add_listener(recorder.clone());
        (call, recorder)
    }

    #[test]
    fn test_call_lifecycle() {
        let (mut call, recorder) = outbound();
        assert_eq!(call.state(), CallState::Idle);

        call.dial().unwrap();
        call.ring().unwrap();
        call.establish().unwrap();
        assert!(call.stats().answered_at.is_some());

        call.end(TerminationReason::LocalHangup).unwrap();
        assert_eq!(
            call.state(),
            CallState::Terminated(TerminationReason::LocalHangup)
        );
        assert!(call.stats().ended_at.is_some());
        assert!(call.stats().duration_seconds().is_some());

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                CallEventKind::Dialing,
                CallEventKind::Ringing,
                CallEventKind::Established,
                CallEventKind::Terminated(TerminationReason::LocalHangup),
            ]
        );
        assert_eq!(*recorder.sequences.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_reject_carries_status() {
        let (mut call, recorder) = outbound();
        call.dial().unwrap();
        call.reject(486).unwrap();

        assert_eq!(
            recorder.events.lock().unwrap().last(),
            Some(&CallEventKind::Rejected { status_code: 486 })
        );
    }

    #[test]
    fn test_invalid_transition_emits_nothing() {
        let (mut call, recorder) = outbound();
        call.dial().unwrap();
        call.time_out().unwrap();

        let err = call.time_out().unwrap_err();
        assert!(matches!(err, UaError::InvalidStateTransition(_)));
        assert!(call.establish().is_err());
        assert_eq!(recorder.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_inbound_call() {
        let mut call = Call::new(
            CallDirection::Inbound,
            "sip:server@example.org".to_string(),
            "sip:client@example.org".to_string(),
        );
        call.incoming().unwrap();
        call.ring().unwrap();
        call.cancel().unwrap();
        assert_eq!(call.state(), CallState::Terminated(TerminationReason::Cancelled));
        assert_eq!(call.direction(), CallDirection::Inbound);
    }
}
