//! Call bounded context - the call state machine and its listeners

pub mod aggregate;
pub mod event;
pub mod value_object;

pub use aggregate::{Call, CallStats};
pub use event::{CallEvent, CallEventKind, CallListener};
pub use value_object::{CallDirection, CallState, TerminationReason};
