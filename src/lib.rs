//! sipua - a SIP user agent signaling core
//!
//! Places and receives calls over RFC 3261 transactions and dialogs. Media
//! is out of scope; SDP bodies are carried through opaquely.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{EndpointHandler, RegistrationState, SipCall, UaSession, UserAgent};
pub use domain::shared::error::UaError;
pub use domain::shared::result::Result;
