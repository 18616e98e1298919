//! Application layer - the user agent
//!
//! This layer orchestrates domain calls over the SIP stack:
//! - Dispatching stack events to calls and transactions
//! - Client and server transaction behaviour per method
//! - Local address registry and registration
//! - Wiring config, transport and dispatcher together

pub mod call;
pub mod client_transaction;
pub mod endpoint;
pub mod server_transaction;
pub mod session;
pub mod user_agent;

pub use call::{CallKey, SipCall};
pub use client_transaction::ClientTransaction;
pub use endpoint::{EndpointHandler, RegistrationState};
pub use server_transaction::ServerTransaction;
pub use session::UaSession;
pub use user_agent::UserAgent;
