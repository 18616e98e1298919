//! SIP protocol plumbing (RFC 3261)
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   User Agent            │
//! │  (calls, dispatcher)    │
//! └───────────┬─────────────┘
//!             │ MessageStack / StackEvent
//! ┌───────────▼─────────────┐
//! │    Dialog Layer         │
//! │   (SIP Dialogs)         │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client/Server TXN)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │  (UDP)                  │
//! └─────────────────────────┘
//! ```

pub mod builder;
pub mod dialog;
pub mod keep_alive;
pub mod message;
pub mod stack;
pub mod transaction;
pub mod transport;
pub mod udp_stack;

pub use builder::{RequestBuilder, ResponseBuilder};
pub use dialog::{Dialog, DialogId, DialogState};
pub use keep_alive::NatKeepAlive;
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use stack::{
    LocalEndpoint, MessageStack, RequestEvent, ResponseEvent, StackEvent, TerminatedEvent,
    TimeoutEvent, TransactionKey, TransactionRef,
};
pub use transaction::{SipTimers, TransactionLayer, TransactionState};
pub use transport::TransportProtocol;
pub use udp_stack::UdpMessageStack;
