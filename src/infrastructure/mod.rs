//! Infrastructure layer - Technical implementations
//!
//! This layer contains the SIP wire protocol: messages, dialogs, the
//! transaction layer and the UDP transport behind `MessageStack`.

pub mod protocols;
