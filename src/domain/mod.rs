//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - Aggregates: the `Call` and its state machine
//! - Value Objects: identifiers, addresses, call states
//! - Domain Events: call state changes delivered to listeners

pub mod call;
pub mod shared;

// Re-export commonly used types
pub use shared::{Result, UaError};
