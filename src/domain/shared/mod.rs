//! Shared kernel - types used by the call, dialog and endpoint contexts

pub mod error;
pub mod events;
pub mod result;
pub mod value_objects;

pub use error::UaError;
pub use result::Result;
pub use value_objects::*;
