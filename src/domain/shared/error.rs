//! User agent errors

use crate::infrastructure::protocols::sip::message::SipError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UaError {
    /// A header or address could not be built. Fatal to the request, never retried.
    #[error("Protocol build error: {0}")]
    ProtocolBuild(String),

    /// No active transport endpoint to send through.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Transport send failed: {0}")]
    TransportSend(String),

    /// The stack refused to terminate a transaction that is still in use.
    #[error("Transaction busy: {0}")]
    TransactionBusy(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<SipError> for UaError {
    fn from(err: SipError) -> Self {
        match err {
            SipError::ParseError(msg) | SipError::InvalidMessage(msg) => UaError::ProtocolBuild(msg),
            SipError::TransportError(msg) => UaError::TransportSend(msg),
            SipError::TransportUnavailable(msg) => UaError::TransportUnavailable(msg),
            SipError::TransactionInUse(msg) => UaError::TransactionBusy(msg),
            SipError::TransactionError(msg) => UaError::NotFound(msg),
        }
    }
}

impl From<rsip::Error> for UaError {
    fn from(err: rsip::Error) -> Self {
        UaError::ProtocolBuild(err.to_string())
    }
}

impl From<config::ConfigError> for UaError {
    fn from(err: config::ConfigError) -> Self {
        UaError::Config(err.to_string())
    }
}
