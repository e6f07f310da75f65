//! Handler error model.

use thiserror::Error;

/// Failure raised by application handler code.
///
/// Keep this focused on deterministic failures of a single message (validation,
/// business rejection, payload mismatches). Infrastructure failures belong to the
/// engine's own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The handler refused the message for a business reason.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The payload could not be decoded into the expected message type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// An outbound message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// `reply` was requested but the inbound message carries no reply address.
    #[error("message has no reply address")]
    NoReplyAddress,
}

impl HandlerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }
}
