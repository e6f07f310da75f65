//! `sagabus-core`: identifiers and the handler error model.
//!
//! This crate contains **pure** primitives shared by every other crate (no IO, no async).

pub mod error;
pub mod id;

pub use error::HandlerError;
pub use id::{CorrelationId, MessageId, MessageType};
