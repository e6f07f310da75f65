//! Transport contract (mechanics only).
//!
//! A Transport moves envelopes between services: point-to-point delivery of
//! commands and replies, fan-out of events to exchange/topic subscribers, and
//! hand-off of inbound envelopes to the engine through an [`Ingress`].
//!
//! Delivery is at-least-once. The engine deduplicates saga transitions by message
//! id; plain handlers must be idempotent.

use async_trait::async_trait;
use thiserror::Error;

use crate::{Ingress, MessageEnvelope};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker/connection is temporarily unavailable.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the message.
    #[error("transport rejected message: {0}")]
    Rejected(String),

    /// The transport has been stopped.
    #[error("transport closed")]
    Closed,
}

/// What the local bus asks the Transport to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportBinding {
    /// Commands and replies addressed to this service are delivered to the bus.
    pub service: String,
    /// `(exchange, topic)` pairs the bus subscribes to.
    pub topics: Vec<(String, String)>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a command or reply to `service`.
    async fn deliver(&self, service: &str, envelope: MessageEnvelope) -> Result<(), TransportError>;

    /// Publish an event to every subscriber of `exchange`/`topic`.
    async fn publish(
        &self,
        exchange: &str,
        topic: &str,
        envelope: MessageEnvelope,
    ) -> Result<(), TransportError>;

    /// Start consuming for `binding`, feeding inbound envelopes to `ingress`.
    async fn start(&self, binding: TransportBinding, ingress: Ingress) -> Result<(), TransportError>;

    /// Stop consuming. Outbound calls after `stop` fail with [`TransportError::Closed`].
    async fn stop(&self) -> Result<(), TransportError>;
}
