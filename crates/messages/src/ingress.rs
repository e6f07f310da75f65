//! Inbound channel from a Transport into the engine.
//!
//! A Transport hands each inbound envelope to the engine through an [`Ingress`]
//! and learns the processing outcome from the returned future. Success means the
//! message is fully processed (acknowledge it); a [`ProcessingFailure`] means the
//! Transport's own retry/dead-letter policy applies.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use sagabus_core::MessageId;

use crate::MessageEnvelope;

/// Category of a processing failure, so Transports can decide on retry vs dead-letter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Handler,
    Orphaned,
    ConcurrencyExhausted,
    MissingCorrelation,
    Unroutable,
    Store,
    Transport,
    ShuttingDown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Handler => "handler",
            FailureKind::Orphaned => "orphaned",
            FailureKind::ConcurrencyExhausted => "concurrency_exhausted",
            FailureKind::MissingCorrelation => "missing_correlation",
            FailureKind::Unroutable => "unroutable",
            FailureKind::Store => "store",
            FailureKind::Transport => "transport",
            FailureKind::ShuttingDown => "shutting_down",
        }
    }
}

/// Processing of an inbound message failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("message {message_id} failed ({}): {reason}", kind.as_str())]
pub struct ProcessingFailure {
    pub message_id: MessageId,
    pub kind: FailureKind,
    pub reason: String,
}

impl ProcessingFailure {
    pub fn new(message_id: MessageId, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            message_id,
            kind,
            reason: reason.into(),
        }
    }
}

/// Outcome of processing one inbound message.
pub type ProcessingOutcome = Result<(), ProcessingFailure>;

/// One inbound envelope plus the slot its outcome is reported to.
#[derive(Debug)]
pub struct Inbound {
    pub envelope: MessageEnvelope,
    pub reply: Option<oneshot::Sender<ProcessingOutcome>>,
}

impl Inbound {
    /// Report the outcome (no-op for fire-and-forget submissions).
    pub fn complete(self, outcome: ProcessingOutcome) {
        if let Some(reply) = self.reply {
            let _ = reply.send(outcome);
        }
    }
}

/// Cloneable handle used to submit inbound envelopes to the engine.
#[derive(Debug, Clone)]
pub struct Ingress {
    sender: mpsc::Sender<Inbound>,
}

impl Ingress {
    /// Create an ingress with a bounded queue of `capacity` envelopes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Inbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Submit an envelope and wait until it has been fully processed.
    pub async fn submit(&self, envelope: MessageEnvelope) -> ProcessingOutcome {
        let message_id = envelope.message_id();
        let (tx, rx) = oneshot::channel();
        let inbound = Inbound {
            envelope,
            reply: Some(tx),
        };

        if self.sender.send(inbound).await.is_err() {
            return Err(Self::closed(message_id));
        }

        rx.await.unwrap_or_else(|_| Err(Self::closed(message_id)))
    }

    /// Submit an envelope without waiting for the outcome.
    ///
    /// Returns `false` when the engine is no longer accepting messages.
    pub async fn enqueue(&self, envelope: MessageEnvelope) -> bool {
        self.sender
            .send(Inbound {
                envelope,
                reply: None,
            })
            .await
            .is_ok()
    }

    fn closed(message_id: MessageId) -> ProcessingFailure {
        ProcessingFailure::new(message_id, FailureKind::ShuttingDown, "bus is not accepting messages")
    }
}
