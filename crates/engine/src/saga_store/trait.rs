use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use sagabus_core::{CorrelationId, MessageId};
use sagabus_messages::MessageEnvelope;

/// Lifecycle status of a saga instance.
///
/// `NonExistent → Active → Completed`; nothing leaves `Completed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Active,
    Completed,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Active => "active",
            SagaStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SagaStatus::Active),
            "completed" => Some(SagaStatus::Completed),
            _ => None,
        }
    }
}

/// Persisted state of one saga instance.
///
/// ## Identity
///
/// An instance is keyed by its correlation id, unique across the whole store
/// (not per saga type).
///
/// ## Versioning
///
/// `version` is the value read from the store. `update()` succeeds only when the
/// stored version still equals it, and bumps the stored version by one. A freshly
/// constructed instance has version 0; `save_new()` persists it as version 1.
///
/// ## Exactly-once application
///
/// `applied_messages` keeps the ids of the most recently applied messages (bounded
/// window), so a redelivered message is recognised without re-running the saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: CorrelationId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub state: JsonValue,
    pub version: u64,
    pub timeout_deadline: Option<DateTime<Utc>>,
    pub applied_messages: Vec<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaInstance {
    pub fn new(id: CorrelationId, saga_type: impl Into<String>, state: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id,
            saga_type: saga_type.into(),
            status: SagaStatus::Active,
            state,
            version: 0,
            timeout_deadline: None,
            applied_messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SagaStatus::Active
    }

    pub fn has_applied(&self, message_id: MessageId) -> bool {
        self.applied_messages.contains(&message_id)
    }

    /// Remember `message_id`, keeping at most `window` ids (oldest dropped first).
    pub fn record_applied(&mut self, message_id: MessageId, window: usize) {
        if self.has_applied(message_id) {
            return;
        }
        self.applied_messages.push(message_id);
        let window = window.max(1);
        if self.applied_messages.len() > window {
            let excess = self.applied_messages.len() - window;
            self.applied_messages.drain(..excess);
        }
    }
}

/// Outbound message staged in the same transaction as a saga transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message_id: MessageId,
    pub correlation_id: Option<CorrelationId>,
    pub envelope: MessageEnvelope,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(envelope: MessageEnvelope) -> Self {
        Self {
            message_id: envelope.message_id(),
            correlation_id: envelope.correlation_id().cloned(),
            envelope,
            created_at: Utc::now(),
        }
    }
}

/// A timeout deadline persisted on an active instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedTimeout {
    pub correlation_id: CorrelationId,
    pub saga_type: String,
    pub deadline: DateTime<Utc>,
    pub version: u64,
}

/// Saga store operation error.
///
/// ## Error Categories
///
/// - **Races** (`DuplicateInstance`, `StaleWrite`): expected under concurrency,
///   retried by the dispatch engine
/// - **NotFound**: no instance for the correlation id
/// - **Serialization / Backend**: infrastructure failures, surfaced per message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SagaStoreError {
    #[error("saga instance not found: {0}")]
    NotFound(CorrelationId),

    #[error("saga instance already exists: {0}")]
    DuplicateInstance(CorrelationId),

    #[error("stale write to saga instance {id}: expected version {expected}")]
    StaleWrite { id: CorrelationId, expected: u64 },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

impl SagaStoreError {
    /// Races the dispatch engine resolves by retrying the whole step.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SagaStoreError::DuplicateInstance(_) | SagaStoreError::StaleWrite { .. }
        )
    }
}

/// Transactional saga instance store.
///
/// ## Transaction Scope
///
/// All reads and writes for one inbound envelope go through one
/// [`SagaTransaction`]: instance mutation and staged outbound messages commit
/// together or not at all.
///
/// ## Concurrency Contract
///
/// Two concurrent transactions against the same instance id cannot both commit
/// with divergent results:
/// - two `save_new` for one id: exactly one commits, the other fails with
///   `DuplicateInstance` (at `save_new` or at `commit`)
/// - two `update` from the same read version: exactly one commits, the other
///   fails with `StaleWrite`
///
/// Implementations must enforce this even without crash durability.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn SagaTransaction>, SagaStoreError>;

    /// Committed outbox entries not yet handed to the Transport, oldest first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, SagaStoreError>;

    async fn mark_dispatched(&self, ids: &[MessageId]) -> Result<(), SagaStoreError>;

    /// Deadlines of active instances (re-armed at start).
    async fn armed_timeouts(&self) -> Result<Vec<ArmedTimeout>, SagaStoreError>;
}

/// One unit of work against the store.
#[async_trait]
pub trait SagaTransaction: Send {
    async fn get_instance(&mut self, id: &CorrelationId) -> Result<SagaInstance, SagaStoreError>;

    /// Insert a new instance; `DuplicateInstance` if the id is already taken.
    async fn save_new(&mut self, instance: SagaInstance) -> Result<(), SagaStoreError>;

    /// Write back an instance read in this transaction; `StaleWrite` if it changed since.
    async fn update(&mut self, instance: SagaInstance) -> Result<(), SagaStoreError>;

    async fn stage_outbox(&mut self, envelopes: &[MessageEnvelope]) -> Result<(), SagaStoreError>;

    async fn commit(self: Box<Self>) -> Result<(), SagaStoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), SagaStoreError>;
}

#[async_trait]
impl<S> SagaStore for Arc<S>
where
    S: SagaStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn SagaTransaction>, SagaStoreError> {
        (**self).begin().await
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, SagaStoreError> {
        (**self).pending_outbox(limit).await
    }

    async fn mark_dispatched(&self, ids: &[MessageId]) -> Result<(), SagaStoreError> {
        (**self).mark_dispatched(ids).await
    }

    async fn armed_timeouts(&self) -> Result<Vec<ArmedTimeout>, SagaStoreError> {
        (**self).armed_timeouts().await
    }
}
