use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use sagabus_core::{CorrelationId, MessageId};
use sagabus_messages::MessageEnvelope;

use super::r#trait::{
    ArmedTimeout, OutboxEntry, SagaInstance, SagaStatus, SagaStore, SagaStoreError,
    SagaTransaction,
};

#[derive(Debug, Default)]
struct Arena {
    instances: HashMap<CorrelationId, SagaInstance>,
    /// Undispatched entries only, in staging order.
    outbox: Vec<OutboxEntry>,
}

/// In-memory transactional saga store.
///
/// Intended for tests/dev. Not durable, but enforces the full concurrency
/// contract: writes are staged per transaction and re-validated against the
/// arena under one lock at commit, so two transactions racing on one instance id
/// cannot both commit.
#[derive(Debug, Default, Clone)]
pub struct InMemorySagaStore {
    arena: Arc<RwLock<Arena>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed snapshot of one instance.
    pub fn instance(&self, id: &CorrelationId) -> Option<SagaInstance> {
        self.arena.read().ok()?.instances.get(id).cloned()
    }

    /// Committed snapshot of every instance.
    pub fn instances(&self) -> Vec<SagaInstance> {
        self.arena
            .read()
            .map(|a| a.instances.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed outbox entries not yet marked dispatched, in staging order.
    pub fn outbox(&self) -> Vec<OutboxEntry> {
        self.arena.read().map(|a| a.outbox.clone()).unwrap_or_default()
    }

    fn poisoned() -> SagaStoreError {
        SagaStoreError::Backend("saga arena lock poisoned".to_string())
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn begin(&self) -> Result<Box<dyn SagaTransaction>, SagaStoreError> {
        Ok(Box::new(InMemoryTransaction {
            arena: Arc::clone(&self.arena),
            writes: Vec::new(),
            outbox: Vec::new(),
        }))
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, SagaStoreError> {
        let arena = self.arena.read().map_err(|_| Self::poisoned())?;
        Ok(arena.outbox.iter().take(limit).cloned().collect())
    }

    async fn mark_dispatched(&self, ids: &[MessageId]) -> Result<(), SagaStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let dispatched: HashSet<&MessageId> = ids.iter().collect();
        let mut arena = self.arena.write().map_err(|_| Self::poisoned())?;
        arena
            .outbox
            .retain(|entry| !dispatched.contains(&entry.message_id));
        Ok(())
    }

    async fn armed_timeouts(&self) -> Result<Vec<ArmedTimeout>, SagaStoreError> {
        let arena = self.arena.read().map_err(|_| Self::poisoned())?;
        Ok(arena
            .instances
            .values()
            .filter(|i| i.status == SagaStatus::Active)
            .filter_map(|i| {
                i.timeout_deadline.map(|deadline| ArmedTimeout {
                    correlation_id: i.id.clone(),
                    saga_type: i.saga_type.clone(),
                    deadline,
                    version: i.version,
                })
            })
            .collect())
    }
}

#[derive(Debug)]
enum StagedWrite {
    Insert(SagaInstance),
    Update { expected: u64, instance: SagaInstance },
}

impl StagedWrite {
    fn id(&self) -> &CorrelationId {
        match self {
            StagedWrite::Insert(i) => &i.id,
            StagedWrite::Update { instance, .. } => &instance.id,
        }
    }

    fn instance(&self) -> &SagaInstance {
        match self {
            StagedWrite::Insert(i) => i,
            StagedWrite::Update { instance, .. } => instance,
        }
    }
}

struct InMemoryTransaction {
    arena: Arc<RwLock<Arena>>,
    writes: Vec<StagedWrite>,
    outbox: Vec<OutboxEntry>,
}

impl InMemoryTransaction {
    fn staged(&self, id: &CorrelationId) -> Option<usize> {
        self.writes.iter().position(|w| w.id() == id)
    }
}

#[async_trait]
impl SagaTransaction for InMemoryTransaction {
    async fn get_instance(&mut self, id: &CorrelationId) -> Result<SagaInstance, SagaStoreError> {
        if let Some(idx) = self.staged(id) {
            return Ok(self.writes[idx].instance().clone());
        }

        let arena = self.arena.read().map_err(|_| InMemorySagaStore::poisoned())?;
        arena
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| SagaStoreError::NotFound(id.clone()))
    }

    async fn save_new(&mut self, mut instance: SagaInstance) -> Result<(), SagaStoreError> {
        if self.staged(&instance.id).is_some() {
            return Err(SagaStoreError::DuplicateInstance(instance.id));
        }
        {
            let arena = self.arena.read().map_err(|_| InMemorySagaStore::poisoned())?;
            if arena.instances.contains_key(&instance.id) {
                return Err(SagaStoreError::DuplicateInstance(instance.id));
            }
        }

        instance.version = 1;
        instance.updated_at = Utc::now();
        self.writes.push(StagedWrite::Insert(instance));
        Ok(())
    }

    async fn update(&mut self, mut instance: SagaInstance) -> Result<(), SagaStoreError> {
        let expected = instance.version;

        if let Some(idx) = self.staged(&instance.id) {
            let staged_version = self.writes[idx].instance().version;
            if staged_version != expected {
                return Err(SagaStoreError::StaleWrite {
                    id: instance.id,
                    expected,
                });
            }
            // Rewriting a staged instance keeps its staged version.
            instance.updated_at = Utc::now();
            match &mut self.writes[idx] {
                StagedWrite::Insert(staged) => *staged = instance,
                StagedWrite::Update {
                    instance: staged, ..
                } => *staged = instance,
            }
            return Ok(());
        }

        {
            let arena = self.arena.read().map_err(|_| InMemorySagaStore::poisoned())?;
            match arena.instances.get(&instance.id) {
                None => return Err(SagaStoreError::NotFound(instance.id)),
                Some(current) if current.version != expected => {
                    return Err(SagaStoreError::StaleWrite {
                        id: instance.id,
                        expected,
                    });
                }
                Some(_) => {}
            }
        }

        instance.version = expected + 1;
        instance.updated_at = Utc::now();
        self.writes.push(StagedWrite::Update { expected, instance });
        Ok(())
    }

    async fn stage_outbox(&mut self, envelopes: &[MessageEnvelope]) -> Result<(), SagaStoreError> {
        self.outbox
            .extend(envelopes.iter().cloned().map(OutboxEntry::new));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SagaStoreError> {
        let this = *self;
        let mut arena = this.arena.write().map_err(|_| InMemorySagaStore::poisoned())?;

        // Re-validate every staged write before applying any of them.
        for write in &this.writes {
            match write {
                StagedWrite::Insert(instance) => {
                    if arena.instances.contains_key(&instance.id) {
                        return Err(SagaStoreError::DuplicateInstance(instance.id.clone()));
                    }
                }
                StagedWrite::Update { expected, instance } => {
                    match arena.instances.get(&instance.id) {
                        Some(current) if current.version == *expected => {}
                        Some(_) => {
                            return Err(SagaStoreError::StaleWrite {
                                id: instance.id.clone(),
                                expected: *expected,
                            });
                        }
                        None => return Err(SagaStoreError::NotFound(instance.id.clone())),
                    }
                }
            }
        }

        for write in this.writes {
            let instance = match write {
                StagedWrite::Insert(i) => i,
                StagedWrite::Update { instance, .. } => instance,
            };
            arena.instances.insert(instance.id.clone(), instance);
        }
        arena.outbox.extend(this.outbox);

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SagaStoreError> {
        Ok(())
    }
}
