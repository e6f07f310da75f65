//! Dispatch Engine: the orchestration pipeline for inbound envelopes.
//!
//! ## Execution Flow
//!
//! ```text
//! Envelope
//!   ↓
//! 1. Resolve route (type, or exchange + topic + type for events)
//!   ↓
//! 2. Run the plain handler, if any (no transaction; failure aborts here)
//!   ↓
//! 3. No saga on the route → deliver outbound messages, done
//!   ↓
//! 4. Resolve the correlation id (envelope, saga payload, or fresh id for starters)
//!   ↓
//! 5. Saga step in one store transaction:
//!      load instance (or construct one for a starter) → transition → write
//!      → stage outbound messages in the outbox → commit
//!   ↓
//! 6. After commit: arm/cancel the timeout, hand the outbox to the Transport
//! ```
//!
//! `DuplicateInstance` and `StaleWrite` restart step 5 from scratch (bounded, with
//! linear backoff). A loser of a starter race therefore re-reads and is applied as an
//! update of the winner's instance.
//!
//! Timeout triggers skip steps 1-4: they name their saga definition and carry the
//! correlation id and deadline they were armed with.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use sagabus_core::{CorrelationId, HandlerError, MessageId, MessageType};
use sagabus_messages::{
    Destination, FailureKind, Invocation, MessageEnvelope, MessageKind, ProcessingFailure,
    RouteKey, SagaDefinition, TimerRequest, Transition, Transport, TransportError,
};

use crate::config::BusConfig;
use crate::outbox;
use crate::registry::{Route, RoutingTable};
use crate::saga_store::{SagaInstance, SagaStatus, SagaStore, SagaStoreError, SagaTransaction};
use crate::stats::BusStats;
use crate::timeouts::{TimeoutScheduler, TimeoutTrigger, deadline_after};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// A plain handler or saga transition rejected the message.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// The correlation id matches no instance this message may start or continue.
    #[error("orphaned correlation {correlation_id} for {message_type}")]
    OrphanedCorrelation {
        correlation_id: CorrelationId,
        message_type: MessageType,
    },

    /// Saga-bound message without a correlation id that is not a starter.
    #[error("no correlation id for saga-bound message {0}")]
    MissingCorrelation(MessageType),

    #[error("saga {correlation_id} still conflicting after {attempts} attempts")]
    SagaConcurrencyExhausted {
        correlation_id: CorrelationId,
        attempts: u32,
    },

    #[error("no handler or saga registered for {0}")]
    Unroutable(String),

    #[error(transparent)]
    Store(SagaStoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("bus is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DispatchError::Handler(_) => FailureKind::Handler,
            DispatchError::OrphanedCorrelation { .. } => FailureKind::Orphaned,
            DispatchError::MissingCorrelation(_) => FailureKind::MissingCorrelation,
            DispatchError::SagaConcurrencyExhausted { .. } => FailureKind::ConcurrencyExhausted,
            DispatchError::Unroutable(_) => FailureKind::Unroutable,
            DispatchError::Store(_) => FailureKind::Store,
            DispatchError::Transport(_) => FailureKind::Transport,
            DispatchError::ShuttingDown => FailureKind::ShuttingDown,
        }
    }

    /// Transport-facing form of this error.
    pub fn into_failure(self, message_id: MessageId) -> ProcessingFailure {
        ProcessingFailure::new(message_id, self.kind(), self.to_string())
    }
}

/// What processing an envelope did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Only plain handlers ran.
    Handled,
    /// A new saga instance was created (and is still active).
    SagaStarted,
    /// An existing instance was updated (and is still active).
    SagaUpdated,
    /// The transition completed the instance.
    SagaCompleted,
    /// The message was already applied to the instance.
    Duplicate,
    /// The instance is completed, or a timeout trigger is stale.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub message_id: MessageId,
    pub outcome: DispatchOutcome,
    pub saga_type: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    /// Saga step attempts (0 when no saga was involved).
    pub attempts: u32,
    /// Outbound messages produced.
    pub outbound: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub service_name: String,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub dedupe_window: usize,
}

impl From<&BusConfig> for DispatchSettings {
    fn from(config: &BusConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            max_attempts: config.saga.max_attempts.max(1),
            retry_backoff: config.retry_backoff(),
            dedupe_window: config.saga.dedupe_window.max(1),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

/// Which saga transition a step runs.
enum SagaTarget<'a> {
    Message {
        key: &'a RouteKey,
        candidates: &'a [Arc<dyn SagaDefinition>],
    },
    Timeout {
        definition: &'a Arc<dyn SagaDefinition>,
        deadline: DateTime<Utc>,
    },
}

enum TimerAction {
    Keep,
    Arm(DateTime<Utc>),
    Cancel,
}

enum Step {
    Committed {
        saga_type: String,
        created: bool,
        version: u64,
        outcome: DispatchOutcome,
        timer: TimerAction,
        outbox: Vec<MessageEnvelope>,
    },
    Skipped {
        saga_type: Option<String>,
        outcome: DispatchOutcome,
    },
}

enum StepError {
    Retry(SagaStoreError),
    Fail(DispatchError),
}

impl StepError {
    fn store(err: SagaStoreError) -> Self {
        if err.is_retryable() {
            StepError::Retry(err)
        } else {
            StepError::Fail(DispatchError::Store(err))
        }
    }
}

impl From<HandlerError> for StepError {
    fn from(err: HandlerError) -> Self {
        StepError::Fail(DispatchError::Handler(err))
    }
}

/// Dispatch engine.
///
/// Holds the frozen routing table plus the collaborators every step needs. Shared
/// by all ingestion workers; envelopes for different correlation ids never wait on
/// each other here (the store's concurrency contract serializes same-id writes).
pub struct Dispatcher {
    routes: Arc<RoutingTable>,
    store: Arc<dyn SagaStore>,
    transport: Arc<dyn Transport>,
    timeouts: TimeoutScheduler,
    stats: Arc<BusStats>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        routes: Arc<RoutingTable>,
        store: Arc<dyn SagaStore>,
        transport: Arc<dyn Transport>,
        timeouts: TimeoutScheduler,
        stats: Arc<BusStats>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            routes,
            store,
            transport,
            timeouts,
            stats,
            settings,
        }
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Process one inbound envelope end to end.
    #[instrument(
        skip(self, envelope),
        fields(
            message_id = %envelope.message_id(),
            message_type = %envelope.message_type(),
            kind = envelope.kind().as_str()
        ),
        err
    )]
    pub async fn dispatch(&self, envelope: &MessageEnvelope) -> Result<DispatchReport, DispatchError> {
        if envelope.kind() == MessageKind::Timeout {
            return self.dispatch_timeout(envelope).await;
        }

        let key = RouteKey::for_envelope(envelope);
        let route = match self.routes.resolve(&key) {
            Some(route) if route.handler.is_some() || !route.sagas.is_empty() => route,
            _ => return Err(DispatchError::Unroutable(key.to_string())),
        };

        let mut plain_outbound = Vec::new();
        if let Some(handler) = &route.handler {
            let mut invocation = Invocation::for_inbound(envelope, self.settings.service_name.as_str());
            handler(&mut invocation, envelope)?;
            plain_outbound = invocation.into_outbox();
        }

        if route.sagas.is_empty() {
            let outbound = plain_outbound.len();
            for message in plain_outbound {
                outbox::deliver(self.transport.as_ref(), message).await?;
            }
            return Ok(DispatchReport {
                message_id: envelope.message_id(),
                outcome: DispatchOutcome::Handled,
                saga_type: None,
                correlation_id: envelope.correlation_id().cloned(),
                attempts: 0,
                outbound,
            });
        }

        let correlation_id = Self::correlate(envelope, &key, route)?;
        let target = SagaTarget::Message {
            key: &key,
            candidates: &route.sagas,
        };
        self.run_saga(envelope, target, correlation_id, plain_outbound).await
    }

    /// Explicit id, else the first candidate saga able to derive one, else a fresh
    /// id when the type starts a saga.
    fn correlate(
        envelope: &MessageEnvelope,
        key: &RouteKey,
        route: &Route,
    ) -> Result<CorrelationId, DispatchError> {
        if let Some(id) = envelope.correlation_id() {
            return Ok(id.clone());
        }
        if let Some(id) = route.sagas.iter().find_map(|saga| saga.correlate(envelope)) {
            return Ok(id);
        }
        if route.starter(key).is_some() {
            return Ok(CorrelationId::generate());
        }
        Err(DispatchError::MissingCorrelation(envelope.message_type().clone()))
    }

    async fn dispatch_timeout(&self, envelope: &MessageEnvelope) -> Result<DispatchReport, DispatchError> {
        let Destination::Saga { saga_type } = envelope.destination() else {
            return Err(DispatchError::Unroutable(format!(
                "timeout trigger without saga destination ({})",
                envelope.message_type()
            )));
        };
        let definition = self
            .routes
            .saga(saga_type)
            .ok_or_else(|| DispatchError::Unroutable(format!("saga '{saga_type}'")))?;
        let correlation_id = envelope
            .correlation_id()
            .cloned()
            .ok_or_else(|| DispatchError::MissingCorrelation(envelope.message_type().clone()))?;
        let trigger = TimeoutTrigger::from_envelope(envelope)?;

        let target = SagaTarget::Timeout {
            definition,
            deadline: trigger.deadline,
        };
        self.run_saga(envelope, target, correlation_id, Vec::new()).await
    }

    async fn run_saga(
        &self,
        envelope: &MessageEnvelope,
        target: SagaTarget<'_>,
        correlation_id: CorrelationId,
        plain_outbound: Vec<MessageEnvelope>,
    ) -> Result<DispatchReport, DispatchError> {
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self
                .saga_step(envelope, &target, &correlation_id, &plain_outbound)
                .await
            {
                Ok(step) => {
                    return self
                        .finish(envelope, step, correlation_id, attempt, plain_outbound)
                        .await;
                }
                Err(StepError::Retry(err)) => {
                    BusStats::incr(&self.stats.concurrency_retries);
                    debug!(
                        correlation_id = %correlation_id,
                        attempt,
                        error = %err,
                        "saga write conflicted; retrying"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                    }
                }
                Err(StepError::Fail(err)) => return Err(err),
            }
        }

        warn!(
            correlation_id = %correlation_id,
            attempts = max_attempts,
            "saga concurrency retries exhausted"
        );
        Err(DispatchError::SagaConcurrencyExhausted {
            correlation_id,
            attempts: max_attempts,
        })
    }

    /// One attempt: a full transaction, committed only when it wrote something.
    async fn saga_step(
        &self,
        envelope: &MessageEnvelope,
        target: &SagaTarget<'_>,
        correlation_id: &CorrelationId,
        plain_outbound: &[MessageEnvelope],
    ) -> Result<Step, StepError> {
        let mut tx = self.store.begin().await.map_err(StepError::store)?;

        let result = match target {
            SagaTarget::Message { key, candidates } => {
                self.message_transition(tx.as_mut(), envelope, key, candidates, correlation_id, plain_outbound)
                    .await
            }
            SagaTarget::Timeout {
                definition,
                deadline,
            } => {
                self.timeout_transition(tx.as_mut(), envelope, definition, *deadline, correlation_id)
                    .await
            }
        };

        match result {
            Ok(step @ Step::Committed { .. }) => {
                tx.commit().await.map_err(StepError::store)?;
                Ok(step)
            }
            Ok(step @ Step::Skipped { .. }) => {
                if let Err(err) = tx.rollback().await {
                    warn!(error = %err, "rollback of read-only saga step failed");
                }
                Ok(step)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "saga step rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn message_transition(
        &self,
        tx: &mut dyn SagaTransaction,
        envelope: &MessageEnvelope,
        key: &RouteKey,
        candidates: &[Arc<dyn SagaDefinition>],
        correlation_id: &CorrelationId,
        plain_outbound: &[MessageEnvelope],
    ) -> Result<Step, StepError> {
        let orphaned = || {
            StepError::Fail(DispatchError::OrphanedCorrelation {
                correlation_id: correlation_id.clone(),
                message_type: envelope.message_type().clone(),
            })
        };

        let (definition, mut instance, created) = match tx.get_instance(correlation_id).await {
            Ok(instance) => {
                // The owner must declare this message; another saga cannot take over.
                let definition = candidates
                    .iter()
                    .find(|d| d.saga_type() == instance.saga_type)
                    .ok_or_else(orphaned)?;
                (definition, instance, false)
            }
            Err(SagaStoreError::NotFound(_)) => {
                let definition = candidates
                    .iter()
                    .find(|d| d.declaration().is_starter(key))
                    .ok_or_else(orphaned)?;
                let state = definition.initial_state()?;
                let instance = SagaInstance::new(correlation_id.clone(), definition.saga_type(), state);
                (definition, instance, true)
            }
            Err(err) => return Err(StepError::store(err)),
        };

        if !created {
            if instance.has_applied(envelope.message_id()) {
                return Ok(Step::Skipped {
                    saga_type: Some(instance.saga_type),
                    outcome: DispatchOutcome::Duplicate,
                });
            }
            if !instance.is_active() {
                return Ok(Step::Skipped {
                    saga_type: Some(instance.saga_type),
                    outcome: DispatchOutcome::Ignored,
                });
            }
        }

        let mut invocation = Invocation::for_inbound(envelope, self.settings.service_name.as_str())
            .bind_correlation(correlation_id.clone());
        let transition = definition.handle(instance.state.clone(), envelope, &mut invocation)?;

        let previous_deadline = instance.timeout_deadline;
        let initial_timeout = if created {
            definition.declaration().timeout()
        } else {
            None
        };
        self.apply(&mut instance, transition, envelope.message_id(), initial_timeout);

        let mut outbox = plain_outbound.to_vec();
        outbox.extend(invocation.into_outbox());

        self.write(tx, instance, created, previous_deadline, outbox).await
    }

    async fn timeout_transition(
        &self,
        tx: &mut dyn SagaTransaction,
        envelope: &MessageEnvelope,
        definition: &Arc<dyn SagaDefinition>,
        deadline: DateTime<Utc>,
        correlation_id: &CorrelationId,
    ) -> Result<Step, StepError> {
        let saga_type = Some(definition.saga_type().to_string());
        let ignored = || Step::Skipped {
            saga_type: saga_type.clone(),
            outcome: DispatchOutcome::Ignored,
        };

        let mut instance = match tx.get_instance(correlation_id).await {
            Ok(instance) => instance,
            Err(SagaStoreError::NotFound(_)) => return Ok(ignored()),
            Err(err) => return Err(StepError::store(err)),
        };

        if instance.has_applied(envelope.message_id()) {
            return Ok(Step::Skipped {
                saga_type: saga_type.clone(),
                outcome: DispatchOutcome::Duplicate,
            });
        }
        // Stale triggers: instance finished, deadline re-armed, cancelled or consumed.
        if instance.saga_type != definition.saga_type()
            || instance.status != SagaStatus::Active
            || instance.timeout_deadline != Some(deadline)
        {
            debug!(correlation_id = %correlation_id, "stale timeout trigger ignored");
            if instance.saga_type == definition.saga_type() && instance.is_active() {
                if let Some(persisted) = instance.timeout_deadline {
                    // The persisted deadline must stay armed even if this one replaced it.
                    self.timeouts
                        .arm(correlation_id.clone(), instance.saga_type.as_str(), persisted, instance.version);
                }
            }
            return Ok(ignored());
        }

        let previous_deadline = instance.timeout_deadline;
        instance.timeout_deadline = None;

        let mut invocation = Invocation::for_inbound(envelope, self.settings.service_name.as_str())
            .bind_correlation(correlation_id.clone());
        let transition = definition.timeout(instance.state.clone(), &mut invocation)?;
        self.apply(&mut instance, transition, envelope.message_id(), None);

        self.write(tx, instance, false, previous_deadline, invocation.into_outbox())
            .await
    }

    fn apply(
        &self,
        instance: &mut SagaInstance,
        transition: Transition<JsonValue>,
        message_id: MessageId,
        initial_timeout: Option<Duration>,
    ) {
        let timer = transition.timer();
        if transition.is_complete() {
            instance.status = SagaStatus::Completed;
        }
        instance.state = transition.into_state();
        instance.record_applied(message_id, self.settings.dedupe_window);
        instance.timeout_deadline = match timer {
            TimerRequest::Cancel => None,
            TimerRequest::Arm(duration) => Some(deadline_after(duration)),
            TimerRequest::Keep => instance
                .timeout_deadline
                .or_else(|| initial_timeout.map(deadline_after)),
        };
    }

    async fn write(
        &self,
        tx: &mut dyn SagaTransaction,
        instance: SagaInstance,
        created: bool,
        previous_deadline: Option<DateTime<Utc>>,
        outbox: Vec<MessageEnvelope>,
    ) -> Result<Step, StepError> {
        let saga_type = instance.saga_type.clone();
        let outcome = match (instance.status, created) {
            (SagaStatus::Completed, _) => DispatchOutcome::SagaCompleted,
            (SagaStatus::Active, true) => DispatchOutcome::SagaStarted,
            (SagaStatus::Active, false) => DispatchOutcome::SagaUpdated,
        };
        let timer = match instance.timeout_deadline {
            next if next == previous_deadline => TimerAction::Keep,
            Some(deadline) => TimerAction::Arm(deadline),
            None => TimerAction::Cancel,
        };
        // Version the instance holds once this write commits.
        let version = if created { 1 } else { instance.version + 1 };

        if created {
            tx.save_new(instance).await.map_err(StepError::store)?;
        } else {
            tx.update(instance).await.map_err(StepError::store)?;
        }
        if !outbox.is_empty() {
            tx.stage_outbox(&outbox).await.map_err(StepError::store)?;
        }

        Ok(Step::Committed {
            saga_type,
            created,
            version,
            outcome,
            timer,
            outbox,
        })
    }

    async fn finish(
        &self,
        envelope: &MessageEnvelope,
        step: Step,
        correlation_id: CorrelationId,
        attempts: u32,
        plain_outbound: Vec<MessageEnvelope>,
    ) -> Result<DispatchReport, DispatchError> {
        match step {
            Step::Skipped { saga_type, outcome } => {
                match outcome {
                    DispatchOutcome::Duplicate => BusStats::incr(&self.stats.duplicates),
                    _ => BusStats::incr(&self.stats.ignored),
                }
                debug!(correlation_id = %correlation_id, ?outcome, "saga transition skipped");

                let outbound = plain_outbound.len();
                for message in plain_outbound {
                    outbox::deliver(self.transport.as_ref(), message).await?;
                }
                Ok(DispatchReport {
                    message_id: envelope.message_id(),
                    outcome,
                    saga_type,
                    correlation_id: Some(correlation_id),
                    attempts,
                    outbound,
                })
            }
            Step::Committed {
                saga_type,
                created,
                version,
                outcome,
                timer,
                outbox,
            } => {
                if created {
                    BusStats::incr(&self.stats.sagas_created);
                }
                if outcome == DispatchOutcome::SagaCompleted {
                    BusStats::incr(&self.stats.sagas_completed);
                }
                if envelope.kind() == MessageKind::Timeout {
                    BusStats::incr(&self.stats.timeouts_fired);
                }

                match timer {
                    TimerAction::Keep => {}
                    TimerAction::Arm(deadline) => {
                        self.timeouts
                            .arm(correlation_id.clone(), saga_type.as_str(), deadline, version);
                    }
                    TimerAction::Cancel => {
                        self.timeouts.cancel(&correlation_id, version);
                    }
                }

                let outbound = outbox.len();
                let delivered =
                    outbox::flush(self.store.as_ref(), self.transport.as_ref(), outbox).await;
                if delivered < outbound {
                    warn!(
                        correlation_id = %correlation_id,
                        pending = outbound - delivered,
                        "outbound messages left for the outbox relay"
                    );
                }

                debug!(correlation_id = %correlation_id, saga_type = %saga_type, ?outcome, attempts, "saga transition committed");
                Ok(DispatchReport {
                    message_id: envelope.message_id(),
                    outcome,
                    saga_type: Some(saga_type),
                    correlation_id: Some(correlation_id),
                    attempts,
                    outbound,
                })
            }
        }
    }
}
