//! Bus Façade: the application-facing entry point.
//!
//! A [`ServiceBus`] moves through three phases:
//!
//! ```text
//! Configuring ──start()──▶ Running ──shutdown()──▶ Stopped
//! ```
//!
//! Handlers and sagas are registered while configuring. `start` freezes the
//! registry, re-arms persisted timeouts, spawns the ingestion workers and the
//! outbox relay, then binds the Transport. After that, envelopes arrive through
//! the [`Ingress`] and the application sends and publishes through the façade.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{info, warn};

use sagabus_core::{HandlerError, MessageId};
use sagabus_messages::{
    FailureKind, Ingress, Invocation, Message, MessageEnvelope, ProcessingFailure,
    ProcessingOutcome, Saga, SagaDefinition, Transport, TransportBinding, TransportError, erase,
    typed_handler,
};

use crate::config::{BusConfig, StoreBackend};
use crate::dispatch::{DispatchError, DispatchReport, DispatchSettings, Dispatcher};
use crate::outbox::{self, RelayHandle};
use crate::registry::{HandlerRegistry, RegistryError};
use crate::saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore, SagaStoreError};
use crate::stats::{BusStats, BusStatsSnapshot};
use crate::timeouts::TimeoutScheduler;
use crate::worker::WorkerPool;

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] SagaStoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bus is not running")]
    NotStarted,

    #[error("failed to encode message: {0}")]
    Encode(#[from] HandlerError),
}

enum BusState {
    Configuring(HandlerRegistry),
    Starting,
    Running(Running),
    Stopped,
}

struct Running {
    dispatcher: Arc<Dispatcher>,
    ingress: Ingress,
    workers: WorkerPool,
    relay: RelayHandle,
}

pub struct ServiceBus {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SagaStore>,
    timeouts: TimeoutScheduler,
    stats: Arc<BusStats>,
    state: Mutex<BusState>,
}

impl ServiceBus {
    pub fn new(config: BusConfig, transport: Arc<dyn Transport>, store: Arc<dyn SagaStore>) -> Self {
        Self {
            config,
            transport,
            store,
            timeouts: TimeoutScheduler::new(),
            stats: Arc::new(BusStats::new()),
            state: Mutex::new(BusState::Configuring(HandlerRegistry::new())),
        }
    }

    /// Bus backed by a fresh [`InMemorySagaStore`].
    pub fn in_memory(config: BusConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(config, transport, Arc::new(InMemorySagaStore::new()))
    }

    /// Bus backed by the store named in `config.store`.
    pub async fn connect(config: BusConfig, transport: Arc<dyn Transport>) -> Result<Self, BusError> {
        let store: Arc<dyn SagaStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(InMemorySagaStore::new()),
            StoreBackend::Postgres => {
                let url = config.store.database_url.as_deref().ok_or_else(|| {
                    BusError::Config("store.database_url is required for the postgres backend".to_string())
                })?;
                let store = PostgresSagaStore::connect(url, config.store.max_connections).await?;
                store.ensure_schema().await?;
                Arc::new(store)
            }
        };
        Ok(Self::new(config, transport, store))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    pub fn timeouts(&self) -> &TimeoutScheduler {
        &self.timeouts
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), BusState::Running(_))
    }

    /// Handle commands and replies of type `M` addressed to this service.
    pub fn handle_message<M, F>(&self, handler: F) -> Result<(), BusError>
    where
        M: Message,
        F: Fn(&mut Invocation, M) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.configure(|registry| registry.handle_message::<M>(typed_handler(handler)))
    }

    /// Handle events of type `M` published to `exchange`/`topic`.
    pub fn handle_event<M, F>(
        &self,
        exchange: impl Into<String>,
        topic: impl Into<String>,
        handler: F,
    ) -> Result<(), BusError>
    where
        M: Message,
        F: Fn(&mut Invocation, M) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.configure(|registry| registry.handle_event::<M>(exchange, topic, typed_handler(handler)))
    }

    pub fn register_saga<S: Saga>(&self, saga: S) -> Result<(), BusError> {
        self.register_definition(erase(saga))
    }

    pub fn register_definition(&self, definition: Arc<dyn SagaDefinition>) -> Result<(), BusError> {
        self.configure(|registry| registry.register_saga(definition))
    }

    fn configure(
        &self,
        f: impl FnOnce(&mut HandlerRegistry) -> Result<(), RegistryError>,
    ) -> Result<(), BusError> {
        match &mut *self.lock() {
            BusState::Configuring(registry) => Ok(f(registry)?),
            _ => Err(RegistryError::BusAlreadyStarted.into()),
        }
    }

    /// Freeze registration and begin processing.
    pub async fn start(&self) -> Result<(), BusError> {
        let registry = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, BusState::Starting) {
                BusState::Configuring(registry) => registry,
                other => {
                    *state = other;
                    return Err(RegistryError::BusAlreadyStarted.into());
                }
            }
        };

        let armed = match self.store.armed_timeouts().await {
            Ok(armed) => armed,
            Err(err) => {
                *self.lock() = BusState::Configuring(registry);
                return Err(err.into());
            }
        };

        let routes = Arc::new(registry.freeze());
        let (ingress, receiver) = Ingress::channel(self.config.ingress_capacity);

        self.timeouts.attach(ingress.clone());
        let restored = armed.len();
        for timeout in armed {
            self.timeouts.arm(
                timeout.correlation_id,
                timeout.saga_type,
                timeout.deadline,
                timeout.version,
            );
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&routes),
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.timeouts.clone(),
            Arc::clone(&self.stats),
            DispatchSettings::from(&self.config),
        ));
        let workers = WorkerPool::spawn(
            Arc::clone(&dispatcher),
            Arc::clone(&self.stats),
            receiver,
            self.config.workers,
        );

        let binding = TransportBinding {
            service: self.config.service_name.clone(),
            topics: routes.topics().to_vec(),
        };
        if let Err(err) = self.transport.start(binding, ingress.clone()).await {
            workers.shutdown(self.config.shutdown_grace()).await;
            self.timeouts.shutdown();
            *self.lock() = BusState::Stopped;
            return Err(err.into());
        }

        // First tick runs immediately: leftovers from a previous run go out now.
        let relay = outbox::spawn_relay(
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            Arc::clone(&self.stats),
            self.config.relay_interval(),
            self.config.outbox.batch_size,
        );

        *self.lock() = BusState::Running(Running {
            dispatcher,
            ingress,
            workers,
            relay,
        });

        info!(
            service = %self.config.service_name,
            sagas = routes.saga_count(),
            topics = routes.topics().len(),
            restored_timeouts = restored,
            "service bus started"
        );
        Ok(())
    }

    /// Stop processing. Idempotent.
    ///
    /// Closes the ingress, waits up to the configured grace period for in-flight
    /// envelopes, stops the relay, disarms timeouts and finally stops the Transport.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        let running = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, BusState::Stopped) {
                BusState::Running(running) => running,
                BusState::Starting => {
                    *state = BusState::Starting;
                    return Ok(());
                }
                BusState::Configuring(_) | BusState::Stopped => return Ok(()),
            }
        };

        running.workers.shutdown(self.config.shutdown_grace()).await;
        running.relay.shutdown().await;
        self.timeouts.shutdown();
        let stopped = self.transport.stop().await;

        info!(stats = ?self.stats.snapshot(), "service bus stopped");
        stopped.map_err(BusError::from)
    }

    /// Send a command to `service`. Replies come back to this service.
    pub async fn send<M: Message>(&self, service: &str, message: &M) -> Result<MessageId, BusError> {
        self.ensure_running()?;
        let envelope = MessageEnvelope::command(service, message)?
            .with_reply_to(Some(self.config.service_name.clone()));
        let message_id = envelope.message_id();
        outbox::deliver(self.transport.as_ref(), envelope).await?;
        Ok(message_id)
    }

    /// Publish an event to `exchange`/`topic`.
    pub async fn publish<M: Message>(
        &self,
        exchange: &str,
        topic: &str,
        message: &M,
    ) -> Result<MessageId, BusError> {
        self.ensure_running()?;
        let envelope = MessageEnvelope::event(exchange, topic, message)?;
        let message_id = envelope.message_id();
        outbox::deliver(self.transport.as_ref(), envelope).await?;
        Ok(message_id)
    }

    /// Submit an envelope through the ingress and wait for its outcome.
    pub async fn ingest(&self, envelope: MessageEnvelope) -> ProcessingOutcome {
        match self.ingress() {
            Some(ingress) => ingress.submit(envelope).await,
            None => Err(ProcessingFailure::new(
                envelope.message_id(),
                FailureKind::ShuttingDown,
                "bus is not running",
            )),
        }
    }

    /// Process an envelope on the caller's task, bypassing the worker pool.
    pub async fn dispatch(&self, envelope: &MessageEnvelope) -> Result<DispatchReport, DispatchError> {
        let dispatcher = match &*self.lock() {
            BusState::Running(running) => Arc::clone(&running.dispatcher),
            _ => return Err(DispatchError::ShuttingDown),
        };

        BusStats::incr(&self.stats.received);
        let result = dispatcher.dispatch(envelope).await;
        match &result {
            Ok(_) => BusStats::incr(&self.stats.succeeded),
            Err(err) => {
                BusStats::incr(&self.stats.failed);
                warn!(message_id = %envelope.message_id(), error = %err, "envelope processing failed");
            }
        }
        result
    }

    /// Ingress handle while running.
    pub fn ingress(&self) -> Option<Ingress> {
        match &*self.lock() {
            BusState::Running(running) => Some(running.ingress.clone()),
            _ => None,
        }
    }

    fn ensure_running(&self) -> Result<(), BusError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BusError::NotStarted)
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
