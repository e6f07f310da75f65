//! Handler Registry: message keys → plain handlers and saga definitions.
//!
//! Registration happens once, before the bus starts. [`HandlerRegistry::freeze`]
//! turns it into an immutable [`RoutingTable`] the dispatch engine resolves against;
//! nothing can be added after that point.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use sagabus_messages::{Message, MessageHandler, RouteKey, SagaDefinition};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A handler (or saga type) is already registered under this key.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// A starter key is already owned by another saga definition.
    #[error("starter type {key} already owned by saga '{owner}'")]
    DuplicateStarterType { key: String, owner: String },

    #[error("bus already started; registration is closed")]
    BusAlreadyStarted,
}

/// Mutable registration phase.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<RouteKey, MessageHandler>,
    sagas: Vec<Arc<dyn SagaDefinition>>,
    starters: HashMap<RouteKey, String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for commands/replies of type `M`.
    pub fn handle_message<M: Message>(&mut self, handler: MessageHandler) -> Result<(), RegistryError> {
        self.register_handler(RouteKey::message::<M>(), handler)
    }

    /// Register the handler for events of type `M` published to `exchange`/`topic`.
    pub fn handle_event<M: Message>(
        &mut self,
        exchange: impl Into<String>,
        topic: impl Into<String>,
        handler: MessageHandler,
    ) -> Result<(), RegistryError> {
        self.register_handler(RouteKey::event::<M>(exchange, topic), handler)
    }

    pub fn register_handler(&mut self, key: RouteKey, handler: MessageHandler) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&key) {
            return Err(RegistryError::DuplicateRegistration(key.to_string()));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Register a saga definition.
    ///
    /// Fails without registering anything when the saga type is taken or one of its
    /// starter keys is owned by another definition.
    pub fn register_saga(&mut self, definition: Arc<dyn SagaDefinition>) -> Result<(), RegistryError> {
        let declaration = definition.declaration();
        let saga_type = declaration.saga_type();

        if self.sagas.iter().any(|s| s.saga_type() == saga_type) {
            return Err(RegistryError::DuplicateRegistration(format!("saga '{saga_type}'")));
        }

        for key in declaration.starters() {
            if let Some(owner) = self.starters.get(key) {
                return Err(RegistryError::DuplicateStarterType {
                    key: key.to_string(),
                    owner: owner.clone(),
                });
            }
        }

        for key in declaration.starters() {
            self.starters.insert(key.clone(), saga_type.to_string());
        }
        self.sagas.push(definition);
        Ok(())
    }

    /// Close registration.
    pub fn freeze(self) -> RoutingTable {
        let mut routes: HashMap<RouteKey, Route> = HashMap::new();

        for (key, handler) in self.handlers {
            routes.entry(key).or_default().handler = Some(handler);
        }

        // Registration order is kept: it decides which saga correlates first.
        for saga in &self.sagas {
            for key in saga.declaration().handled() {
                routes.entry(key.clone()).or_default().sagas.push(Arc::clone(saga));
            }
        }

        let mut topics: Vec<(String, String)> = Vec::new();
        for key in routes.keys() {
            if let RouteKey::Event { exchange, topic, .. } = key {
                let pair = (exchange.clone(), topic.clone());
                if !topics.contains(&pair) {
                    topics.push(pair);
                }
            }
        }
        topics.sort();

        let sagas = self
            .sagas
            .into_iter()
            .map(|s| (s.saga_type().to_string(), s))
            .collect();

        RoutingTable {
            routes,
            sagas,
            topics,
        }
    }
}

/// Everything registered for one key.
#[derive(Default, Clone)]
pub struct Route {
    pub handler: Option<MessageHandler>,
    /// Sagas that start on or handle this key, in registration order.
    pub sagas: Vec<Arc<dyn SagaDefinition>>,
}

impl Route {
    pub fn starter(&self, key: &RouteKey) -> Option<&Arc<dyn SagaDefinition>> {
        self.sagas.iter().find(|s| s.declaration().is_starter(key))
    }
}

/// Frozen registry, read-only after start.
#[derive(Default, Clone)]
pub struct RoutingTable {
    routes: HashMap<RouteKey, Route>,
    sagas: HashMap<String, Arc<dyn SagaDefinition>>,
    topics: Vec<(String, String)>,
}

impl RoutingTable {
    pub fn resolve(&self, key: &RouteKey) -> Option<&Route> {
        self.routes.get(key)
    }

    pub fn saga(&self, saga_type: &str) -> Option<&Arc<dyn SagaDefinition>> {
        self.sagas.get(saga_type)
    }

    /// `(exchange, topic)` pairs the bus must subscribe to.
    pub fn topics(&self) -> &[(String, String)] {
        &self.topics
    }

    pub fn saga_count(&self) -> usize {
        self.sagas.len()
    }
}
