//! Saga mechanics (framework only, no business rules).
//!
//! A saga is split into two capabilities:
//! - a **declaration** ([`SagaDeclaration`]): which message types start an instance,
//!   which ones an existing instance handles, and an optional saga-wide timeout
//! - a **transition function** ([`Saga::handle`]): state in, message in, new state
//!   plus buffered outbound messages out
//!
//! The engine treats saga logic as a stateless function over persisted state. It
//! loads the instance, runs the transition, and persists the result in one store
//! transaction. Sagas never hold state of their own.
//!
//! Design notes:
//! - An instance is identified by its correlation id, unique across the whole store
//! - [`Saga::correlate`] derives that id from a payload (e.g. an order number) when
//!   the envelope does not carry one
//! - [`SagaDefinition`] is the object-safe, JSON-state form the registry stores;
//!   every [`Saga`] gets one through [`SagaAdapter`]

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use sagabus_core::{CorrelationId, HandlerError, MessageType};

use crate::{Invocation, Message, MessageEnvelope, MessageKind};

/// Registry key of a message: by type for commands/replies, by exchange + topic +
/// type for events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Message(MessageType),
    Event {
        exchange: String,
        topic: String,
        message_type: MessageType,
    },
}

impl RouteKey {
    pub fn message<M: Message>() -> Self {
        Self::Message(M::type_id())
    }

    pub fn event<M: Message>(exchange: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::Event {
            exchange: exchange.into(),
            topic: topic.into(),
            message_type: M::type_id(),
        }
    }

    /// Key under which an inbound envelope is looked up.
    pub fn for_envelope(envelope: &MessageEnvelope) -> Self {
        match (envelope.kind(), envelope.topic()) {
            (MessageKind::Event, Some((exchange, topic))) => Self::Event {
                exchange: exchange.to_string(),
                topic: topic.to_string(),
                message_type: envelope.message_type().clone(),
            },
            _ => Self::Message(envelope.message_type().clone()),
        }
    }

    pub fn message_type(&self) -> &MessageType {
        match self {
            RouteKey::Message(t) => t,
            RouteKey::Event { message_type, .. } => message_type,
        }
    }
}

impl core::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RouteKey::Message(t) => write!(f, "{t}"),
            RouteKey::Event {
                exchange,
                topic,
                message_type,
            } => write!(f, "{exchange}/{topic}/{message_type}"),
        }
    }
}

/// What a saga declares about itself at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaDeclaration {
    saga_type: String,
    starters: Vec<RouteKey>,
    handled: Vec<RouteKey>,
    timeout: Option<Duration>,
}

impl SagaDeclaration {
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            starters: Vec::new(),
            handled: Vec::new(),
            timeout: None,
        }
    }

    /// `M` starts a new instance when no instance matches its correlation id.
    pub fn started_by<M: Message>(self) -> Self {
        self.starter(RouteKey::message::<M>())
    }

    /// Event `M` on `exchange`/`topic` starts a new instance.
    pub fn started_by_event<M: Message>(self, exchange: impl Into<String>, topic: impl Into<String>) -> Self {
        self.starter(RouteKey::event::<M>(exchange, topic))
    }

    /// An existing instance handles `M`.
    pub fn handles<M: Message>(self) -> Self {
        self.handled_key(RouteKey::message::<M>())
    }

    /// An existing instance handles event `M` on `exchange`/`topic`.
    pub fn handles_event<M: Message>(self, exchange: impl Into<String>, topic: impl Into<String>) -> Self {
        self.handled_key(RouteKey::event::<M>(exchange, topic))
    }

    /// Arm a timeout of `duration` whenever a new instance is created.
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    fn starter(mut self, key: RouteKey) -> Self {
        if !self.starters.contains(&key) {
            self.starters.push(key.clone());
        }
        self.handled_key(key)
    }

    fn handled_key(mut self, key: RouteKey) -> Self {
        if !self.handled.contains(&key) {
            self.handled.push(key);
        }
        self
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn starters(&self) -> &[RouteKey] {
        &self.starters
    }

    /// Every key an instance reacts to (starters included).
    pub fn handled(&self) -> &[RouteKey] {
        &self.handled
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_starter(&self, key: &RouteKey) -> bool {
        self.starters.contains(key)
    }

    pub fn handles_key(&self, key: &RouteKey) -> bool {
        self.handled.contains(key)
    }
}

/// What should happen to the instance's timeout after a transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerRequest {
    /// Leave any armed deadline as it is.
    Keep,
    /// Arm (or re-arm, replacing the previous deadline) a timeout.
    Arm(Duration),
    /// Disarm the pending timeout.
    Cancel,
}

/// Outcome of a saga transition: the new state plus lifecycle intent.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S> {
    state: S,
    complete: bool,
    timer: TimerRequest,
}

impl<S> Transition<S> {
    /// Stay active with `state`.
    pub fn next(state: S) -> Self {
        Self {
            state,
            complete: false,
            timer: TimerRequest::Keep,
        }
    }

    /// Finish the saga with final `state`. Any pending timeout is disarmed.
    pub fn complete(state: S) -> Self {
        Self {
            state,
            complete: true,
            timer: TimerRequest::Cancel,
        }
    }

    pub fn arm_timeout(mut self, duration: Duration) -> Self {
        self.timer = TimerRequest::Arm(duration);
        self
    }

    pub fn cancel_timeout(mut self) -> Self {
        self.timer = TimerRequest::Cancel;
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn timer(&self) -> TimerRequest {
        if self.complete {
            TimerRequest::Cancel
        } else {
            self.timer
        }
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn try_map_state<T, E>(self, f: impl FnOnce(S) -> Result<T, E>) -> Result<Transition<T>, E> {
        Ok(Transition {
            state: f(self.state)?,
            complete: self.complete,
            timer: self.timer,
        })
    }
}

/// Saga contract (typed).
///
/// Implementors define:
/// - a typed state (must be serde for persistence)
/// - the declaration (starter and handled message types, optional timeout)
/// - how to correlate payloads to instances when the envelope has no correlation id
/// - how to react to a message, and to the instance's own timeout
pub trait Saga: Send + Sync + 'static {
    type State: Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn declare(&self) -> SagaDeclaration;

    /// Derive the correlation id from a payload (return `None` if not derivable).
    fn correlate(&self, _envelope: &MessageEnvelope) -> Option<CorrelationId> {
        None
    }

    /// React to a starter or handled message.
    ///
    /// For a starter message creating a new instance, `state` is `State::default()`.
    fn handle(
        &self,
        state: Self::State,
        envelope: &MessageEnvelope,
        invocation: &mut Invocation,
    ) -> Result<Transition<Self::State>, HandlerError>;

    /// React to the instance's timeout. The default keeps the state unchanged.
    fn timeout(
        &self,
        state: Self::State,
        _invocation: &mut Invocation,
    ) -> Result<Transition<Self::State>, HandlerError> {
        Ok(Transition::next(state))
    }
}

/// Object-safe saga definition over JSON state, as stored by the registry.
pub trait SagaDefinition: Send + Sync {
    fn declaration(&self) -> &SagaDeclaration;

    fn saga_type(&self) -> &str {
        self.declaration().saga_type()
    }

    fn correlate(&self, envelope: &MessageEnvelope) -> Option<CorrelationId>;

    fn initial_state(&self) -> Result<JsonValue, HandlerError>;

    fn handle(
        &self,
        state: JsonValue,
        envelope: &MessageEnvelope,
        invocation: &mut Invocation,
    ) -> Result<Transition<JsonValue>, HandlerError>;

    fn timeout(
        &self,
        state: JsonValue,
        invocation: &mut Invocation,
    ) -> Result<Transition<JsonValue>, HandlerError>;
}

/// Adapts a typed [`Saga`] to [`SagaDefinition`].
pub struct SagaAdapter<S: Saga> {
    saga: S,
    declaration: SagaDeclaration,
}

impl<S: Saga> SagaAdapter<S> {
    pub fn new(saga: S) -> Self {
        let declaration = saga.declare();
        Self { saga, declaration }
    }

    fn decode_state(&self, state: JsonValue) -> Result<S::State, HandlerError> {
        serde_json::from_value(state).map_err(|e| {
            HandlerError::decode(format!("state of saga '{}': {e}", self.declaration.saga_type()))
        })
    }

    fn encode_state(&self, state: S::State) -> Result<JsonValue, HandlerError> {
        serde_json::to_value(state).map_err(|e| {
            HandlerError::encode(format!("state of saga '{}': {e}", self.declaration.saga_type()))
        })
    }
}

impl<S: Saga> SagaDefinition for SagaAdapter<S> {
    fn declaration(&self) -> &SagaDeclaration {
        &self.declaration
    }

    fn correlate(&self, envelope: &MessageEnvelope) -> Option<CorrelationId> {
        self.saga.correlate(envelope)
    }

    fn initial_state(&self) -> Result<JsonValue, HandlerError> {
        self.encode_state(S::State::default())
    }

    fn handle(
        &self,
        state: JsonValue,
        envelope: &MessageEnvelope,
        invocation: &mut Invocation,
    ) -> Result<Transition<JsonValue>, HandlerError> {
        let state = self.decode_state(state)?;
        self.saga
            .handle(state, envelope, invocation)?
            .try_map_state(|s| self.encode_state(s))
    }

    fn timeout(
        &self,
        state: JsonValue,
        invocation: &mut Invocation,
    ) -> Result<Transition<JsonValue>, HandlerError> {
        let state = self.decode_state(state)?;
        self.saga
            .timeout(state, invocation)?
            .try_map_state(|s| self.encode_state(s))
    }
}

/// Erase a typed saga for registration.
pub fn erase<S: Saga>(saga: S) -> Arc<dyn SagaDefinition> {
    Arc::new(SagaAdapter::new(saga))
}
