use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use sagabus_core::{CorrelationId, HandlerError, MessageId, MessageType};

use crate::Message;

/// What role a message plays in a conversation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Point-to-point request addressed to one service.
    Command,
    /// One-to-many notification published to an exchange/topic.
    Event,
    /// Answer to a command, addressed to the sender's service.
    Reply,
    /// Synthetic trigger produced by the timeout scheduler.
    Timeout,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::Reply => "reply",
            MessageKind::Timeout => "timeout",
        }
    }
}

/// Where a message is headed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// A named service (commands and replies).
    Service { name: String },
    /// An exchange + topic pair (events).
    Topic { exchange: String, topic: String },
    /// A saga definition on the local bus (timeout triggers only).
    Saga { saga_type: String },
}

impl Destination {
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service { name: name.into() }
    }

    pub fn topic(exchange: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::Topic {
            exchange: exchange.into(),
            topic: topic.into(),
        }
    }

    pub fn saga(saga_type: impl Into<String>) -> Self {
        Self::Saga {
            saga_type: saga_type.into(),
        }
    }
}

/// Envelope for one unit of work in flight.
///
/// This is the unit the Transport hands to the engine and the engine hands back
/// to the Transport.
///
/// Notes:
/// - **Immutable**: fields are private; the `with_*` builders consume `self` and are
///   only used while the envelope is being assembled.
/// - `payload` is already deserialised by the Transport; it is decoded into a typed
///   message with [`MessageEnvelope::decode`].
/// - `correlation_id` is present when the message is bound to a saga instance.
/// - `causation_id` is the id of the message whose handling produced this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    message_id: MessageId,
    message_type: MessageType,
    kind: MessageKind,

    correlation_id: Option<CorrelationId>,
    causation_id: Option<MessageId>,
    reply_to: Option<String>,

    destination: Destination,
    occurred_at: DateTime<Utc>,

    payload: JsonValue,
}

impl MessageEnvelope {
    /// Low-level constructor for transports that rebuild envelopes from the wire.
    pub fn new(
        message_id: MessageId,
        message_type: impl Into<MessageType>,
        kind: MessageKind,
        destination: Destination,
        payload: JsonValue,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            kind,
            correlation_id: None,
            causation_id: None,
            reply_to: None,
            destination,
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Wrap a typed message addressed to `service`.
    pub fn command<M: Message>(service: impl Into<String>, message: &M) -> Result<Self, HandlerError> {
        Self::typed(MessageKind::Command, Destination::service(service), message)
    }

    /// Wrap a typed message published to `exchange`/`topic`.
    pub fn event<M: Message>(
        exchange: impl Into<String>,
        topic: impl Into<String>,
        message: &M,
    ) -> Result<Self, HandlerError> {
        Self::typed(MessageKind::Event, Destination::topic(exchange, topic), message)
    }

    /// Wrap a typed message answering a command from `service`.
    pub fn reply<M: Message>(service: impl Into<String>, message: &M) -> Result<Self, HandlerError> {
        Self::typed(MessageKind::Reply, Destination::service(service), message)
    }

    fn typed<M: Message>(
        kind: MessageKind,
        destination: Destination,
        message: &M,
    ) -> Result<Self, HandlerError> {
        let payload = serde_json::to_value(message).map_err(|e| {
            HandlerError::encode(format!("{}: {e}", M::message_type()))
        })?;
        Ok(Self::new(MessageId::new(), M::type_id(), kind, destination, payload))
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<CorrelationId>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<MessageId>) -> Self {
        self.causation_id = causation_id;
        self
    }

    pub fn with_reply_to(mut self, service: Option<String>) -> Self {
        self.reply_to = service;
        self
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn causation_id(&self) -> Option<MessageId> {
        self.causation_id
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Exchange and topic, for published events.
    pub fn topic(&self) -> Option<(&str, &str)> {
        match &self.destination {
            Destination::Topic { exchange, topic } => Some((exchange.as_str(), topic.as_str())),
            _ => None,
        }
    }

    /// Whether this envelope carries a message of type `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.message_type == M::message_type()
    }

    /// Decode the payload into a typed message.
    ///
    /// Fails when the envelope carries a different message type or when the payload
    /// does not match the type's schema.
    pub fn decode<M: Message>(&self) -> Result<M, HandlerError> {
        if !self.is::<M>() {
            return Err(HandlerError::decode(format!(
                "expected '{}', envelope carries '{}'",
                M::message_type(),
                self.message_type
            )));
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| HandlerError::decode(format!("{}: {e}", M::message_type())))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
    }

    impl Message for OrderPlaced {
        fn message_type() -> &'static str {
            "orders.OrderPlaced"
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PaymentReceived {
        order_id: u64,
    }

    impl Message for PaymentReceived {
        fn message_type() -> &'static str {
            "orders.PaymentReceived"
        }
    }

    #[test]
    fn command_envelope_carries_type_and_destination() {
        let env = MessageEnvelope::command("billing", &OrderPlaced { order_id: 1 }).unwrap();

        assert_eq!(env.kind(), MessageKind::Command);
        assert_eq!(env.message_type(), &MessageType::from("orders.OrderPlaced"));
        assert_eq!(env.destination(), &Destination::service("billing"));
        assert!(env.correlation_id().is_none());
        assert_eq!(env.decode::<OrderPlaced>().unwrap(), OrderPlaced { order_id: 1 });
    }

    #[test]
    fn decode_rejects_foreign_type() {
        let env = MessageEnvelope::command("billing", &OrderPlaced { order_id: 1 }).unwrap();
        let err = env.decode::<PaymentReceived>().unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let env = MessageEnvelope::new(
            MessageId::new(),
            "orders.OrderPlaced",
            MessageKind::Command,
            Destination::service("billing"),
            serde_json::json!({ "order_id": "not a number" }),
        );
        assert!(matches!(env.decode::<OrderPlaced>(), Err(HandlerError::Decode(_))));
    }

    #[test]
    fn event_envelope_exposes_topic() {
        let env = MessageEnvelope::event("orders", "placed", &OrderPlaced { order_id: 3 }).unwrap();
        assert_eq!(env.topic(), Some(("orders", "placed")));
        assert_eq!(env.kind(), MessageKind::Event);
    }
}
