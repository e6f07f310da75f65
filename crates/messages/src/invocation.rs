//! Per-message handler context.

use sagabus_core::{CorrelationId, HandlerError, MessageId};

use crate::{Message, MessageEnvelope};

/// Context handed to a handler alongside the inbound message.
///
/// Handlers never talk to the Transport directly. Everything they emit is
/// buffered here and handed to the Transport by the engine once processing of
/// the inbound message has committed, so observers never react to side effects
/// that are later rolled back.
///
/// Outbound envelopes inherit:
/// - the invocation's correlation id (the saga instance id for saga handlers,
///   the inbound correlation id for plain handlers)
/// - the inbound message id as causation id
/// - the local service name as reply address
#[derive(Debug)]
pub struct Invocation {
    inbound_id: MessageId,
    inbound_reply_to: Option<String>,
    correlation_id: Option<CorrelationId>,
    local_service: String,
    outbox: Vec<MessageEnvelope>,
}

impl Invocation {
    /// Create the context for handling `inbound` on `local_service`.
    pub fn for_inbound(inbound: &MessageEnvelope, local_service: impl Into<String>) -> Self {
        Self {
            inbound_id: inbound.message_id(),
            inbound_reply_to: inbound.reply_to().map(str::to_string),
            correlation_id: inbound.correlation_id().cloned(),
            local_service: local_service.into(),
            outbox: Vec::new(),
        }
    }

    /// Bind this invocation to a saga instance (overrides the inbound correlation id).
    pub fn bind_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Send a command to `service`.
    pub fn send<M: Message>(&mut self, service: impl Into<String>, message: &M) -> Result<(), HandlerError> {
        let env = MessageEnvelope::command(service, message)?;
        self.push(env);
        Ok(())
    }

    /// Publish an event to `exchange`/`topic`.
    pub fn publish<M: Message>(
        &mut self,
        exchange: impl Into<String>,
        topic: impl Into<String>,
        message: &M,
    ) -> Result<(), HandlerError> {
        let env = MessageEnvelope::event(exchange, topic, message)?;
        self.push(env);
        Ok(())
    }

    /// Reply to the service that sent the inbound message.
    pub fn reply<M: Message>(&mut self, message: &M) -> Result<(), HandlerError> {
        let target = self
            .inbound_reply_to
            .clone()
            .ok_or(HandlerError::NoReplyAddress)?;
        let env = MessageEnvelope::reply(target, message)?;
        self.push(env);
        Ok(())
    }

    fn push(&mut self, envelope: MessageEnvelope) {
        let envelope = envelope
            .with_correlation_id(self.correlation_id.clone())
            .with_causation_id(Some(self.inbound_id))
            .with_reply_to(Some(self.local_service.clone()));
        self.outbox.push(envelope);
    }

    /// Messages buffered so far.
    pub fn pending(&self) -> &[MessageEnvelope] {
        &self.outbox
    }

    /// Take ownership of the buffered messages.
    pub fn into_outbox(self) -> Vec<MessageEnvelope> {
        self.outbox
    }
}
