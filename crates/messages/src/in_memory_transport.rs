//! In-memory transport for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    Destination, FailureKind, Ingress, MessageEnvelope, ProcessingFailure, Transport,
    TransportBinding, TransportError,
};

/// One recorded outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub destination: Destination,
    pub envelope: MessageEnvelope,
}

#[derive(Debug, Default)]
struct State {
    binding: Option<TransportBinding>,
    ingress: Option<Ingress>,
    sent: Vec<Sent>,
    fail_next: usize,
    stopped: bool,
}

/// In-memory transport.
///
/// - Records every delivered/published envelope
/// - Loops envelopes addressed to the bound service (or a subscribed topic) back
///   into the bus, recording any processing failure
/// - Can be told to fail the next N outbound calls
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    state: Mutex<State>,
    failures: Arc<Mutex<Vec<ProcessingFailure>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` outbound calls with [`TransportError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = count;
        }
    }

    /// Everything sent or published so far, in order.
    pub fn sent(&self) -> Vec<Sent> {
        self.state.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    /// Envelopes of a given message type, in send order.
    pub fn sent_of_type(&self, message_type: &str) -> Vec<MessageEnvelope> {
        self.sent()
            .into_iter()
            .filter(|s| s.envelope.message_type() == message_type)
            .map(|s| s.envelope)
            .collect()
    }

    /// Counts of recorded envelopes per message type.
    pub fn counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for s in self.sent() {
            *counts.entry(s.envelope.message_type().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Processing failures reported for looped-back envelopes.
    pub fn failures(&self) -> Vec<ProcessingFailure> {
        self.failures.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.sent.clear();
        }
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    fn record(
        &self,
        destination: Destination,
        envelope: &MessageEnvelope,
    ) -> Result<Option<Ingress>, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("transport state poisoned".to_string()))?;

        if state.stopped {
            return Err(TransportError::Closed);
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Unavailable("injected failure".to_string()));
        }

        let loops_back = match (&destination, &state.binding) {
            (Destination::Service { name }, Some(binding)) => *name == binding.service,
            (Destination::Topic { exchange, topic }, Some(binding)) => binding
                .topics
                .iter()
                .any(|(e, t)| e == exchange && t == topic),
            _ => false,
        };

        state.sent.push(Sent {
            destination,
            envelope: envelope.clone(),
        });

        Ok(if loops_back { state.ingress.clone() } else { None })
    }

    fn loop_back(&self, ingress: Ingress, envelope: MessageEnvelope) {
        let failures = Arc::clone(&self.failures);
        tokio::spawn(async move {
            if let Err(failure) = ingress.submit(envelope).await {
                if failure.kind != FailureKind::ShuttingDown {
                    tracing::warn!(
                        message_id = %failure.message_id,
                        kind = failure.kind.as_str(),
                        reason = %failure.reason,
                        "looped-back message failed"
                    );
                }
                if let Ok(mut failures) = failures.lock() {
                    failures.push(failure);
                }
            }
        });
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn deliver(&self, service: &str, envelope: MessageEnvelope) -> Result<(), TransportError> {
        if let Some(ingress) = self.record(Destination::service(service), &envelope)? {
            self.loop_back(ingress, envelope);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        topic: &str,
        envelope: MessageEnvelope,
    ) -> Result<(), TransportError> {
        if let Some(ingress) = self.record(Destination::topic(exchange, topic), &envelope)? {
            self.loop_back(ingress, envelope);
        }
        Ok(())
    }

    async fn start(&self, binding: TransportBinding, ingress: Ingress) -> Result<(), TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("transport state poisoned".to_string()))?;
        state.binding = Some(binding);
        state.ingress = Some(ingress);
        state.stopped = false;
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("transport state poisoned".to_string()))?;
        state.binding = None;
        state.ingress = None;
        state.stopped = true;
        Ok(())
    }
}
