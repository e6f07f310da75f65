//! `sagabus-messages`: the message model shared by handlers, sagas and transports.
//!
//! Mechanics only: envelopes, the per-message invocation context, handler and saga
//! contracts, and the Transport/ingress seam. No dispatch or persistence here.

pub mod envelope;
pub mod handler;
pub mod in_memory_transport;
pub mod ingress;
pub mod invocation;
pub mod message;
pub mod saga;
pub mod transport;

pub use envelope::{Destination, MessageEnvelope, MessageKind};
pub use handler::{MessageHandler, typed_handler};
pub use in_memory_transport::{InMemoryTransport, Sent};
pub use ingress::{FailureKind, Inbound, Ingress, ProcessingFailure, ProcessingOutcome};
pub use invocation::Invocation;
pub use message::Message;
pub use saga::{
    RouteKey, Saga, SagaAdapter, SagaDeclaration, SagaDefinition, TimerRequest, Transition, erase,
};
pub use transport::{Transport, TransportBinding, TransportError};
