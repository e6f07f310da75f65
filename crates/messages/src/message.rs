use serde::Serialize;
use serde::de::DeserializeOwned;

use sagabus_core::MessageType;

/// A typed message that can travel on the bus.
///
/// Messages are:
/// - **immutable** once created (treat them as values)
/// - **serde-serialisable** (the Transport owns the wire format)
/// - identified by a **stable type name**, used as the registry key
///
/// The type name must not change between releases: it is how a running
/// service recognises messages produced by older or newer peers.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable message type identifier (e.g. "orders.OrderPlaced").
    fn message_type() -> &'static str;

    fn type_id() -> MessageType {
        MessageType::from(Self::message_type())
    }
}
