use std::sync::Arc;

use sagabus_core::HandlerError;

use crate::{Invocation, Message, MessageEnvelope};

/// Type-erased plain message handler as stored by the registry.
///
/// Handlers are synchronous and must not perform blocking IO: everything they
/// want to happen on the bus goes through the [`Invocation`] buffer. This keeps
/// the Saga Store transaction and Transport delivery the only suspension points.
pub type MessageHandler =
    Arc<dyn Fn(&mut Invocation, &MessageEnvelope) -> Result<(), HandlerError> + Send + Sync>;

/// Erase a typed handler into a [`MessageHandler`].
///
/// The returned handler decodes the envelope payload into `M` before calling `f`;
/// a payload that does not decode is reported as [`HandlerError::Decode`].
pub fn typed_handler<M, F>(f: F) -> MessageHandler
where
    M: Message,
    F: Fn(&mut Invocation, M) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(move |invocation: &mut Invocation, envelope: &MessageEnvelope| {
        let message = envelope.decode::<M>()?;
        f(invocation, message)
    })
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {
        fn message_type() -> &'static str {
            "test.Ping"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pong {
        n: u32,
    }

    impl Message for Pong {
        fn message_type() -> &'static str {
            "test.Pong"
        }
    }

    #[test]
    fn typed_handler_decodes_and_emits() {
        let handler = typed_handler(|inv: &mut Invocation, ping: Ping| {
            inv.publish("test", "pong", &Pong { n: ping.n + 1 })
        });

        let env = MessageEnvelope::command("svc", &Ping { n: 1 }).unwrap();
        let mut inv = Invocation::for_inbound(&env, "svc");
        handler(&mut inv, &env).unwrap();

        let out = inv.into_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].decode::<Pong>().unwrap().n, 2);
    }

    #[test]
    fn typed_handler_reports_decode_errors() {
        let handler = typed_handler(|_inv: &mut Invocation, _ping: Ping| Ok(()));
        let env = MessageEnvelope::command("svc", &Pong { n: 1 }).unwrap();
        let mut inv = Invocation::for_inbound(&env, "svc");
        assert!(matches!(handler(&mut inv, &env), Err(HandlerError::Decode(_))));
    }
}
