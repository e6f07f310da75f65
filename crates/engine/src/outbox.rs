//! Outbox delivery and the background relay.
//!
//! Outbound messages of a saga step are committed to the store together with the
//! instance write. The dispatch engine hands them to the Transport right after
//! commit; anything it could not deliver (Transport down, crash between commit and
//! delivery) stays pending and is picked up here.
//!
//! The relay leaves entries younger than `min_age` (one relay interval) to the
//! engine's own flush. Delivery is still at-least-once: a flush slower than that
//! can race the relay, and a crash before marking redelivers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use sagabus_core::MessageId;
use sagabus_messages::{Destination, MessageEnvelope, Transport, TransportError};

use crate::saga_store::{SagaStore, SagaStoreError};
use crate::stats::BusStats;

/// Hand one envelope to the Transport according to its destination.
pub(crate) async fn deliver(
    transport: &dyn Transport,
    envelope: MessageEnvelope,
) -> Result<(), TransportError> {
    match envelope.destination().clone() {
        Destination::Service { name } => transport.deliver(&name, envelope).await,
        Destination::Topic { exchange, topic } => {
            transport.publish(&exchange, &topic, envelope).await
        }
        Destination::Saga { saga_type } => Err(TransportError::Rejected(format!(
            "envelope for saga '{saga_type}' is local to the bus"
        ))),
    }
}

/// Deliver freshly committed outbox entries and mark the delivered ones.
///
/// Returns how many were delivered; failures are left pending for the relay.
pub(crate) async fn flush(
    store: &dyn SagaStore,
    transport: &dyn Transport,
    envelopes: Vec<MessageEnvelope>,
) -> usize {
    let mut delivered: Vec<MessageId> = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let message_id = envelope.message_id();
        match deliver(transport, envelope).await {
            Ok(()) => delivered.push(message_id),
            Err(err) => warn!(message_id = %message_id, error = %err, "outbound delivery failed"),
        }
    }

    if !delivered.is_empty() {
        if let Err(err) = store.mark_dispatched(&delivered).await {
            // Entries get redelivered by the relay.
            warn!(error = %err, "failed to mark outbox entries dispatched");
        }
    }
    delivered.len()
}

/// One relay pass over at most `batch_size` pending entries committed at least
/// `min_age` ago.
#[instrument(skip(store, transport, stats), err)]
pub async fn relay_pending(
    store: &dyn SagaStore,
    transport: &dyn Transport,
    stats: &BusStats,
    batch_size: usize,
    min_age: Duration,
) -> Result<usize, SagaStoreError> {
    let cutoff = TimeDelta::from_std(min_age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    // Pending entries come oldest first.
    let pending: Vec<_> = store
        .pending_outbox(batch_size)
        .await?
        .into_iter()
        .take_while(|entry| entry.created_at <= cutoff)
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }

    let mut delivered = Vec::with_capacity(pending.len());
    for entry in pending {
        match deliver(transport, entry.envelope).await {
            Ok(()) => delivered.push(entry.message_id),
            Err(err) => {
                // Keep order per destination: stop at the first failure.
                debug!(message_id = %entry.message_id, error = %err, "relay delivery failed");
                break;
            }
        }
    }

    if !delivered.is_empty() {
        store.mark_dispatched(&delivered).await?;
        BusStats::add(&stats.outbox_relayed, delivered.len() as u64);
    }
    Ok(delivered.len())
}

/// Handle to stop and join the relay task.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Request shutdown and wait for the relay to stop.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Spawn the periodic relay.
pub fn spawn_relay(
    store: Arc<dyn SagaStore>,
    transport: Arc<dyn Transport>,
    stats: Arc<BusStats>,
    interval: Duration,
    batch_size: usize,
) -> RelayHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let batch_size = batch_size.max(1);

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    // Drain full batches back to back.
                    loop {
                        match relay_pending(store.as_ref(), transport.as_ref(), &stats, batch_size, interval).await {
                            Ok(n) if n == batch_size => continue,
                            Ok(_) => break,
                            Err(err) => {
                                warn!(error = %err, "outbox relay pass failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!("outbox relay stopped");
    });

    RelayHandle {
        shutdown: Some(shutdown_tx),
        join: Some(join),
    }
}
