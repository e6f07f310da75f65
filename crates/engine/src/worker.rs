//! Ingestion worker pool.
//!
//! Drains the ingress channel and runs each envelope through the
//! [`Dispatcher`] on its own task, with at most `workers` in flight. Envelopes
//! for different correlation ids never wait on each other; same-id races are
//! settled by the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sagabus_messages::{FailureKind, Inbound, ProcessingFailure};

use crate::dispatch::Dispatcher;
use crate::stats::BusStats;

/// Handle to stop and join the pool.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        dispatcher: Arc<Dispatcher>,
        stats: Arc<BusStats>,
        receiver: mpsc::Receiver<Inbound>,
        workers: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(pool_loop(
            dispatcher,
            stats,
            receiver,
            shutdown_rx,
            workers.max(1),
        ));

        Self {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    /// Stop accepting envelopes and wait up to `grace` for in-flight ones.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if tokio::time::timeout(grace, join).await.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "in-flight envelopes still running after grace period");
            }
        }
    }
}

async fn pool_loop(
    dispatcher: Arc<Dispatcher>,
    stats: Arc<BusStats>,
    mut receiver: mpsc::Receiver<Inbound>,
    mut shutdown: oneshot::Receiver<()>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));

    loop {
        let inbound = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            inbound = receiver.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            let failure = shutting_down(&inbound);
            inbound.complete(Err(failure));
            break;
        };
        let dispatcher = Arc::clone(&dispatcher);
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            process(&dispatcher, &stats, inbound).await;
            drop(permit);
        });
    }

    // Refuse what is still queued; senders see `ShuttingDown`.
    receiver.close();
    while let Some(inbound) = receiver.recv().await {
        let failure = shutting_down(&inbound);
        inbound.complete(Err(failure));
    }

    // All permits back means nothing is in flight.
    let _ = permits.acquire_many(workers as u32).await;
    debug!("ingestion workers drained");
}

fn shutting_down(inbound: &Inbound) -> ProcessingFailure {
    ProcessingFailure::new(
        inbound.envelope.message_id(),
        FailureKind::ShuttingDown,
        "bus is shutting down",
    )
}

/// Dispatch one envelope and report the outcome to its submitter.
pub(crate) async fn process(dispatcher: &Dispatcher, stats: &BusStats, inbound: Inbound) {
    BusStats::incr(&stats.received);
    let message_id = inbound.envelope.message_id();

    let outcome = match dispatcher.dispatch(&inbound.envelope).await {
        Ok(_) => {
            BusStats::incr(&stats.succeeded);
            Ok(())
        }
        Err(err) => {
            BusStats::incr(&stats.failed);
            warn!(
                message_id = %message_id,
                message_type = %inbound.envelope.message_type(),
                kind = err.kind().as_str(),
                error = %err,
                "envelope processing failed"
            );
            Err(err.into_failure(message_id))
        }
    };
    inbound.complete(outcome);
}
