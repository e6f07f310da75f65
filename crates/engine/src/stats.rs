//! Bus runtime statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Snapshot of [`BusStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStatsSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub sagas_created: u64,
    pub sagas_completed: u64,
    pub concurrency_retries: u64,
    pub timeouts_fired: u64,
    pub outbox_relayed: u64,
    pub uptime_secs: u64,
}

/// Live counters, shared by the workers, the dispatch engine and the relay.
#[derive(Debug)]
pub struct BusStats {
    pub(crate) received: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) ignored: AtomicU64,
    pub(crate) sagas_created: AtomicU64,
    pub(crate) sagas_completed: AtomicU64,
    pub(crate) concurrency_retries: AtomicU64,
    pub(crate) timeouts_fired: AtomicU64,
    pub(crate) outbox_relayed: AtomicU64,
    started: Instant,
}

impl Default for BusStats {
    fn default() -> Self {
        Self {
            received: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            sagas_created: AtomicU64::new(0),
            sagas_completed: AtomicU64::new(0),
            concurrency_retries: AtomicU64::new(0),
            timeouts_fired: AtomicU64::new(0),
            outbox_relayed: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl BusStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            sagas_created: self.sagas_created.load(Ordering::Relaxed),
            sagas_completed: self.sagas_completed.load(Ordering::Relaxed),
            concurrency_retries: self.concurrency_retries.load(Ordering::Relaxed),
            timeouts_fired: self.timeouts_fired.load(Ordering::Relaxed),
            outbox_relayed: self.outbox_relayed.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}
