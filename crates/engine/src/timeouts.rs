//! Timeout Scheduler: one deadline per saga instance.
//!
//! - `schedule`/`arm` set or replace the single deadline of an instance (no stacking)
//! - `cancel` disarms it
//! - both carry the committed instance version; older requests are dropped
//! - on expiry the record is consumed and a timeout trigger envelope is enqueued
//!   through the same [`Ingress`] transports use, so timeouts go through the
//!   normal transactional saga path
//!
//! The trigger carries the deadline it was armed with. The dispatch engine applies
//! it only while the instance's persisted deadline still equals it, which makes a
//! trigger fire at most once even if it is redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sagabus_core::{CorrelationId, HandlerError, MessageId};
use sagabus_messages::{Destination, Ingress, MessageEnvelope, MessageKind};

/// Message type of timeout trigger envelopes.
pub const TIMEOUT_MESSAGE_TYPE: &str = "sagabus.timeout";

/// Payload of a timeout trigger envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutTrigger {
    pub deadline: DateTime<Utc>,
}

impl TimeoutTrigger {
    pub fn from_envelope(envelope: &MessageEnvelope) -> Result<Self, HandlerError> {
        serde_json::from_value(envelope.payload().clone())
            .map_err(|e| HandlerError::decode(format!("{TIMEOUT_MESSAGE_TYPE}: {e}")))
    }
}

/// Build the trigger envelope for `correlation_id`'s deadline.
pub fn timeout_envelope(
    correlation_id: &CorrelationId,
    saga_type: &str,
    deadline: DateTime<Utc>,
) -> MessageEnvelope {
    let payload = serde_json::json!({ "deadline": deadline });
    MessageEnvelope::new(
        MessageId::new(),
        TIMEOUT_MESSAGE_TYPE,
        MessageKind::Timeout,
        Destination::saga(saga_type),
        payload,
    )
    .with_correlation_id(Some(correlation_id.clone()))
}

/// Latest deadline a timeout can carry: 9999-12-31T23:59:59.999999Z, inside the
/// range of every store's timestamp column.
pub fn latest_deadline() -> DateTime<Utc> {
    DateTime::from_timestamp_micros(253_402_300_799_999_999).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Absolute deadline `duration` from now, capped at [`latest_deadline`].
///
/// Rounded up to the next microsecond so it survives storage with microsecond
/// precision unchanged and never lands before `now + duration`.
pub fn deadline_after(duration: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    let latest = latest_deadline();
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map(|d| d.trunc_subsecs(6))
        .and_then(|d| d.checked_add_signed(TimeDelta::microseconds(1)))
        .map_or(latest, |d| d.min(latest))
}

struct TimeoutRecord {
    saga_type: String,
    deadline: DateTime<Utc>,
    generation: u64,
    task: JoinHandle<()>,
}

/// Latest request seen for one instance, armed or not.
struct Slot {
    version: u64,
    armed: Option<TimeoutRecord>,
}

/// How long a disarmed slot keeps its version to reject late, older requests.
const RETIRED_FOR: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Slots {
    by_id: HashMap<CorrelationId, Slot>,
    retired: VecDeque<(Instant, CorrelationId, u64)>,
}

impl Slots {
    /// `false` when a request at `version` is older than what the slot holds.
    fn accepts(&self, correlation_id: &CorrelationId, version: u64) -> bool {
        self.by_id
            .get(correlation_id)
            .is_none_or(|slot| version >= slot.version)
    }

    fn retire(&mut self, correlation_id: CorrelationId, version: u64) {
        let now = Instant::now();
        while let Some((at, _, _)) = self.retired.front() {
            if now.duration_since(*at) < RETIRED_FOR {
                break;
            }
            if let Some((_, id, version)) = self.retired.pop_front() {
                let unchanged = self
                    .by_id
                    .get(&id)
                    .is_some_and(|slot| slot.version == version && slot.armed.is_none());
                if unchanged {
                    self.by_id.remove(&id);
                }
            }
        }
        self.retired.push_back((now, correlation_id, version));
    }
}

#[derive(Default)]
struct Inner {
    slots: Mutex<Slots>,
    ingress: Mutex<Option<Ingress>>,
    generation: AtomicU64,
    fired: AtomicU64,
}

/// Cloneable handle to the scheduler.
///
/// Every request carries the instance version it was derived from. Requests are
/// applied after the store commit, so two transitions of one instance can reach
/// the scheduler out of commit order; a request older than the version already
/// held is dropped.
#[derive(Clone, Default)]
pub struct TimeoutScheduler {
    inner: Arc<Inner>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route expired timeouts into `ingress`.
    pub fn attach(&self, ingress: Ingress) {
        if let Ok(mut slot) = self.inner.ingress.lock() {
            *slot = Some(ingress);
        }
    }

    /// Arm (or re-arm) a timeout `duration` from now; returns the deadline.
    pub fn schedule(
        &self,
        correlation_id: CorrelationId,
        saga_type: impl Into<String>,
        duration: Duration,
        version: u64,
    ) -> DateTime<Utc> {
        let deadline = deadline_after(duration);
        self.arm(correlation_id, saga_type, deadline, version);
        deadline
    }

    /// Arm (or re-arm) a timeout at an absolute `deadline` for the instance at
    /// `version`. A past deadline fires immediately. Returns `false` when a newer
    /// version already armed or cancelled this instance.
    pub fn arm(
        &self,
        correlation_id: CorrelationId,
        saga_type: impl Into<String>,
        deadline: DateTime<Utc>,
        version: u64,
    ) -> bool {
        let saga_type = saga_type.into();
        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        let Ok(mut slots) = self.inner.slots.lock() else {
            warn!(correlation_id = %correlation_id, "timeout slots poisoned; not armed");
            return false;
        };
        if !slots.accepts(&correlation_id, version) {
            debug!(correlation_id = %correlation_id, version, "outdated timeout request dropped");
            return false;
        }

        // Spawned under the lock so the task cannot fire before its record exists.
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let inner = Arc::clone(&self.inner);
        let id = correlation_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(inner, id, generation).await;
        });

        let previous = slots.by_id.insert(
            correlation_id.clone(),
            Slot {
                version,
                armed: Some(TimeoutRecord {
                    saga_type,
                    deadline,
                    generation,
                    task,
                }),
            },
        );
        drop(slots);

        if let Some(record) = previous.and_then(|slot| slot.armed) {
            record.task.abort();
        }
        debug!(correlation_id = %correlation_id, %deadline, version, "timeout armed");
        true
    }

    /// Disarm the timeout of `correlation_id` as of `version`; `false` if none was
    /// armed or a newer version holds the slot.
    pub fn cancel(&self, correlation_id: &CorrelationId, version: u64) -> bool {
        let removed = match self.inner.slots.lock() {
            Ok(mut slots) if slots.accepts(correlation_id, version) => {
                let previous = slots.by_id.insert(
                    correlation_id.clone(),
                    Slot {
                        version,
                        armed: None,
                    },
                );
                slots.retire(correlation_id.clone(), version);
                previous.and_then(|slot| slot.armed)
            }
            _ => None,
        };

        match removed {
            Some(record) => {
                record.task.abort();
                debug!(correlation_id = %correlation_id, version, "timeout cancelled");
                true
            }
            None => false,
        }
    }

    /// Currently armed deadline of `correlation_id`.
    pub fn deadline(&self, correlation_id: &CorrelationId) -> Option<DateTime<Utc>> {
        self.inner
            .slots
            .lock()
            .ok()?
            .by_id
            .get(correlation_id)
            .and_then(|slot| slot.armed.as_ref())
            .map(|r| r.deadline)
    }

    pub fn armed(&self) -> usize {
        self.inner
            .slots
            .lock()
            .map(|s| s.by_id.values().filter(|slot| slot.armed.is_some()).count())
            .unwrap_or(0)
    }

    /// Triggers enqueued so far.
    pub fn fired(&self) -> u64 {
        self.inner.fired.load(Ordering::Relaxed)
    }

    /// Disarm every timeout and detach from the ingress.
    pub fn shutdown(&self) {
        let drained: Vec<TimeoutRecord> = match self.inner.slots.lock() {
            Ok(mut slots) => {
                slots.retired.clear();
                slots.by_id.drain().filter_map(|(_, slot)| slot.armed).collect()
            }
            Err(_) => Vec::new(),
        };
        for record in &drained {
            record.task.abort();
        }
        if let Ok(mut slot) = self.inner.ingress.lock() {
            *slot = None;
        }
        debug!(disarmed = drained.len(), "timeout scheduler stopped");
    }
}

async fn fire(inner: Arc<Inner>, correlation_id: CorrelationId, generation: u64) {
    // Only the current arming of this instance may fire; consume it but keep its
    // version so an older request cannot re-arm the instance afterwards.
    let record = match inner.slots.lock() {
        Ok(mut slots) => {
            let taken = match slots.by_id.get_mut(&correlation_id) {
                Some(slot) if slot.armed.as_ref().is_some_and(|r| r.generation == generation) => {
                    slot.armed.take().map(|record| (slot.version, record))
                }
                _ => None,
            };
            taken.map(|(version, record)| {
                slots.retire(correlation_id.clone(), version);
                record
            })
        }
        Err(_) => None,
    };
    let Some(record) = record else {
        return;
    };

    let ingress = inner.ingress.lock().ok().and_then(|slot| slot.clone());
    let Some(ingress) = ingress else {
        warn!(correlation_id = %correlation_id, "timeout expired with no ingress attached");
        return;
    };

    let envelope = timeout_envelope(&correlation_id, &record.saga_type, record.deadline);
    if ingress.enqueue(envelope).await {
        inner.fired.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %correlation_id, saga_type = %record.saga_type, "timeout fired");
    } else {
        warn!(correlation_id = %correlation_id, "timeout trigger dropped: ingress closed");
    }
}
