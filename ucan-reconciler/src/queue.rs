//! Keyed work queue.
//!
//! Guarantees at most one in-flight reconcile per key: a key is handed to a
//! single worker and is not handed out again until that worker reports back.
//! Triggers that arrive meanwhile are coalesced into one follow-up run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::error::ErrorClass;
use crate::object::ObjectKey;

#[derive(Debug, Default)]
struct Entry {
    /// Sent to the ready channel, not yet taken by a worker.
    queued: bool,
    in_flight: bool,
    /// Triggered while in flight.
    dirty: bool,
    /// End of the backoff window; triggers before it are deferred.
    not_before: Option<Instant>,
    failures: u32,
    /// Generation of the armed timer; older timers are stale.
    timer: u64,
}

struct Inner {
    entries: Mutex<HashMap<ObjectKey, Entry>>,
    ready_tx: mpsc::UnboundedSender<ObjectKey>,
    ready_rx: AsyncMutex<mpsc::UnboundedReceiver<ObjectKey>>,
    backoff: Backoff,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                ready_tx,
                ready_rx: AsyncMutex::new(ready_rx),
                backoff,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ObjectKey, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Trigger a reconcile of `key`.
    ///
    /// Deferred to the end of the backoff window if the key recently failed.
    pub fn add(&self, key: ObjectKey) {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_default();
        if entry.not_before.is_some_and(|at| at > Instant::now()) {
            // The armed backoff timer will pick it up
            return;
        }
        self.enqueue(key, entry);
    }

    fn enqueue(&self, key: ObjectKey, entry: &mut Entry) {
        if entry.in_flight {
            entry.dirty = true;
            return;
        }
        if entry.queued {
            return;
        }
        entry.queued = true;
        let _ = self.inner.ready_tx.send(key);
    }

    /// Arm a timer that triggers `key` after `delay`, replacing any earlier timer.
    fn arm(&self, key: ObjectKey, entry: &mut Entry, delay: Duration) {
        entry.timer = entry.timer.wrapping_add(1);
        let timer = entry.timer;
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.fire(key, timer);
        });
    }

    fn fire(&self, key: ObjectKey, timer: u64) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&key) else {
            return;
        };
        if entry.timer != timer {
            return;
        }
        entry.not_before = None;
        self.enqueue(key, entry);
    }

    /// Wait for the next key to reconcile and mark it in flight.
    pub async fn next(&self) -> Option<ObjectKey> {
        let mut ready = self.inner.ready_rx.lock().await;
        loop {
            let key = ready.recv().await?;
            if self.start(&key) {
                return Some(key);
            }
        }
    }

    fn start(&self, key: &ObjectKey) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(key) {
            Some(entry) if entry.queued => {
                entry.queued = false;
                entry.in_flight = true;
                true
            }
            // Forgotten, or a duplicate send
            _ => false,
        }
    }

    /// Finish a successful cycle and requeue after `after`.
    pub fn done(&self, key: &ObjectKey, after: Duration) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.in_flight = false;
        entry.failures = 0;
        entry.not_before = None;

        if entry.dirty || after.is_zero() {
            entry.dirty = false;
            // Invalidate the previous poll timer
            entry.timer = entry.timer.wrapping_add(1);
            self.enqueue(key.clone(), entry);
        } else {
            self.arm(key.clone(), entry, after);
        }
    }

    /// Finish a failed cycle. Returns the retry delay, or `None` when the key
    /// is parked until its next trigger.
    pub fn failed(&self, key: &ObjectKey, class: ErrorClass) -> Option<Duration> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;
        entry.in_flight = false;
        entry.failures = entry.failures.saturating_add(1);

        let delay = match class {
            ErrorClass::Transient => self.inner.backoff.delay(entry.failures),
            ErrorClass::Poison => self.inner.backoff.max,
            ErrorClass::Permanent => {
                entry.timer = entry.timer.wrapping_add(1);
                entry.not_before = None;
                if entry.dirty {
                    // Changed while failing; the new spec deserves a run
                    entry.dirty = false;
                    self.enqueue(key.clone(), entry);
                }
                return None;
            }
        };

        entry.dirty = false;
        entry.not_before = Some(Instant::now() + delay);
        self.arm(key.clone(), entry, delay);
        Some(delay)
    }

    /// Stop tracking `key`; pending timers and queued sends become no-ops.
    pub fn forget(&self, key: &ObjectKey) {
        self.entries().remove(key);
    }

    pub fn is_tracked(&self, key: &ObjectKey) -> bool {
        self.entries().contains_key(key)
    }

    /// Consecutive failures of `key`.
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.entries().get(key).map_or(0, |e| e.failures)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
