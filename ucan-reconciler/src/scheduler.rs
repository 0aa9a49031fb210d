//! Scheduler - drives reconcile cycles for one resource kind.
//!
//! Cycles are triggered by store events and by a fixed poll interval per
//! object, executed by a bounded worker pool, and retried with exponential
//! backoff on failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::client::ExternalClient;
use crate::queue::WorkQueue;
use crate::reconciler::{Reconciler, Requeue};
use crate::store::StoreEvent;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between cycles of a healthy object.
    pub poll_interval: Duration,
    /// Number of objects reconciled concurrently.
    pub concurrency: usize,
    pub backoff: Backoff,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            concurrency: 10,
            backoff: Backoff::default(),
        }
    }
}

pub struct Scheduler<C: ExternalClient> {
    reconciler: Arc<Reconciler<C>>,
    queue: WorkQueue,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl<C: ExternalClient> Scheduler<C> {
    pub fn new(
        reconciler: Arc<Reconciler<C>>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            queue: WorkQueue::new(config.backoff),
            config,
            cancel,
        }
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Enqueue every declared object.
    async fn resync(&self) {
        let keys = self.reconciler.store().list().await;
        debug!(kind = self.reconciler.kind(), objects = keys.len(), "Resync");
        for key in keys {
            self.queue.add(key);
        }
    }

    /// Run until the cancellation token fires, then wait for the workers.
    pub async fn run(self) {
        let kind = self.reconciler.kind();
        // Subscribe before listing so no change slips between the two
        let mut events = self.reconciler.store().subscribe();
        self.resync().await;

        let concurrency = self.config.concurrency.max(1);
        let mut workers = JoinSet::new();
        for id in 0..concurrency {
            workers.spawn(worker(
                id,
                self.reconciler.clone(),
                self.queue.clone(),
                self.config.poll_interval,
                self.cancel.clone(),
            ));
        }
        info!(
            kind,
            workers = concurrency,
            poll_interval = ?self.config.poll_interval,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(StoreEvent::Applied(key)) | Ok(StoreEvent::DeletionRequested(key)) => {
                        self.queue.add(key);
                    }
                    Ok(StoreEvent::Removed(key)) => self.queue.forget(&key),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(kind, skipped, "Store events lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        // Polling keeps going without events
                        self.cancel.cancelled().await;
                        break;
                    }
                },
            }
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Worker for {} panicked: {}", kind, e);
            }
        }
        info!(kind, "Scheduler stopped");
    }
}

async fn worker<C: ExternalClient>(
    id: usize,
    reconciler: Arc<Reconciler<C>>,
    queue: WorkQueue,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            _ = cancel.cancelled() => break,
            key = queue.next() => match key {
                Some(key) => key,
                None => break,
            },
        };

        match reconciler.reconcile(&key).await {
            Ok(outcome) => {
                debug!(worker = id, %key, ?outcome, "Reconciled");
                match outcome.requeue() {
                    Requeue::Poll => queue.done(&key, poll_interval),
                    Requeue::Immediately => queue.done(&key, Duration::ZERO),
                    Requeue::Forget => queue.forget(&key),
                }
            }
            Err(e) => {
                let class = e.class();
                let retry_in = queue.failed(&key, class);
                warn!(
                    worker = id,
                    %key,
                    error = %e,
                    ?class,
                    ?retry_in,
                    "Reconcile failed"
                );
            }
        }
    }
    debug!(worker = id, "Worker stopping");
}
