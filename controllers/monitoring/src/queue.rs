//! Work queue between the watchers and the reconcile workers.
//!
//! Keys are `namespace/name` strings. A key is queued at most once (`dirty`),
//! and a key being processed is never handed to a second worker
//! (`processing`); events for it are parked until the worker calls
//! [`WorkQueue::done`]. Failed keys are re-added with per-key exponential
//! backoff.

use crate::backoff::ExponentialBackoff;
use crate::metrics::Metrics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    backoff: HashMap<String, ExponentialBackoff>,
    shutting_down: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("len", &self.len()).finish()
    }
}

impl WorkQueue {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Metrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock leaves the sets consistent enough to keep going.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn publish_depth(&self, state: &QueueState) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(state.queue.len());
        }
    }

    /// Enqueues a key unless it is already waiting.
    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        self.publish_depth(&state);
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueues a key once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Enqueues a key after its next backoff step and returns the delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let delay = self
            .lock()
            .backoff
            .entry(key.to_string())
            .or_default()
            .next_backoff();
        self.add_after(key, delay);
        delay
    }

    /// Resets a key's backoff.
    pub fn forget(&self, key: &str) {
        self.lock().backoff.remove(key);
    }

    /// Waits for the next key; `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.publish_depth(&state);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key processed; re-queues it if events arrived meanwhile.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            self.publish_depth(&state);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stops accepting keys and wakes every waiting worker.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        self.publish_depth(&state);
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }
}

/// Result of handling one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; backoff is reset.
    Done,
    /// Handle again after the delay without touching backoff.
    Requeue(Duration),
    /// Failed; retry after the key's next backoff step.
    Retry,
}

/// Processes keys taken from the queue.
#[async_trait::async_trait]
pub trait KeyHandler: Send + Sync {
    async fn handle(&self, key: &str) -> Outcome;
}

async fn run_worker(id: usize, queue: Arc<WorkQueue>, handler: Arc<dyn KeyHandler>) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        match handler.handle(&key).await {
            Outcome::Done => queue.forget(&key),
            Outcome::Requeue(delay) => queue.add_after(&key, delay),
            Outcome::Retry => {
                let delay = queue.add_rate_limited(&key);
                warn!(instance = %key, retry_in = ?delay, "Reconcile failed, backing off");
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

/// Starts `count` workers draining the queue.
pub fn spawn_workers(count: usize, queue: &Arc<WorkQueue>, handler: &Arc<dyn KeyHandler>) -> Vec<JoinHandle<()>> {
    info!("Starting {} reconcile worker(s)", count);
    (0..count)
        .map(|id| tokio::spawn(run_worker(id, Arc::clone(queue), Arc::clone(handler))))
        .collect()
}
