//! Deduplicating, rate-limited work queue.
//!
//! Items are tracked by key. A key is in at most one of three places: queued
//! (waiting for a worker), processing (held by exactly one worker), or idle.
//! The newest payload for a key always replaces an older pending one, so a
//! worker never sees a stale snapshot.

pub mod rate_limit;

pub use rate_limit::{
    BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};

use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Something that can be queued: it knows the identity it deduplicates on.
pub trait QueueItem: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

struct QueueState<T: QueueItem> {
    /// Keys ready for a worker, in arrival order.
    queue: VecDeque<T::Key>,
    /// Latest payload for every key that needs processing.
    dirty: HashMap<T::Key, T>,
    /// Keys currently held by a worker.
    processing: HashSet<T::Key>,
    shutting_down: bool,
}

struct Inner<T: QueueItem> {
    name: String,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    shutdown: CancellationToken,
    limiter: Box<dyn RateLimiter<T::Key>>,
}

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<T: QueueItem> {
    inner: Arc<Inner<T>>,
}

impl<T: QueueItem> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T::Key> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashMap::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    /// A queue using [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `item`, superseding any pending payload for the same key.
    pub fn add(&self, item: T) {
        let key = item.key();
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if let Some(pending) = state.dirty.get_mut(&key) {
                // Already waiting (queued, or deferred behind a worker).
                *pending = item;
                return;
            }
            state.dirty.insert(key.clone(), item);
            if state.processing.contains(&key) {
                debug!(queue = %self.inner.name, ?key, "deferred until current processing is done");
                return;
            }
            state.queue.push_back(key);
        }
        metrics::queue_adds().add(1, &[KeyValue::new("queue", self.inner.name.clone())]);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    ///
    /// The returned item's key stays marked as processing until [`done`].
    ///
    /// [`done`]: WorkQueue::done
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so an add in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                while let Some(key) = state.queue.pop_front() {
                    if let Some(item) = state.dirty.remove(&key) {
                        state.processing.insert(key);
                        return Some(item);
                    }
                }
            }

            notified.await;
        }
    }

    /// Release the processing mark. A key added meanwhile is re-queued.
    pub fn done(&self, key: &T::Key) {
        {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            if !state.dirty.contains_key(key) || state.shutting_down {
                return;
            }
            state.queue.push_back(key.clone());
        }
        self.inner.notify.notify_one();
    }

    /// Enqueue after `delay`. Dropped if the queue shuts down first.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Re-enqueue after the rate limiter's delay for this key.
    pub fn add_rate_limited(&self, item: T) {
        let key = item.key();
        let delay = self.inner.limiter.when(&key);
        debug!(
            queue = %self.inner.name,
            ?key,
            delay_ms = delay.as_millis() as u64,
            "requeue with backoff"
        );
        metrics::queue_retries().add(1, &[KeyValue::new("queue", self.inner.name.clone())]);
        self.add_after(item, delay);
    }

    /// Clear the failure history for `key`.
    pub fn forget(&self, key: &T::Key) {
        self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &T::Key) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiting `get` with `None` and refuse further adds.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, "queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}
