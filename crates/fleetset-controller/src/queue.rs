//! Deduplicating work queue with per-key backoff.
//!
//! A key sits in the queue at most once. While a worker holds a key, adding
//! it again only marks it dirty; it is queued again when the worker calls
//! [`WorkQueue::done`]. So no two workers ever reconcile the same key at
//! the same time, and bursts of events for one key collapse into a single
//! reconcile.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed, whether queued or held by a worker.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Consecutive failures per key, for backoff.
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff_base,
                backoff_max,
            }),
        }
    }

    /// Mark `key` as needing work. No-op if it is already pending.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller must hand the key back with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            // Registered before checking so a concurrent add or shutdown
            // cannot slip in unnoticed.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing; queue it again if it was added in
    /// the meantime.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` after `delay`.
    pub fn requeue_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add `key` after its exponential backoff delay and return the delay.
    pub fn requeue_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = backoff_delay(self.inner.backoff_base, self.inner.backoff_max, *failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.requeue_after(key, delay);
        delay
    }

    /// Reset `key`'s backoff.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Stop handing out keys. Waiting and future [`WorkQueue::get`] calls
    /// return `None` once the queue has drained.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Number of keys waiting to be picked up.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// `base * 2^failures`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}
