//! Deduplicating work queue with per-key backoff.
//!
//! This module provides [`WorkQueue`], the queue between watch events and
//! reconciliation workers.
//!
//! ## Guarantees
//!
//! - **Coalescing**: adding a key that is already waiting is a no-op
//! - **Single flight**: a key handed out by [`WorkQueue::get`] is not handed out
//!   again until [`WorkQueue::done`] is called for it
//! - **No lost updates**: a key added while it is being processed is retained
//!   and queued exactly once when processing finishes
//! - **Shutdown**: after [`WorkQueue::shutdown`], `get` returns `None` and new
//!   adds are ignored; workers finish their in-flight keys and exit. Delayed
//!   adds still waiting are dropped with their timers

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Exponential per-key backoff for failed keys.
///
/// The delay for a key that failed `n` times before is
/// `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl BackoffPolicy {
    /// Returns the delay after `failures` previous failures.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed, whether queued or parked behind processing.
    dirty: HashSet<K>,
    /// Keys handed out and not yet marked done.
    processing: HashSet<K>,
    /// Failure counts for rate-limited requeues.
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

#[derive(Debug)]
struct Inner<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    /// Cancels pending delayed adds on shutdown.
    cancel: CancellationToken,
    backoff: BackoffPolicy,
}

/// Deduplicating work queue of keys.
///
/// Cloning is cheap; clones share the same queue.
///
/// ## Example
///
/// ```rust
/// use release_controller::queue::WorkQueue;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let queue = WorkQueue::new("releases");
/// queue.add("ci/stable".to_string());
/// queue.add("ci/stable".to_string());
/// assert_eq!(queue.len(), 1);
///
/// let key = queue.get().await;
/// assert_eq!(key.as_deref(), Some("ci/stable"));
/// queue.done(&"ci/stable".to_string());
/// # }
/// ```
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
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
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a queue with the default backoff policy.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, BackoffPolicy::default())
    }

    /// Creates a queue with a custom backoff policy.
    #[must_use]
    pub fn with_backoff(name: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
                backoff,
            }),
        }
    }

    /// Returns the queue's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a key as needing processing.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Requeued by done().
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds a key after `delay`. A zero delay adds immediately.
    ///
    /// The pending add is abandoned on shutdown. Must be called from within a
    /// tokio runtime.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Adds a key after its backoff delay and counts the failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            let delay = self.inner.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Clears the failure count of a key.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Returns how many times a key was requeued after failures.
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an add between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Marks a key handed out by [`get`](Self::get) as processed.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops handing out keys and wakes every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.inner.cancel.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Returns the number of keys waiting to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no key is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
