//! Per-controller workqueue.
//!
//! The queue provides the ordering the engine relies on:
//!
//! - adds for a key already waiting coalesce into one entry,
//! - at most one reconcile per key is in flight at a time; an add for an
//!   active key is remembered and replayed when the worker finishes,
//! - failures requeue with exponential backoff (1s doubling to a 30s cap),
//! - steady-state requeues are delivered after a delay (the jittered poll
//!   interval).
//!
//! Producers are synchronous (watch handlers call [`WorkQueue::add`]
//! inline); consumers await [`WorkQueue::get`]. Delayed adds run through a
//! timer task owning a [`DelayQueue`], holding only a weak reference so a
//! dropped queue tears its timer down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tether_core::ObjectKey;
use tokio::sync::{mpsc, Notify};
use tokio_util::time::DelayQueue;
use tracing::trace;

/// First failure backoff.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Failure backoff cap.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shutdown: bool,
}

/// Rate-limited, per-key-coalescing workqueue.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    delayed_tx: mpsc::UnboundedSender<(ObjectKey, Duration)>,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl WorkQueue {
    /// Creates a queue with the default backoff window.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_backoff(DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF)
    }

    /// Creates a queue with an explicit backoff window.
    #[must_use]
    pub fn with_backoff(base: Duration, max: Duration) -> Arc<Self> {
        let (delayed_tx, delayed_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            delayed_tx,
            base_backoff: base,
            max_backoff: max,
        });
        tokio::spawn(run_delay_timer(delayed_rx, Arc::downgrade(&queue)));
        queue
    }

    /// Enqueues a key. Coalesces with a waiting entry; a key currently in
    /// flight is marked dirty and replayed after its worker finishes.
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().expect("workqueue poisoned");
        if state.shutdown {
            return;
        }
        if state.active.contains(&key) {
            trace!(%key, "key in flight, marking dirty");
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueues a key after a delay.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        // Receiver gone only when the timer task exited at shutdown.
        let _ = self.delayed_tx.send((key, delay));
    }

    /// Dequeues the next key, waiting until one is ready.
    ///
    /// Returns `None` once the queue is shut down. The key is considered
    /// in flight until [`done`](Self::done) is called for it.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("workqueue poisoned");
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        // A stored permit covers one waiter; cascade so
                        // sibling workers see the remaining entries.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks a key's in-flight reconcile finished, replaying a dirty add.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().expect("workqueue poisoned");
        state.active.remove(key);
        if state.shutdown {
            return;
        }
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clears a key's failure history after a successful reconcile.
    pub fn forget(&self, key: &ObjectKey) {
        self.state
            .lock()
            .expect("workqueue poisoned")
            .failures
            .remove(key);
    }

    /// Records a failure and returns the backoff before the next attempt.
    pub fn next_backoff(&self, key: &ObjectKey) -> Duration {
        let mut state = self.state.lock().expect("workqueue poisoned");
        let failures = state.failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        let exponent = (*failures - 1).min(16);
        let delay = self.base_backoff.saturating_mul(1 << exponent);
        delay.min(self.max_backoff)
    }

    /// Number of keys waiting (not counting in-flight or delayed ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("workqueue poisoned").ready.len()
    }

    /// Whether no keys are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts the queue down: waiting keys are dropped and every pending
    /// and future [`get`](Self::get) returns `None`.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().expect("workqueue poisoned");
            state.shutdown = true;
            state.ready.clear();
            state.queued.clear();
            state.dirty.clear();
        }
        self.notify.notify_waiters();
    }
}

async fn run_delay_timer(
    mut rx: mpsc::UnboundedReceiver<(ObjectKey, Duration)>,
    queue: Weak<WorkQueue>,
) {
    let mut delays: DelayQueue<ObjectKey> = DelayQueue::new();

    loop {
        if delays.is_empty() {
            match rx.recv().await {
                Some((key, delay)) => {
                    delays.insert(key, delay);
                }
                None => break,
            }
            continue;
        }

        tokio::select! {
            entry = rx.recv() => match entry {
                Some((key, delay)) => {
                    delays.insert(key, delay);
                }
                None => break,
            },
            expired = futures::future::poll_fn(|cx| delays.poll_expired(cx)) => {
                if let Some(expired) = expired {
                    let Some(queue) = queue.upgrade() else { break };
                    queue.add(expired.into_inner());
                }
            }
        }
    }
}
