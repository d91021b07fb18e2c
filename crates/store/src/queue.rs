//! Deduplicating FIFO of reconcile keys.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tikvop_core::WorkQueue;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct State {
    order: VecDeque<String>,
    /// Keys waiting to be handed out (or re-queued once processing ends).
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    /// Consecutive rate-limited requeues per key, cleared by `forget`.
    requeues: FxHashMap<String, u32>,
    shutting_down: bool,
}

/// Upper bound on the delay of a rate-limited requeue.
pub const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(300);

/// Work queue with the usual controller guarantees:
/// - repeated `add`s of a pending key collapse into one entry;
/// - a key handed out by `get` is not handed out again until `done`;
/// - a key added while processing is re-queued exactly once on `done`.
#[derive(Default)]
pub struct DedupQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl DedupQueue {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking holder leaves the sets consistent; keep serving.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize { self.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn push(&self, key: String) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        if !st.dirty.insert(key.clone()) {
            counter!("workqueue_deduped_total", 1u64);
            return;
        }
        if st.processing.contains(&key) {
            return;
        }
        st.order.push_back(key);
        gauge!("workqueue_depth", st.order.len() as f64);
        drop(st);
        self.notify.notify_one();
    }

    /// Wait for the next key; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(key) = st.order.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("workqueue_depth", st.order.len() as f64);
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed; re-queues it if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.order.push_back(key.to_string());
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: String, delay: Duration) {
        if delay.is_zero() {
            self.push(key);
            return;
        }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.push(key);
        });
    }

    /// Requeue `key` after `base` doubled once per earlier requeue of the
    /// same key, capped at [`MAX_REQUEUE_DELAY`]. Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: String, base: Duration) -> Duration {
        let attempts = {
            let mut st = self.lock();
            let n = st.requeues.entry(key.clone()).or_insert(0);
            let prev = *n;
            *n = n.saturating_add(1);
            prev
        };
        let delay = base.saturating_mul(1u32 << attempts.min(16)).min(MAX_REQUEUE_DELAY);
        self.add_after(key, delay);
        delay
    }

    /// Number of rate-limited requeues of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Reset the backoff of `key`; called once it has been handled for good.
    pub fn forget(&self, key: &str) {
        self.lock().requeues.remove(key);
    }

    /// Stop accepting keys and wake every waiter.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        debug!("work queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }
}

impl WorkQueue for DedupQueue {
    fn add(&self, key: String) { self.push(key) }
}
