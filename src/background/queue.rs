//! Rate-limited workqueue for background policy workers.
//!
//! Keys are deduplicated while queued and while being processed: re-adding an
//! in-flight key marks it dirty and re-enqueues it once processing finishes.
//! Failed keys re-enter through an exponential per-key backoff; `forget`
//! resets the failure count.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// First retry delay.
const BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound for the exponential backoff.
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

struct QueueInner {
    state: parking_lot::Mutex<QueueState>,
    notify: Notify,
}

/// A clonable handle to one policy's workqueue.
#[derive(Clone)]
pub struct RateLimitedQueue {
    inner: Arc<QueueInner>,
}

impl RateLimitedQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: parking_lot::Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a key. No-ops if the key is already queued; a key currently
    /// being processed is marked dirty and re-enqueued on `done`.
    pub fn add(&self, key: &str) {
        let mut state = self.inner.state.lock();
        if state.shut_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Re-enqueue after the key's current backoff delay, doubling it for the
    /// next failure.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            backoff_delay(*failures)
        };

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Reset the failure count for a key.
    pub fn forget(&self, key: &str) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Current backoff attempt count for a key.
    pub fn retries(&self, key: &str) -> u32 {
        self.inner.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Mark a key as processed. If it was re-added while in flight it goes
    /// back on the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shut_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting new keys and wake all waiting workers.
    pub fn shut_down(&self) {
        self.inner.state.lock().shut_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Number of queued (not in-flight) keys.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RateLimitedQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(32);
    let delay = BASE_DELAY.saturating_mul(1u32 << exp.min(20));
    delay.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_get() {
        let queue = RateLimitedQueue::new();
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = RateLimitedQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("a");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn re_add_while_processing_requeues_on_done() {
        let queue = RateLimitedQueue::new();
        queue.add("a");

        let key = queue.get().await.unwrap();
        // The key is in flight: another add must not enqueue a second copy.
        queue.add("a");
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn done_without_dirty_does_not_requeue() {
        let queue = RateLimitedQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_backoff_grows_and_forget_resets() {
        let queue = RateLimitedQueue::new();

        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.retries("a"), 3);

        queue.forget("a");
        assert_eq!(queue.retries("a"), 0);
    }

    #[tokio::test]
    async fn rate_limited_key_reappears_quickly_at_low_failure_counts() {
        let queue = RateLimitedQueue::new();
        queue.add_rate_limited("a");

        let key = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("key should reappear within the first backoff steps");
        assert_eq!(key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_with_none() {
        let queue = RateLimitedQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[test]
    fn backoff_delay_is_exponential_and_capped() {
        assert_eq!(backoff_delay(1), Duration::from_millis(5));
        assert_eq!(backoff_delay(2), Duration::from_millis(10));
        assert_eq!(backoff_delay(3), Duration::from_millis(20));
        assert_eq!(backoff_delay(64), MAX_DELAY);
    }
}
