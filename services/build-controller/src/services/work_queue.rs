use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use tokio::sync::{Mutex, Notify};
use tracing::debug;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Namespace and name of the BuildRun a reconcile is for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    /// Keys waiting to be processed, queued or not.
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

/// De-duplicating queue of reconcile keys. A key is handed to at most one
/// worker at a time; adding it while it is processed parks it until
/// [`WorkQueue::done`].
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Per-key retry delay: 5ms doubled on every consecutive failure, capped at
/// 1000s.
pub fn backoff(failures: u32) -> Duration {
    let factor = 1u32
        .checked_shl(failures.saturating_sub(1))
        .unwrap_or(u32::MAX);
    BASE_DELAY.saturating_mul(factor).min(MAX_DELAY)
}

impl WorkQueue {
    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Waits for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    drop(state);
                    self.notify.notify_one();
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Releases `key` after processing, queueing it again if it was added
    /// meanwhile.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clears the failure history of `key`.
    pub async fn forget(&self, key: &ObjectKey) {
        self.state.lock().await.failures.remove(key);
    }

    pub async fn failures(&self, key: &ObjectKey) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Adds `key` again after its backoff delay.
    pub async fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let failures = {
            let mut state = self.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_default();
            *failures += 1;
            *failures
        };

        let delay = backoff(failures);
        debug!(%key, failures, ?delay, "⏳ Requeueing with backoff");

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Adds `key` once `delay` has passed, without counting a failure.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        debug!(%key, ?delay, "⏰ Requeueing after delay");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    pub async fn shutdown(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("builds", name)
    }

    #[tokio::test]
    async fn duplicate_keys_collapse() {
        let queue = WorkQueue::default();
        queue.add(key("a")).await;
        queue.add(key("b")).await;
        queue.add(key("a")).await;

        assert_eq!(queue.queued().await, 2);
        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
    }

    #[tokio::test]
    async fn key_in_flight_is_parked_until_done() {
        let queue = WorkQueue::default();
        queue.add(key("a")).await;
        let first = queue.get().await.unwrap();

        queue.add(key("a")).await;
        queue.add(key("a")).await;
        assert_eq!(queue.queued().await, 0);

        queue.done(&first).await;
        assert_eq!(queue.queued().await, 1);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_add() {
        let queue = Arc::new(WorkQueue::default());
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        queue.add(key("a")).await;
        assert_eq!(worker.await.unwrap(), Some(key("a")));
    }

    #[tokio::test]
    async fn shutdown_releases_workers() {
        let queue = Arc::new(WorkQueue::default());
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        queue.shutdown().await;
        assert_eq!(worker.await.unwrap(), None);

        queue.add(key("a")).await;
        assert_eq!(queue.queued().await, 0);
    }

    #[tokio::test]
    async fn failures_grow_until_forgotten() {
        let queue = Arc::new(WorkQueue::default());
        queue.add_rate_limited(key("a")).await;
        queue.add_rate_limited(key("a")).await;
        assert_eq!(queue.failures(&key("a")).await, 2);

        queue.forget(&key("a")).await;
        assert_eq!(queue.failures(&key("a")).await, 0);
    }

    #[tokio::test]
    async fn delayed_add_waits_for_the_delay() {
        let queue = Arc::new(WorkQueue::default());
        queue.add_after(key("a"), Duration::from_millis(20));
        assert_eq!(queue.queued().await, 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.queued().await, 1);
        assert_eq!(queue.failures(&key("a")).await, 0);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(backoff(1), Duration::from_millis(5));
        assert_eq!(backoff(2), Duration::from_millis(10));
        assert_eq!(backoff(5), Duration::from_millis(80));
        assert_eq!(backoff(30), MAX_DELAY);
        assert_eq!(backoff(200), MAX_DELAY);
    }
}
