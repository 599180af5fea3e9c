//! Rate-limited, de-duplicating work queue keyed by record name.
//!
//! A key is in at most one of three places: waiting in the queue, being
//! processed by a worker, or both "processing" and "dirty" when it was re-added
//! while a worker held it. In that last case it goes back to the queue only once
//! the worker calls [`WorkQueue::done`], so a key is never processed by two
//! workers at the same time.

use crate::metrics_defs::{WORKQUEUE_DEPTH, WORKQUEUE_RETRIES};
use parking_lot::Mutex;
use shared::{counter, gauge};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `failures` (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(32);
        self.base
            .checked_mul(2_u32.saturating_pow(exp))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    /// Earliest pending delayed add per key.
    scheduled: HashMap<K, Instant>,
    shutting_down: bool,
}

struct Inner<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        WorkQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: &'static str, backoff: Backoff) -> Self {
        WorkQueue {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    scheduled: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Queues `key` unless it is already waiting.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        gauge!(WORKQUEUE_DEPTH, "queue" => self.inner.name).set(state.queue.len() as f64);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Queues `key` once `delay` has elapsed. A key already scheduled to be
    /// added sooner keeps its earlier slot.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            match state.scheduled.get(&key) {
                Some(existing) if *existing <= ready_at => return,
                _ => {
                    state.scheduled.insert(key.clone(), ready_at);
                }
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at.into()).await;
            let current = {
                let mut state = queue.inner.state.lock();
                if state.scheduled.get(&key) == Some(&ready_at) {
                    state.scheduled.remove(&key);
                    true
                } else {
                    false
                }
            };
            // Otherwise a sooner schedule for this key already fired.
            if current {
                queue.add(key);
            }
        });
    }

    /// Queues `key` after a delay that doubles with every consecutive failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            self.inner.backoff.delay(*failures)
        };
        counter!(WORKQUEUE_RETRIES, "queue" => self.inner.name).increment(1);
        self.add_after(key, delay);
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    /// Every key returned must be handed back through [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    gauge!(WORKQUEUE_DEPTH, "queue" => self.inner.name)
                        .set(state.queue.len() as f64);
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers pick up the rest.
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as processed, requeueing it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops handing out keys. Pending `get` calls return `None`.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Runs `workers` tasks feeding keys to `process` until `shutdown` fires,
    /// then shuts the queue down and waits for in-flight keys to finish.
    /// Requeueing on failure is up to `process`.
    pub async fn run_workers<F, Fut>(&self, workers: usize, shutdown: CancellationToken, process: F)
    where
        F: Fn(K) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for _ in 0..workers.max(1) {
            let queue = self.clone();
            let process = process.clone();
            tasks.spawn(async move {
                while let Some(key) = queue.get().await {
                    process(key.clone()).await;
                    queue.done(&key);
                }
            });
        }

        shutdown.cancelled().await;
        self.shut_down();
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(
            "test",
            Backoff {
                base: Duration::from_millis(10),
                max: Duration::from_millis(50),
            },
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
        assert_eq!(backoff.delay(200), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_deduplicates_waiting_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        q.add("a".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_readd_while_processing_defers_until_done() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        q.add("a".to_string());
        q.add("a".to_string());
        // Not handed out while a worker holds it
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_rate_limited_requeue_and_forget() {
        let q = queue();
        q.add_rate_limited("a".to_string());
        q.add_rate_limited("a".to_string());
        assert_eq!(q.num_requeues(&"a".to_string()), 2);

        let key = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "a");
        q.forget(&key);
        q.done(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_run_workers_processes_until_shutdown() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let q = queue();
        let processed = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let runner = {
            let q = q.clone();
            let processed = processed.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                q.run_workers(2, shutdown, move |_key: String| {
                    let processed = processed.clone();
                    async move {
                        processed.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await
            })
        };

        for key in ["a", "b", "c"] {
            q.add(key.to_string());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn test_delayed_adds_collapse() {
        let q = queue();
        q.add_after("a".to_string(), Duration::from_millis(40));
        q.add_after("a".to_string(), Duration::from_millis(10));
        q.add_after("a".to_string(), Duration::from_millis(30));

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(q.len(), 1);
        let key = q.get().await.unwrap();
        q.done(&key);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        q.add("late".to_string());
        assert!(q.is_empty());
    }
}
