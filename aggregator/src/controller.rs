//! Applies registry changes to the live routing and caching components.
//!
//! Mutations happen one record at a time from a single worker. Readers of
//! the routing state never wait on this controller.

use crate::errors::Result;
use crate::registry::ServiceRegistry;
use crate::types::RegistrationRecord;
use crate::workqueue::{Backoff, WorkQueue};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Something that owns per-record handlers and can install or drop them.
pub trait HandlerManager: Send + Sync {
    fn add_or_update(&self, record: &RegistrationRecord) -> Result<()>;

    fn remove(&self, name: &str);
}

pub struct ReconciliationController {
    registry: Arc<ServiceRegistry>,
    manager: Arc<dyn HandlerManager>,
    queue: WorkQueue<String>,
    /// Names currently installed in the manager.
    installed: Mutex<HashSet<String>>,
    ready: AtomicBool,
}

impl ReconciliationController {
    pub fn new(registry: Arc<ServiceRegistry>, manager: Arc<dyn HandlerManager>, backoff: Backoff) -> Self {
        ReconciliationController {
            registry,
            manager,
            queue: WorkQueue::new("reconcile", backoff),
            installed: Mutex::new(HashSet::new()),
            ready: AtomicBool::new(false),
        }
    }

    /// True once the initial snapshot has been applied.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn sync(&self, name: &str) -> Result<()> {
        match self.registry.get(name) {
            Some(record) => {
                self.manager.add_or_update(&record)?;
                self.installed.lock().insert(record.name);
            }
            None => {
                if self.installed.lock().remove(name) {
                    tracing::info!(name, "Removing handlers");
                }
                self.manager.remove(name);
            }
        }
        Ok(())
    }

    fn sync_or_retry(&self, name: String) {
        match self.sync(&name) {
            Ok(()) => self.queue.forget(&name),
            Err(e) => {
                tracing::warn!(name, error = %e, "Failed to reconcile record");
                self.queue.add_rate_limited(name);
            }
        }
    }

    fn enqueue_everything(&self) {
        let mut names: HashSet<String> = self.installed.lock().clone();
        names.extend(self.registry.list().into_iter().map(|record| record.name));
        for name in names {
            self.queue.add(name);
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let events = self.registry.subscribe();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = self.registry.wait_for_sync() => {}
        }

        let snapshot = self.registry.list();
        let total = snapshot.len();
        for record in snapshot {
            self.sync_or_retry(record.name);
        }
        self.ready.store(true, Ordering::Release);
        tracing::info!(records = total, "Initial records reconciled");

        let watcher = {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let registry = controller.registry.clone();
                registry
                    .follow(events, shutdown, |event| match event {
                        Some(event) => controller.queue.add(event.name().to_string()),
                        None => controller.enqueue_everything(),
                    })
                    .await;
            })
        };

        let controller = self.clone();
        self.queue
            .run_workers(1, shutdown, move |name: String| {
                let controller = controller.clone();
                async move { controller.sync_or_retry(name) }
            })
            .await;

        let _ = watcher.await;
    }
}
