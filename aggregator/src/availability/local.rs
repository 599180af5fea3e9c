//! Marks records without a backend as available. Nothing is probed.

use super::write_condition;
use crate::errors::Result;
use crate::registry::{RegistryEvent, ServiceRegistry};
use crate::store::RecordStore;
use crate::types::{Condition, ConditionStatus, ConditionType};
use crate::workqueue::{Backoff, WorkQueue};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const REASON_LOCAL: &str = "Local";

pub struct LocalAvailabilityController {
    registry: Arc<ServiceRegistry>,
    store: Arc<dyn RecordStore>,
    queue: WorkQueue<String>,
}

impl LocalAvailabilityController {
    pub fn new(registry: Arc<ServiceRegistry>, store: Arc<dyn RecordStore>, backoff: Backoff) -> Self {
        LocalAvailabilityController {
            registry,
            store,
            queue: WorkQueue::new("local_availability", backoff),
        }
    }

    pub(crate) async fn sync(&self, name: &str) -> Result<()> {
        let Some(record) = self.registry.get(name) else {
            return Ok(());
        };
        if !record.is_local() {
            return Ok(());
        }

        let condition = Condition::new(
            ConditionType::Available,
            ConditionStatus::True,
            REASON_LOCAL,
            "Local APIServices are always available",
        );
        write_condition(self.store.as_ref(), &record, condition).await
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let events = self.registry.subscribe();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = self.registry.wait_for_sync() => {}
        }
        for record in self.registry.list() {
            self.queue.add(record.name);
        }

        let watcher = {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let queue = controller.queue.clone();
                let registry = controller.registry.clone();
                controller
                    .registry
                    .follow(events, shutdown, |event| match event {
                        Some(RegistryEvent::Added(record) | RegistryEvent::Updated { new: record, .. }) => {
                            if record.is_local() {
                                queue.add(record.name);
                            }
                        }
                        Some(RegistryEvent::Deleted(_)) => {}
                        None => {
                            for record in registry.list() {
                                queue.add(record.name);
                            }
                        }
                    })
                    .await;
            })
        };

        let controller = self.clone();
        self.queue
            .run_workers(1, shutdown, move |name: String| {
                let controller = controller.clone();
                async move {
                    match controller.sync(&name).await {
                        Ok(()) => controller.queue.forget(&name),
                        Err(e) => {
                            tracing::warn!(name, error = %e, "Failed to mark local record available");
                            controller.queue.add_rate_limited(name);
                        }
                    }
                }
            })
            .await;

        let _ = watcher.await;
    }
}
