//! Periodically refreshes every record's OpenAPI documents.

use super::SpecProvider;
use crate::errors::AggregatorError;
use crate::workqueue::{Backoff, WorkQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct SpecSyncController {
    queue: WorkQueue<String>,
    providers: Vec<Arc<dyn SpecProvider>>,
    refresh_interval: Duration,
}

impl SpecSyncController {
    pub fn new(
        providers: Vec<Arc<dyn SpecProvider>>,
        refresh_interval: Duration,
        backoff: Backoff,
    ) -> Self {
        SpecSyncController {
            queue: WorkQueue::new("openapi", backoff),
            providers,
            refresh_interval,
        }
    }

    pub fn enqueue(&self, name: &str) {
        self.queue.add(name.to_string());
    }

    /// Refreshes `name` with every provider.
    async fn sync(&self, name: &str) -> SyncOutcome {
        let mut outcome = SyncOutcome::Synced;
        for provider in &self.providers {
            match provider.update_spec(name).await {
                Ok(()) => {}
                Err(AggregatorError::UnknownRecord(_)) => return SyncOutcome::Gone,
                Err(e) => {
                    tracing::debug!(name, error = %e, "OpenAPI refresh failed");
                    outcome = SyncOutcome::Failed;
                }
            }
        }
        outcome
    }

    pub async fn run(self: Arc<Self>, workers: usize, shutdown: CancellationToken) {
        let controller = self.clone();
        self.queue
            .run_workers(workers, shutdown, move |name: String| {
                let controller = controller.clone();
                async move {
                    match controller.sync(&name).await {
                        SyncOutcome::Synced => {
                            controller.queue.forget(&name);
                            controller.queue.add_after(name, controller.refresh_interval);
                        }
                        SyncOutcome::Failed => controller.queue.add_rate_limited(name),
                        SyncOutcome::Gone => controller.queue.forget(&name),
                    }
                }
            })
            .await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Synced,
    Failed,
    /// The record was removed; stop refreshing it.
    Gone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openapi::v2::OpenApiV2Aggregator;
    use crate::testutils::{StubProxy, json_reply};
    use crate::types::tests::remote_record;
    use http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_refreshes_and_retries() {
        let v2 = Arc::new(OpenApiV2Aggregator::new(Duration::from_secs(1)));
        let good = remote_record("good.io", "v1", 10, 10);
        let bad = remote_record("bad.io", "v1", 10, 10);
        let good_stub = Arc::new(StubProxy::new(|_| {
            Ok(json_reply(StatusCode::OK, &json!({"swagger": "2.0", "paths": {}}), None, None))
        }));
        let bad_stub = Arc::new(StubProxy::new(|_| {
            Ok(json_reply(StatusCode::BAD_GATEWAY, &json!({}), None, None))
        }));
        v2.add_or_update(&good, good_stub.clone());
        v2.add_or_update(&bad, bad_stub.clone());

        let controller = Arc::new(SpecSyncController::new(
            vec![v2.clone() as Arc<dyn SpecProvider>],
            Duration::from_millis(30),
            Backoff {
                base: Duration::from_millis(5),
                max: Duration::from_millis(10),
            },
        ));
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(controller.clone().run(2, shutdown.clone()));

        controller.enqueue(&good.name);
        controller.enqueue(&bad.name);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Periodic refresh for the healthy record, backoff retries for the other
        assert!(good_stub.calls() >= 2, "{}", good_stub.calls());
        assert!(bad_stub.calls() > good_stub.calls());

        // Removed records stop being refreshed
        v2.remove(&good.name);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls = good_stub.calls();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(good_stub.calls(), calls);

        shutdown.cancel();
        runner.await.unwrap();
    }
}
