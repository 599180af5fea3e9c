//! Availability probing for records with a backend.
//!
//! A record is available when, in order: its target service exists, exposes
//! the record's port, has a live endpoint for that port (skipped for
//! external names) and answers a discovery GET. The first failing check
//! decides the condition's reason. Conditions are only written when they
//! differ from the stored ones.

pub mod local;

use crate::catalog::{ServiceCatalog, TargetRef};
use crate::errors::Result;
use crate::metrics_defs::{AVAILABILITY_TRANSITIONS, UNAVAILABLE_SERVICES};
use crate::proxy::resolver::ServiceResolver;
use crate::proxy::transport::BackendTransport;
use crate::registry::ServiceRegistry;
use crate::store::{RecordStore, StoreError};
use crate::types::{
    BackendRef, Condition, ConditionStatus, ConditionType, RegistrationRecord, RegistrationSpec,
};
use crate::workqueue::{Backoff, WorkQueue};
use parking_lot::Mutex;
use shared::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const REASON_PASSED: &str = "Passed";
pub const REASON_SERVICE_NOT_FOUND: &str = "ServiceNotFound";
pub const REASON_SERVICE_PORT_ERROR: &str = "ServicePortError";
pub const REASON_MISSING_ENDPOINTS: &str = "MissingEndpoints";
pub const REASON_FAILED_DISCOVERY_CHECK: &str = "FailedDiscoveryCheck";

/// Writes `condition` into the record's status unless nothing would change.
pub(crate) async fn write_condition(
    store: &dyn RecordStore,
    record: &RegistrationRecord,
    condition: Condition,
) -> Result<()> {
    let status_label = match condition.status {
        ConditionStatus::True => "true",
        ConditionStatus::False => "false",
        ConditionStatus::Unknown => "unknown",
    };

    let mut status = record.status.clone();
    status.set_condition(condition);
    if status.same_state(&record.status) {
        return Ok(());
    }

    match store.update_status(&record.name, status).await {
        Ok(_) => {
            counter!(AVAILABILITY_TRANSITIONS, "status" => status_label).increment(1);
            Ok(())
        }
        // Deleted meanwhile; nothing left to report on.
        Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub attempts: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            timeout: Duration::from_secs(6),
            attempts: 5,
        }
    }
}

/// Client cached per record, rebuilt when the TLS settings change.
struct CachedTransport {
    insecure_skip_tls_verify: bool,
    ca_bundle: Option<String>,
    transport: std::result::Result<BackendTransport, String>,
}

pub struct AvailabilityController {
    registry: Arc<ServiceRegistry>,
    store: Arc<dyn RecordStore>,
    catalog: Arc<dyn ServiceCatalog>,
    resolver: Arc<dyn ServiceResolver>,
    probe: ProbeSettings,
    queue: WorkQueue<String>,
    /// Which records point at each target, so a catalog change only requeues
    /// the records it affects.
    targets: Mutex<HashMap<TargetRef, HashSet<String>>>,
    transports: Mutex<HashMap<String, CachedTransport>>,
    unavailable: Mutex<HashSet<String>>,
}

impl AvailabilityController {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        store: Arc<dyn RecordStore>,
        catalog: Arc<dyn ServiceCatalog>,
        resolver: Arc<dyn ServiceResolver>,
        probe: ProbeSettings,
        backoff: Backoff,
    ) -> Self {
        AvailabilityController {
            registry,
            store,
            catalog,
            resolver,
            probe,
            queue: WorkQueue::new("availability", backoff),
            targets: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(HashSet::new()),
        }
    }

    fn track(&self, name: &str, backend: Option<&BackendRef>) {
        let mut targets = self.targets.lock();
        for names in targets.values_mut() {
            names.remove(name);
        }
        targets.retain(|_, names| !names.is_empty());
        if let Some(backend) = backend {
            targets
                .entry(TargetRef::new(&backend.namespace, &backend.name))
                .or_default()
                .insert(name.to_string());
        }
    }

    fn affected_by(&self, target: &TargetRef) -> Vec<String> {
        self.targets
            .lock()
            .get(target)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn forget_record(&self, name: &str) {
        self.track(name, None);
        self.transports.lock().remove(name);
        self.set_unavailable(name, false);
    }

    fn set_unavailable(&self, name: &str, unavailable: bool) {
        let mut set = self.unavailable.lock();
        if unavailable {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
        gauge!(UNAVAILABLE_SERVICES).set(set.len() as f64);
    }

    fn client_for(&self, name: &str, spec: &RegistrationSpec) -> std::result::Result<reqwest::Client, String> {
        let mut transports = self.transports.lock();
        let stale = transports.get(name).is_none_or(|cached| {
            cached.insecure_skip_tls_verify != spec.insecure_skip_tls_verify
                || cached.ca_bundle != spec.ca_bundle
        });
        if stale {
            transports.insert(
                name.to_string(),
                CachedTransport {
                    insecure_skip_tls_verify: spec.insecure_skip_tls_verify,
                    ca_bundle: spec.ca_bundle.clone(),
                    transport: BackendTransport::build(spec),
                },
            );
        }
        match transports.get(name).map(|cached| &cached.transport) {
            Some(Ok(transport)) => Ok(transport.client().clone()),
            Some(Err(e)) => Err(e.clone()),
            None => Err("transport missing".to_string()),
        }
    }

    /// Runs the checks for `record`, returning the condition to store.
    async fn check(&self, record: &RegistrationRecord, backend: &BackendRef) -> Condition {
        let unavailable = |reason: &str, message: String| {
            Condition::new(ConditionType::Available, ConditionStatus::False, reason, message)
        };
        let target = TargetRef::new(&backend.namespace, &backend.name);
        let service_id = format!("service/{}/{}", backend.namespace, backend.name);

        let Some(service) = self.catalog.get_service(&target) else {
            return unavailable(
                REASON_SERVICE_NOT_FOUND,
                format!("{service_id} is not present"),
            );
        };

        if service.external_name.is_none() {
            let Some(port) = service.port(backend.port) else {
                return unavailable(
                    REASON_SERVICE_PORT_ERROR,
                    format!("{service_id} is not listening on port {}", backend.port),
                );
            };

            let has_endpoint = self
                .catalog
                .get_endpoints(&target)
                .is_some_and(|endpoints| endpoints.address_for(&port.name).is_some());
            if !has_endpoint {
                return unavailable(
                    REASON_MISSING_ENDPOINTS,
                    format!(
                        "endpoints for {service_id} have no addresses with port name {:?}",
                        port.name
                    ),
                );
            }
        }

        let location = match self
            .resolver
            .resolve(&backend.namespace, &backend.name, backend.port)
        {
            Ok(location) => location,
            Err(e) => {
                return unavailable(REASON_FAILED_DISCOVERY_CHECK, format!("{service_id}: {e}"));
            }
        };
        let client = match self.client_for(&record.name, &record.spec) {
            Ok(client) => client,
            Err(e) => {
                return unavailable(REASON_FAILED_DISCOVERY_CHECK, format!("{service_id}: {e}"));
            }
        };

        match probe(&client, &location, &self.probe).await {
            Ok(()) => Condition::new(
                ConditionType::Available,
                ConditionStatus::True,
                REASON_PASSED,
                "all checks passed",
            ),
            Err(e) => unavailable(
                REASON_FAILED_DISCOVERY_CHECK,
                format!("failing or missing response from {location}: {e}"),
            ),
        }
    }

    pub(crate) async fn sync(&self, name: &str) -> Result<()> {
        let Some(record) = self.registry.get(name) else {
            self.forget_record(name);
            return Ok(());
        };
        let Some(backend) = record.spec.backend.clone() else {
            self.forget_record(name);
            return Ok(());
        };
        self.track(name, Some(&backend));

        let condition = self.check(&record, &backend).await;
        let available = condition.status == ConditionStatus::True;
        if !available {
            tracing::info!(
                name,
                reason = %condition.reason,
                message = %condition.message,
                "Record unavailable"
            );
        }
        self.set_unavailable(name, !available);
        write_condition(self.store.as_ref(), &record, condition).await
    }

    pub fn enqueue(&self, name: &str) {
        self.queue.add(name.to_string());
    }

    pub async fn run(self: Arc<Self>, workers: usize, resync_interval: Duration, shutdown: CancellationToken) {
        let events = self.registry.subscribe();
        let mut catalog_changes = self.catalog.subscribe();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = self.registry.wait_for_sync() => {}
        }
        for record in self.registry.list() {
            self.enqueue(&record.name);
        }

        let mut background = JoinSet::new();

        {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            background.spawn(async move {
                let registry = controller.registry.clone();
                registry
                    .follow(events, shutdown, |event| match event {
                        Some(event) => controller.enqueue(event.name()),
                        None => {
                            for record in controller.registry.list() {
                                controller.enqueue(&record.name);
                            }
                        }
                    })
                    .await;
            });
        }

        {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            background.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        change = catalog_changes.recv() => match change {
                            Ok(target) => {
                                for name in controller.affected_by(&target) {
                                    controller.enqueue(&name);
                                }
                            }
                            Err(RecvError::Lagged(_)) => {
                                for record in controller.registry.list() {
                                    controller.enqueue(&record.name);
                                }
                            }
                            Err(RecvError::Closed) => return,
                        }
                    }
                }
            });
        }

        {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            background.spawn(async move {
                let mut ticker = tokio::time::interval(resync_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = ticker.tick() => {
                            for record in controller.registry.list() {
                                controller.enqueue(&record.name);
                            }
                        }
                    }
                }
            });
        }

        let controller = self.clone();
        self.queue
            .run_workers(workers, shutdown, move |name: String| {
                let controller = controller.clone();
                async move {
                    match controller.sync(&name).await {
                        Ok(()) => controller.queue.forget(&name),
                        Err(e) => {
                            tracing::warn!(name, error = %e, "Failed to update availability");
                            controller.queue.add_rate_limited(name);
                        }
                    }
                }
            })
            .await;

        while background.join_next().await.is_some() {}
    }
}

/// GETs `/apis` on the backend with `attempts` parallel requests. Succeeds as
/// soon as one attempt gets a 2xx.
async fn probe(client: &reqwest::Client, location: &Url, settings: &ProbeSettings) -> std::result::Result<(), String> {
    let mut url = location.clone();
    url.set_path("/apis");

    let mut attempts = JoinSet::new();
    for _ in 0..settings.attempts.max(1) {
        let request = client.get(url.clone()).timeout(settings.timeout);
        attempts.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => Ok(()),
                Ok(response) => Err(format!("bad status from discovery endpoint: {}", response.status())),
                Err(e) => Err(e.to_string()),
            }
        });
    }

    let mut last_error = String::from("no probe attempts ran");
    while let Some(outcome) = attempts.join_next().await {
        match outcome {
            Ok(Ok(())) => {
                attempts.abort_all();
                return Ok(());
            }
            Ok(Err(e)) => last_error = e,
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(last_error)
}
