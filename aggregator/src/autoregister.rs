//! Keeps the gateway's own registrations in the store.
//!
//! Desired records come from configuration. A written record is labeled with
//! [`AUTO_MANAGED_LABEL`] so the controller can tell its records apart from
//! ones created by other writers. The decision for one name depends on
//! whether the record is desired (and with which policy), whether it exists
//! in the store (and how it is labeled), whether it already existed when the
//! controller started, and whether this name was already synced once:
//!
//! | current                          | not desired  | desired, once | desired, always |
//! |----------------------------------|--------------|---------------|-----------------|
//! | absent                           | -            | create once   | create          |
//! | not managed                      | -            | -             | -               |
//! | once, created after start        | -            | -             | -               |
//! | once, present at start           | delete once  | update once   | update once     |
//! | always                           | delete       | update once   | update          |

use crate::errors::Result;
use crate::metrics_defs::AUTOREGISTER_WRITES;
use crate::registry::ServiceRegistry;
use crate::store::{RecordStore, StoreError};
use crate::types::{RegistrationRecord, RegistrationSpec};
use crate::workqueue::{Backoff, WorkQueue};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use shared::counter;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const AUTO_MANAGED_LABEL: &str = "aggregator.io/automanaged";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Written once per controller lifetime, then left alone.
    Once,
    /// Continuously reconciled against the desired spec.
    Always,
}

impl SyncPolicy {
    pub fn label_value(self) -> &'static str {
        match self {
            SyncPolicy::Once => "onstart",
            SyncPolicy::Always => "true",
        }
    }

    fn of(record: &RegistrationRecord) -> Option<SyncPolicy> {
        match record.labels.get(AUTO_MANAGED_LABEL).map(String::as_str) {
            Some("onstart") => Some(SyncPolicy::Once),
            Some("true") => Some(SyncPolicy::Always),
            _ => None,
        }
    }
}

/// One configured registration.
#[derive(Debug, Clone, Deserialize)]
pub struct DesiredRegistration {
    #[serde(flatten)]
    pub spec: RegistrationSpec,
    pub sync: SyncPolicy,
}

impl DesiredRegistration {
    pub fn to_record(&self) -> RegistrationRecord {
        let mut record = RegistrationRecord::new(self.spec.clone());
        record
            .labels
            .insert(AUTO_MANAGED_LABEL.to_string(), self.sync.label_value().to_string());
        record
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Nothing,
    Create(RegistrationRecord),
    Update(RegistrationRecord),
    Delete { resource_version: u64 },
}

struct Observed<'a> {
    desired: Option<&'a DesiredRegistration>,
    current: Option<&'a RegistrationRecord>,
    present_at_start: bool,
    synced_once: bool,
}

fn decide(observed: Observed<'_>) -> Action {
    let Observed {
        desired,
        current,
        present_at_start,
        synced_once,
    } = observed;

    let Some(current) = current else {
        return match desired {
            None => Action::Nothing,
            Some(desired) if desired.sync == SyncPolicy::Once && synced_once => Action::Nothing,
            Some(desired) => Action::Create(desired.to_record()),
        };
    };
    if desired.is_some_and(|d| d.sync == SyncPolicy::Once) && synced_once {
        return Action::Nothing;
    }

    match SyncPolicy::of(current) {
        None => return Action::Nothing,
        Some(SyncPolicy::Once) if !present_at_start || synced_once => return Action::Nothing,
        Some(_) => {}
    }

    match desired {
        None => Action::Delete {
            resource_version: current.resource_version,
        },
        Some(desired) if desired.spec == current.spec => Action::Nothing,
        Some(desired) => {
            let mut updated = current.clone();
            updated.spec = desired.spec.clone();
            Action::Update(updated)
        }
    }
}

pub struct AutoRegisterController {
    registry: Arc<ServiceRegistry>,
    store: Arc<dyn RecordStore>,
    desired: RwLock<BTreeMap<String, DesiredRegistration>>,
    present_at_start: Mutex<HashSet<String>>,
    synced_once: Mutex<HashSet<String>>,
    queue: WorkQueue<String>,
}

impl AutoRegisterController {
    pub fn new(registry: Arc<ServiceRegistry>, store: Arc<dyn RecordStore>, backoff: Backoff) -> Self {
        AutoRegisterController {
            registry,
            store,
            desired: RwLock::new(BTreeMap::new()),
            present_at_start: Mutex::new(HashSet::new()),
            synced_once: Mutex::new(HashSet::new()),
            queue: WorkQueue::new("autoregister", backoff),
        }
    }

    pub fn add_desired(&self, desired: DesiredRegistration) {
        let name = desired.spec.group_version().record_name();
        self.desired.write().insert(name.clone(), desired);
        self.queue.add(name);
    }

    pub fn remove_desired(&self, name: &str) {
        self.desired.write().remove(name);
        self.queue.add(name.to_string());
    }

    pub(crate) async fn sync(&self, name: &str) -> Result<()> {
        let desired = self.desired.read().get(name).cloned();
        let current = self.registry.get(name);
        let synced_once = self.synced_once.lock().contains(name);

        let action = decide(Observed {
            desired: desired.as_ref(),
            current: current.as_ref(),
            present_at_start: self.present_at_start.lock().contains(name),
            synced_once,
        });

        // A record counts as synced only once the store holds what we decided.
        if self.apply(name, action).await? && !synced_once {
            self.synced_once.lock().insert(name.to_string());
        }
        Ok(())
    }

    /// Returns false when the write lost a race that the watch will replay.
    /// A stale resource version is returned as an error so the queue retries.
    async fn apply(&self, name: &str, action: Action) -> Result<bool> {
        let (label, outcome) = match action {
            Action::Nothing => return Ok(true),
            Action::Create(record) => {
                tracing::info!(name, "Creating managed record");
                ("create", self.store.create(record).await.map(|_| ()))
            }
            Action::Update(record) => {
                tracing::info!(name, "Updating managed record");
                ("update", self.store.update(record).await.map(|_| ()))
            }
            Action::Delete { resource_version } => {
                tracing::info!(name, "Deleting managed record");
                ("delete", self.store.delete(name, Some(resource_version)).await)
            }
        };

        match outcome {
            Ok(()) => {
                counter!(AUTOREGISTER_WRITES, "action" => label).increment(1);
                Ok(true)
            }
            Err(StoreError::AlreadyExists(_) | StoreError::NotFound(_)) => {
                tracing::debug!(name, action = label, "Managed record changed underneath us");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let events = self.registry.subscribe();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = self.registry.wait_for_sync() => {}
        }

        {
            let mut present = self.present_at_start.lock();
            for record in self.registry.list() {
                if SyncPolicy::of(&record) == Some(SyncPolicy::Once) {
                    present.insert(record.name.clone());
                }
                self.queue.add(record.name);
            }
        }
        for name in self.desired.read().keys() {
            self.queue.add(name.clone());
        }

        let watcher = {
            let controller = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let registry = controller.registry.clone();
                registry
                    .follow(events, shutdown, |event| match event {
                        Some(event) => controller.queue.add(event.name().to_string()),
                        None => {
                            for record in controller.registry.list() {
                                controller.queue.add(record.name);
                            }
                            for name in controller.desired.read().keys() {
                                controller.queue.add(name.clone());
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
                            tracing::warn!(name, error = %e, "Failed to sync managed record");
                            controller.queue.add_rate_limited(name);
                        }
                    }
                }
            })
            .await;

        let _ = watcher.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::tests::remote_record;
    use std::time::Duration;

    fn desired(priority: i32, sync: SyncPolicy) -> DesiredRegistration {
        DesiredRegistration {
            spec: remote_record("foo.io", "v1", priority, 10).spec,
            sync,
        }
    }

    fn current(priority: i32, label: Option<&str>) -> RegistrationRecord {
        let mut record = remote_record("foo.io", "v1", priority, 10);
        record.resource_version = 7;
        if let Some(label) = label {
            record
                .labels
                .insert(AUTO_MANAGED_LABEL.to_string(), label.to_string());
        }
        record
    }

    fn decide_for(
        desired: Option<&DesiredRegistration>,
        current: Option<&RegistrationRecord>,
        present_at_start: bool,
        synced_once: bool,
    ) -> Action {
        decide(Observed {
            desired,
            current,
            present_at_start,
            synced_once,
        })
    }

    #[test]
    fn test_decision_table() {
        let once = desired(10, SyncPolicy::Once);
        let always = desired(10, SyncPolicy::Always);
        let changed_always = desired(15, SyncPolicy::Always);

        // Absent
        assert_eq!(decide_for(None, None, false, false), Action::Nothing);
        assert!(matches!(decide_for(Some(&once), None, false, false), Action::Create(_)));
        assert_eq!(decide_for(Some(&once), None, false, true), Action::Nothing);
        assert!(matches!(decide_for(Some(&always), None, false, true), Action::Create(_)));

        // Not managed by us
        let foreign = current(1, None);
        assert_eq!(decide_for(None, Some(&foreign), true, false), Action::Nothing);
        assert_eq!(decide_for(Some(&changed_always), Some(&foreign), true, false), Action::Nothing);

        // Once-labeled but created after start
        let late = current(1, Some("onstart"));
        assert_eq!(decide_for(None, Some(&late), false, false), Action::Nothing);
        assert_eq!(decide_for(Some(&changed_always), Some(&late), false, false), Action::Nothing);

        // Once-labeled and present at start
        let early = current(1, Some("onstart"));
        assert_eq!(
            decide_for(None, Some(&early), true, false),
            Action::Delete { resource_version: 7 }
        );
        assert_eq!(decide_for(None, Some(&early), true, true), Action::Nothing);
        assert!(matches!(decide_for(Some(&changed_always), Some(&early), true, false), Action::Update(_)));
        assert_eq!(decide_for(Some(&changed_always), Some(&early), true, true), Action::Nothing);

        // Always-labeled
        let managed = current(1, Some("true"));
        assert_eq!(
            decide_for(None, Some(&managed), false, true),
            Action::Delete { resource_version: 7 }
        );
        assert!(matches!(decide_for(Some(&once), Some(&managed), false, false), Action::Update(_)));
        assert_eq!(decide_for(Some(&once), Some(&managed), false, true), Action::Nothing);
        let Action::Update(updated) = decide_for(Some(&changed_always), Some(&managed), false, true) else {
            panic!("expected an update");
        };
        assert_eq!(updated.spec.group_priority_minimum, 15);
        assert_eq!(updated.resource_version, 7);
        assert_eq!(updated.labels.get(AUTO_MANAGED_LABEL).unwrap(), "true");

        // Matching specs need no write
        let in_sync = current(10, Some("true"));
        assert_eq!(decide_for(Some(&always), Some(&in_sync), false, true), Action::Nothing);
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_once_policy_writes_once() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ServiceRegistry::new());
        let shutdown = CancellationToken::new();
        tokio::spawn(registry.clone().run(store.clone(), shutdown.clone()));

        let controller = Arc::new(AutoRegisterController::new(
            registry.clone(),
            store.clone(),
            Backoff::default(),
        ));
        controller.add_desired(desired(10, SyncPolicy::Once));
        tokio::spawn(controller.clone().run(shutdown.clone()));

        assert!(eventually(async || store.get("v1.foo.io").await.unwrap().is_some()).await);
        let created = store.get("v1.foo.io").await.unwrap().unwrap();
        assert_eq!(created.labels.get(AUTO_MANAGED_LABEL).unwrap(), "onstart");

        // A later change to the desired spec is ignored
        controller.add_desired(desired(15, SyncPolicy::Once));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let record = store.get("v1.foo.io").await.unwrap().unwrap();
        assert_eq!(record.spec.group_priority_minimum, 10);
        assert_eq!(record.resource_version, created.resource_version);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_always_policy_follows_desired_state() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ServiceRegistry::new());
        let shutdown = CancellationToken::new();
        tokio::spawn(registry.clone().run(store.clone(), shutdown.clone()));

        let controller = Arc::new(AutoRegisterController::new(
            registry.clone(),
            store.clone(),
            Backoff::default(),
        ));
        controller.add_desired(desired(10, SyncPolicy::Always));
        tokio::spawn(controller.clone().run(shutdown.clone()));

        assert!(eventually(async || store.get("v1.foo.io").await.unwrap().is_some()).await);

        controller.add_desired(desired(15, SyncPolicy::Always));
        assert!(
            eventually(async || {
                store
                    .get("v1.foo.io")
                    .await
                    .unwrap()
                    .is_some_and(|r| r.spec.group_priority_minimum == 15)
            })
            .await
        );

        controller.remove_desired("v1.foo.io");
        assert!(eventually(async || store.get("v1.foo.io").await.unwrap().is_none()).await);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_once_delete_retried_after_conflict() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ServiceRegistry::new());
        let mut record = remote_record("foo.io", "v1", 10, 10);
        record
            .labels
            .insert(AUTO_MANAGED_LABEL.to_string(), "onstart".to_string());
        store.create(record).await.unwrap();
        registry.replace(store.list().await.unwrap());

        let controller = AutoRegisterController::new(registry.clone(), store.clone(), Backoff::default());
        controller.present_at_start.lock().insert("v1.foo.io".to_string());

        // A status write lands after the registry's snapshot
        let snapshot = registry.get("v1.foo.io").unwrap();
        store
            .update_status("v1.foo.io", snapshot.status.clone())
            .await
            .unwrap();

        let stale = controller.sync("v1.foo.io").await;
        assert!(matches!(
            stale,
            Err(crate::errors::AggregatorError::Store(StoreError::Conflict(_)))
        ));
        assert!(!controller.synced_once.lock().contains("v1.foo.io"));
        assert!(store.get("v1.foo.io").await.unwrap().is_some());

        // Once the registry catches up the delete goes through
        registry.replace(store.list().await.unwrap());
        controller.sync("v1.foo.io").await.unwrap();
        assert!(store.get("v1.foo.io").await.unwrap().is_none());
        assert!(controller.synced_once.lock().contains("v1.foo.io"));
    }
}
