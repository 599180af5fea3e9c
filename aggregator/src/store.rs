//! Object store holding registration records.
//!
//! The gateway only needs a narrow CRUD + watch surface from its storage layer.
//! [`InMemoryStore`] implements it for single-process deployments and tests.

use crate::types::{RegistrationRecord, RegistrationStatus, ValidationError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::broadcast;

const WATCH_BUFFER: usize = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(String),
    #[error("record {0} already exists")]
    AlreadyExists(String),
    #[error("record {0} was modified concurrently")]
    Conflict(String),
    #[error("record rejected: {0}")]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(RegistrationRecord),
    Modified(RegistrationRecord),
    Deleted(RegistrationRecord),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list(&self) -> Result<Vec<RegistrationRecord>, StoreError>;

    async fn get(&self, name: &str) -> Result<Option<RegistrationRecord>, StoreError>;

    async fn create(&self, record: RegistrationRecord) -> Result<RegistrationRecord, StoreError>;

    /// Replaces labels and spec. Fails with `Conflict` when the record's
    /// resource version is stale; the stored status is kept.
    async fn update(&self, record: RegistrationRecord) -> Result<RegistrationRecord, StoreError>;

    /// Replaces only the status.
    async fn update_status(
        &self,
        name: &str,
        status: RegistrationStatus,
    ) -> Result<RegistrationRecord, StoreError>;

    /// Deletes a record, optionally only if it still has `resource_version`.
    async fn delete(&self, name: &str, resource_version: Option<u64>) -> Result<(), StoreError>;

    /// Events for every write made after this call. A lagged receiver must
    /// relist.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

pub struct InMemoryStore {
    records: RwLock<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, RegistrationRecord>,
    last_version: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore::with_capacity(WATCH_BUFFER)
    }

    /// A store whose watchers lag once more than `buffer` events are pending.
    pub fn with_capacity(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer);
        InMemoryStore {
            records: RwLock::new(Inner::default()),
            events,
        }
    }

    fn publish(&self, event: WatchEvent) {
        // No receivers is fine, nobody is watching yet.
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn list(&self) -> Result<Vec<RegistrationRecord>, StoreError> {
        Ok(self.records.read().records.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<RegistrationRecord>, StoreError> {
        Ok(self.records.read().records.get(name).cloned())
    }

    async fn create(
        &self,
        mut record: RegistrationRecord,
    ) -> Result<RegistrationRecord, StoreError> {
        record.validate()?;

        let created = {
            let mut guard = self.records.write();
            if guard.records.contains_key(&record.name) {
                return Err(StoreError::AlreadyExists(record.name));
            }
            guard.last_version += 1;
            record.resource_version = guard.last_version;
            guard.records.insert(record.name.clone(), record.clone());
            // Publish while holding the lock so watchers see writes in order.
            self.publish(WatchEvent::Added(record.clone()));
            record
        };

        Ok(created)
    }

    async fn update(&self, record: RegistrationRecord) -> Result<RegistrationRecord, StoreError> {
        record.validate()?;

        let mut guard = self.records.write();
        guard.last_version += 1;
        let next_version = guard.last_version;
        let existing = guard
            .records
            .get_mut(&record.name)
            .ok_or_else(|| StoreError::NotFound(record.name.clone()))?;

        if record.resource_version != 0 && record.resource_version != existing.resource_version {
            return Err(StoreError::Conflict(record.name));
        }

        existing.labels = record.labels;
        existing.spec = record.spec;
        existing.resource_version = next_version;
        let updated = existing.clone();
        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn update_status(
        &self,
        name: &str,
        status: RegistrationStatus,
    ) -> Result<RegistrationRecord, StoreError> {
        let mut guard = self.records.write();
        guard.last_version += 1;
        let next_version = guard.last_version;
        let existing = guard
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        existing.status = status;
        existing.resource_version = next_version;
        let updated = existing.clone();
        self.publish(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, name: &str, resource_version: Option<u64>) -> Result<(), StoreError> {
        let mut guard = self.records.write();
        let existing = guard
            .records
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        if let Some(expected) = resource_version
            && existing.resource_version != expected
        {
            return Err(StoreError::Conflict(name.to_string()));
        }

        if let Some(removed) = guard.records.remove(name) {
            self.publish(WatchEvent::Deleted(removed));
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::remote_record;
    use crate::types::{Condition, ConditionStatus, ConditionType};

    #[tokio::test]
    async fn test_crud_and_watch() {
        let store = InMemoryStore::new();
        let mut watch = store.watch();

        let created = store.create(remote_record("foo.io", "v1", 10, 10)).await.unwrap();
        assert_eq!(created.resource_version, 1);
        assert!(matches!(watch.recv().await.unwrap(), WatchEvent::Added(r) if r.name == "v1.foo.io"));

        assert_eq!(
            store.create(remote_record("foo.io", "v1", 10, 10)).await,
            Err(StoreError::AlreadyExists("v1.foo.io".to_string()))
        );

        let mut status = RegistrationStatus::default();
        status.set_condition(Condition::new(
            ConditionType::Available,
            ConditionStatus::True,
            "Passed",
            "all checks passed",
        ));
        let updated = store.update_status("v1.foo.io", status).await.unwrap();
        assert!(updated.is_available());
        assert!(matches!(watch.recv().await.unwrap(), WatchEvent::Modified(_)));

        // Spec updates keep the stored status
        let mut changed = updated.clone();
        changed.spec.version_priority = 20;
        let updated = store.update(changed).await.unwrap();
        assert_eq!(updated.spec.version_priority, 20);
        assert!(updated.is_available());

        store.delete("v1.foo.io", None).await.unwrap();
        assert!(store.get("v1.foo.io").await.unwrap().is_none());
        assert_eq!(
            store.delete("v1.foo.io", None).await,
            Err(StoreError::NotFound("v1.foo.io".to_string()))
        );
    }

    #[tokio::test]
    async fn test_invalid_records_rejected() {
        let store = InMemoryStore::new();
        let mut record = remote_record("foo.io", "v1", 10, 10);
        record.spec.group_priority_minimum = 0;
        assert!(matches!(
            store.create(record).await,
            Err(StoreError::Invalid(ValidationError::GroupPriorityOutOfRange(0)))
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_optimistic_concurrency() {
        let store = InMemoryStore::new();
        let created = store.create(remote_record("foo.io", "v1", 10, 10)).await.unwrap();

        let mut first = created.clone();
        first.spec.version_priority = 11;
        store.update(first).await.unwrap();

        let mut stale = created.clone();
        stale.spec.version_priority = 12;
        assert_eq!(
            store.update(stale).await,
            Err(StoreError::Conflict("v1.foo.io".to_string()))
        );
        assert_eq!(
            store.delete("v1.foo.io", Some(created.resource_version)).await,
            Err(StoreError::Conflict("v1.foo.io".to_string()))
        );
    }
}
