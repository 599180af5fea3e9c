//! In-memory index of registration records fed by the store's watch.
//!
//! ```text
//!   RecordStore ──watch──▶ ServiceRegistry ──RegistryEvent──▶ controllers
//!        ▲                      │
//!        └──────── list ────────┘  (initial load and every resync)
//! ```
//!
//! An event is applied to the index before it is published, so a subscriber
//! that reacts to an event and calls [`ServiceRegistry::get`] always sees the
//! state the event describes.

use crate::store::{RecordStore, WatchEvent};
use crate::types::RegistrationRecord;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 1024;
const RELIST_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(RegistrationRecord),
    Updated {
        old: RegistrationRecord,
        new: RegistrationRecord,
    },
    Deleted(RegistrationRecord),
}

impl RegistryEvent {
    pub fn name(&self) -> &str {
        match self {
            RegistryEvent::Added(r) => &r.name,
            RegistryEvent::Updated { new, .. } => &new.name,
            RegistryEvent::Deleted(r) => &r.name,
        }
    }
}

pub struct ServiceRegistry {
    records: RwLock<BTreeMap<String, RegistrationRecord>>,
    events: broadcast::Sender<RegistryEvent>,
    synced: watch::Sender<bool>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (synced, _) = watch::channel(false);
        ServiceRegistry {
            records: RwLock::new(BTreeMap::new()),
            events,
            synced,
        }
    }

    /// Snapshot of every record, ordered by name.
    pub fn list(&self) -> Vec<RegistrationRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<RegistrationRecord> {
        self.records.read().get(name).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// True once the first full list from the store has been applied.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits until the first full list has been applied.
    pub async fn wait_for_sync(&self) {
        let mut synced = self.synced.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = synced.wait_for(|synced| *synced).await;
    }

    /// Follows the store until `shutdown` fires. A lagged or closed watch
    /// triggers a relist that reconciles the index with synthetic events.
    pub async fn run(self: Arc<Self>, store: Arc<dyn RecordStore>, shutdown: CancellationToken) {
        loop {
            // Subscribe before listing so no write between the two is missed.
            let mut watch = store.watch();
            match store.list().await {
                Ok(records) => {
                    self.replace(records);
                    self.synced.send_replace(true);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to list records, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(RELIST_BACKOFF) => continue,
                    }
                }
            }

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = watch.recv() => match event {
                        Ok(event) => self.apply(event),
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Record watch lagged, resyncing");
                            break;
                        }
                        Err(RecvError::Closed) => {
                            tracing::warn!("Record watch closed, resyncing");
                            tokio::select! {
                                _ = shutdown.cancelled() => return,
                                _ = tokio::time::sleep(RELIST_BACKOFF) => break,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Feeds events from `events` to `on_event` until `shutdown` fires. A
    /// subscriber that fell behind is handed `None` and must resync every
    /// name it cares about, including ones deleted meanwhile.
    pub async fn follow<F>(
        &self,
        mut events: broadcast::Receiver<RegistryEvent>,
        shutdown: CancellationToken,
        mut on_event: F,
    ) where
        F: FnMut(Option<RegistryEvent>),
    {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => on_event(Some(event)),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Registry subscriber lagged, resyncing");
                        on_event(None);
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }
    }

    fn publish(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    /// Applies one watch event. Events that do not change the index (replays
    /// after a relist) are dropped.
    pub(crate) fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(record) | WatchEvent::Modified(record) => self.upsert(record),
            WatchEvent::Deleted(record) => {
                let removed = self.records.write().remove(&record.name);
                if let Some(removed) = removed {
                    self.publish(RegistryEvent::Deleted(removed));
                }
            }
        }
    }

    fn upsert(&self, record: RegistrationRecord) {
        let previous = {
            let mut guard = self.records.write();
            if let Some(existing) = guard.get(&record.name)
                && (existing == &record || existing.resource_version > record.resource_version)
            {
                return;
            }
            guard.insert(record.name.clone(), record.clone())
        };

        match previous {
            Some(old) => self.publish(RegistryEvent::Updated { old, new: record }),
            None => self.publish(RegistryEvent::Added(record)),
        }
    }

    /// Replaces the whole index with a fresh list, emitting the difference.
    pub(crate) fn replace(&self, records: Vec<RegistrationRecord>) {
        let mut fresh: HashMap<String, RegistrationRecord> = records
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();

        let mut events = Vec::new();
        {
            let mut guard = self.records.write();
            let stale: Vec<String> = guard
                .keys()
                .filter(|name| !fresh.contains_key(*name))
                .cloned()
                .collect();
            for name in stale {
                if let Some(removed) = guard.remove(&name) {
                    events.push(RegistryEvent::Deleted(removed));
                }
            }

            for (name, record) in fresh.drain() {
                match guard.insert(name, record.clone()) {
                    Some(old) if old == record => {}
                    Some(old) => events.push(RegistryEvent::Updated { old, new: record }),
                    None => events.push(RegistryEvent::Added(record)),
                }
            }
        }

        for event in events {
            self.publish(event);
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        ServiceRegistry::new()
    }
}
