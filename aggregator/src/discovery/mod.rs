//! Discovery aggregation.
//!
//! Each record's group version is synced into a merged view by fetching its
//! backend's aggregated discovery document. Records that share a backend share
//! one cached document: a record reuses the cache when it was filled after the
//! record was last marked dirty, so a burst of records on one backend costs a
//! single fetch.
//!
//! Lock order is `records` then `cache`. Neither is held across a fetch.

pub mod negotiation;
pub mod types;

use crate::errors::{AggregatorError, Result};
use crate::http::{
    APPLICATION_JSON, compute_etag, get_with_timeout, if_none_match, json_response, not_modified,
};
use crate::metrics_defs::{DISCOVERY_CACHE_HIT, DISCOVERY_FETCHES, DISCOVERY_STALE};
use crate::proxy::Proxyable;
use crate::types::{GroupVersion, RegistrationRecord};
use crate::version::{compare_groups, compare_versions};
use crate::workqueue::{Backoff, WorkQueue};
use http::header::{ACCEPT, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use http::{HeaderMap, HeaderValue, StatusCode};
use hyper::Response;
use hyper::body::Bytes;
use negotiation::{AggregatedVersion, DiscoveryFormat, aggregated_accept_header, format_of_content_type, negotiate};
use parking_lot::{Mutex, RwLock};
use shared::counter;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use types::{
    ApiGroup, ApiGroupDiscovery, ApiGroupDiscoveryList, ApiGroupList, ApiResourceList,
    ApiVersionDiscovery, ObjectMeta,
};

/// Registration surface of the discovery aggregator.
pub trait Discoverable: Send + Sync {
    /// Tracks `record` and marks it dirty so its next sync refetches.
    fn add_api_service(&self, record: &RegistrationRecord, handler: Arc<dyn Proxyable>);

    /// Drops the record's group version from the merged view immediately.
    fn remove_api_service(&self, name: &str);
}

/// Identity of the backend a record is served by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    Local,
    Remote {
        namespace: String,
        name: String,
        port: u16,
    },
}

impl ServiceKey {
    pub fn of(record: &RegistrationRecord) -> Self {
        match &record.spec.backend {
            Some(backend) => ServiceKey::Remote {
                namespace: backend.namespace.clone(),
                name: backend.name.clone(),
                port: backend.port,
            },
            None => ServiceKey::Local,
        }
    }
}

#[derive(Clone)]
struct GroupVersionInfo {
    last_marked_dirty: Instant,
    service_key: ServiceKey,
    group_priority: i32,
    version_priority: i32,
    handler: Arc<dyn Proxyable>,
}

struct CachedResult {
    discovery: HashMap<GroupVersion, ApiVersionDiscovery>,
    etag: Option<String>,
    last_updated: Instant,
}

struct MergedEntry {
    discovery: ApiVersionDiscovery,
    group_priority: i32,
    version_priority: i32,
}

struct RenderedDocument {
    bytes: Bytes,
    etag: String,
}

pub struct DiscoveryAggregator {
    records: Mutex<HashMap<String, GroupVersionInfo>>,
    cache: Mutex<HashMap<ServiceKey, CachedResult>>,
    merged: RwLock<HashMap<GroupVersion, MergedEntry>>,
    /// Rendered aggregated documents, dropped on every merged view change.
    rendered: Mutex<HashMap<AggregatedVersion, Arc<RenderedDocument>>>,
    queue: WorkQueue<String>,
    fetch_timeout: Duration,
}

impl DiscoveryAggregator {
    pub fn new(fetch_timeout: Duration, backoff: Backoff) -> Self {
        DiscoveryAggregator {
            records: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            merged: RwLock::new(HashMap::new()),
            rendered: Mutex::new(HashMap::new()),
            queue: WorkQueue::new("discovery", backoff),
            fetch_timeout,
        }
    }

    fn publish(&self, gv: GroupVersion, entry: Option<MergedEntry>) {
        {
            let mut merged = self.merged.write();
            match entry {
                Some(entry) => {
                    merged.insert(gv, entry);
                }
                None => {
                    if merged.remove(&gv).is_none() {
                        return;
                    }
                }
            }
        }
        self.rendered.lock().clear();
    }

    /// Drops cached documents of backends no record points at anymore.
    fn remove_unused_services(&self) {
        let live: HashSet<ServiceKey> = self
            .records
            .lock()
            .values()
            .map(|info| info.service_key.clone())
            .collect();
        self.cache.lock().retain(|key, _| live.contains(key));
    }

    /// Marks every record dirty so the next sync revalidates with the backend.
    fn mark_all_dirty(&self) -> Vec<String> {
        let now = Instant::now();
        let mut records = self.records.lock();
        for info in records.values_mut() {
            info.last_marked_dirty = now;
        }
        records.keys().cloned().collect()
    }

    /// Returns the discovery entry for `gv`. `None` means the backend answered
    /// but does not serve `gv`.
    async fn fetch_fresh_discovery(
        &self,
        gv: &GroupVersion,
        info: &GroupVersionInfo,
    ) -> Result<Option<ApiVersionDiscovery>> {
        let prior_etag = {
            let cache = self.cache.lock();
            match cache.get(&info.service_key) {
                Some(cached) if cached.last_updated > info.last_marked_dirty => {
                    counter!(DISCOVERY_CACHE_HIT).increment(1);
                    return Ok(cached.discovery.get(gv).cloned());
                }
                Some(cached) => cached.etag.clone(),
                None => None,
            }
        };

        // Stamped before the request: a record marked dirty while the fetch is
        // in flight must not be satisfied by its result.
        let started = Instant::now();
        let identifier = gv.record_name();

        let mut headers = HeaderMap::new();
        if let Ok(accept) = HeaderValue::from_str(&aggregated_accept_header()) {
            headers.insert(ACCEPT, accept);
        }
        if let Some(etag) = prior_etag.as_deref()
            && let Ok(value) = HeaderValue::from_str(etag)
        {
            headers.insert(IF_NONE_MATCH, value);
        }

        let aggregated = get_with_timeout(
            info.handler.as_ref(),
            &identifier,
            "/apis",
            headers,
            self.fetch_timeout,
        )
        .await;

        match aggregated {
            Ok(response) if response.status() == StatusCode::NOT_MODIFIED => {
                let mut cache = self.cache.lock();
                if let Some(cached) = cache.get_mut(&info.service_key) {
                    counter!(DISCOVERY_FETCHES, "result" => "not_modified").increment(1);
                    cached.last_updated = started;
                    return Ok(cached.discovery.get(gv).cloned());
                }
                // The entry was purged meanwhile; fall back to a per version fetch.
            }
            Ok(response) if response.status() == StatusCode::OK => {
                let is_aggregated = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(format_of_content_type)
                    .is_some_and(|format| matches!(format, DiscoveryFormat::Aggregated(_)));

                if is_aggregated {
                    match serde_json::from_slice::<ApiGroupDiscoveryList>(response.body()) {
                        Ok(list) => {
                            let etag = response
                                .headers()
                                .get(ETAG)
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string)
                                .unwrap_or_else(|| compute_etag(response.body()));
                            let discovery = list.into_version_map();
                            let entry = discovery.get(gv).cloned();
                            counter!(DISCOVERY_FETCHES, "result" => "aggregated").increment(1);
                            self.cache.lock().insert(
                                info.service_key.clone(),
                                CachedResult {
                                    discovery,
                                    etag: Some(etag),
                                    last_updated: started,
                                },
                            );
                            return Ok(entry);
                        }
                        Err(e) => {
                            tracing::warn!(name = %identifier, error = %e, "Malformed aggregated discovery document");
                        }
                    }
                }
            }
            Ok(response) => {
                tracing::debug!(name = %identifier, status = %response.status(), "Aggregated discovery not served");
            }
            Err(e) => {
                tracing::debug!(name = %identifier, error = %e, "Aggregated discovery fetch failed");
            }
        }

        // The backend cannot serve aggregated discovery right now.
        self.cache.lock().remove(&info.service_key);
        self.fetch_legacy_discovery(gv, info).await.map(Some)
    }

    async fn fetch_legacy_discovery(
        &self,
        gv: &GroupVersion,
        info: &GroupVersionInfo,
    ) -> Result<ApiVersionDiscovery> {
        let identifier = gv.record_name();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));

        let response = get_with_timeout(
            info.handler.as_ref(),
            &identifier,
            &gv.api_path(),
            headers,
            self.fetch_timeout,
        )
        .await
        .inspect_err(|_| {
            counter!(DISCOVERY_FETCHES, "result" => "error").increment(1);
        })?;

        if response.status() != StatusCode::OK {
            counter!(DISCOVERY_FETCHES, "result" => "error").increment(1);
            return Err(AggregatorError::UpstreamStatus(identifier, response.status()));
        }

        let list: ApiResourceList = serde_json::from_slice(response.body())
            .map_err(|e| AggregatorError::Decode(identifier.clone(), e.to_string()))?;
        counter!(DISCOVERY_FETCHES, "result" => "legacy").increment(1);
        Ok(ApiVersionDiscovery::from_resource_list(gv, &list))
    }

    /// Brings the merged view in line with record `name`. A failed fetch
    /// publishes a stale placeholder and returns the error for a retry.
    pub(crate) async fn sync_record(&self, name: &str) -> Result<()> {
        let Some(gv) = GroupVersion::from_record_name(name) else {
            return Ok(());
        };
        let Some(info) = self.records.lock().get(name).cloned() else {
            self.publish(gv, None);
            return Ok(());
        };

        let result = self.fetch_fresh_discovery(&gv, &info).await;

        // Removed while fetching: the removal already cleaned up.
        if !self.records.lock().contains_key(name) {
            return Ok(());
        }

        let entry = |discovery| MergedEntry {
            discovery,
            group_priority: info.group_priority,
            version_priority: info.version_priority,
        };
        match result {
            Ok(Some(discovery)) => {
                self.publish(gv, Some(entry(discovery)));
                Ok(())
            }
            Ok(None) => {
                tracing::warn!(name, "Backend discovery does not list this group version");
                let empty = ApiVersionDiscovery::empty(&gv.version);
                self.publish(gv, Some(entry(empty)));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "Discovery unavailable, publishing stale entry");
                counter!(DISCOVERY_STALE).increment(1);
                let stale = ApiVersionDiscovery::stale(&gv.version);
                self.publish(gv, Some(entry(stale)));
                Err(e)
            }
        }
    }

    fn render(&self, version: AggregatedVersion) -> Arc<RenderedDocument> {
        if let Some(rendered) = self.rendered.lock().get(&version) {
            return rendered.clone();
        }

        // Held until the document is stored so a concurrent change cannot be
        // overwritten by a render of the previous view.
        let merged = self.merged.read();
        let mut groups: BTreeMap<&str, Vec<&MergedEntry>> = BTreeMap::new();
        for (gv, entry) in merged.iter() {
            // The core group is discovered under /api.
            if !gv.group.is_empty() {
                groups.entry(gv.group.as_str()).or_default().push(entry);
            }
        }

        let mut ordered: Vec<(i32, &str, Vec<&MergedEntry>)> = groups
            .into_iter()
            .map(|(name, mut entries)| {
                entries.sort_by(|a, b| {
                    compare_versions(
                        a.version_priority,
                        &a.discovery.version,
                        b.version_priority,
                        &b.discovery.version,
                    )
                });
                let priority = entries.iter().map(|e| e.group_priority).max().unwrap_or(0);
                (priority, name, entries)
            })
            .collect();
        ordered.sort_by(|a, b| compare_groups(a.0, a.1, b.0, b.1));

        let items = ordered
            .into_iter()
            .map(|(_, name, entries)| ApiGroupDiscovery {
                metadata: ObjectMeta {
                    name: name.to_string(),
                },
                versions: entries.into_iter().map(|e| e.discovery.clone()).collect(),
            })
            .collect();
        let list = ApiGroupDiscoveryList::new(version.api_version(), items);

        let bytes = Bytes::from(serde_json::to_vec(&list).unwrap_or_default());
        let rendered = Arc::new(RenderedDocument {
            etag: compute_etag(&bytes),
            bytes,
        });
        self.rendered.lock().insert(version, rendered.clone());
        drop(merged);
        rendered
    }

    /// Serves `/apis` in the shape the client negotiated. The legacy shape is
    /// built from `records`.
    pub fn serve_apis(&self, headers: &HeaderMap, records: &[RegistrationRecord]) -> Response<Bytes> {
        match negotiate(headers) {
            DiscoveryFormat::Legacy => json_response(&legacy_group_list(records), APPLICATION_JSON),
            format @ DiscoveryFormat::Aggregated(version) => {
                let rendered = self.render(version);
                if if_none_match(headers, &rendered.etag) {
                    return not_modified(&rendered.etag);
                }
                let mut response = Response::new(rendered.bytes.clone());
                if let Ok(value) = HeaderValue::from_str(&format.content_type()) {
                    response.headers_mut().insert(CONTENT_TYPE, value);
                }
                if let Ok(value) = HeaderValue::from_str(&rendered.etag) {
                    response.headers_mut().insert(ETAG, value);
                }
                response
            }
        }
    }

    pub fn enqueue(&self, name: &str) {
        self.queue.add(name.to_string());
    }

    /// Syncs queued records with `workers` tasks and marks everything dirty
    /// every `resync_interval`.
    pub async fn run(self: Arc<Self>, workers: usize, resync_interval: Duration, shutdown: CancellationToken) {
        let resync = {
            let aggregator = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(resync_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = ticker.tick() => {
                            for name in aggregator.mark_all_dirty() {
                                aggregator.enqueue(&name);
                            }
                        }
                    }
                }
            })
        };

        let aggregator = self.clone();
        self.queue
            .run_workers(workers, shutdown, move |name: String| {
                let aggregator = aggregator.clone();
                async move {
                    match aggregator.sync_record(&name).await {
                        Ok(()) => aggregator.queue.forget(&name),
                        Err(_) => aggregator.queue.add_rate_limited(name),
                    }
                }
            })
            .await;

        let _ = resync.await;
    }
}

impl Discoverable for DiscoveryAggregator {
    fn add_api_service(&self, record: &RegistrationRecord, handler: Arc<dyn Proxyable>) {
        self.records.lock().insert(
            record.name.clone(),
            GroupVersionInfo {
                last_marked_dirty: Instant::now(),
                service_key: ServiceKey::of(record),
                group_priority: record.spec.group_priority_minimum,
                version_priority: record.spec.version_priority,
                handler,
            },
        );
        self.remove_unused_services();
        self.enqueue(&record.name);
    }

    fn remove_api_service(&self, name: &str) {
        self.records.lock().remove(name);
        if let Some(gv) = GroupVersion::from_record_name(name) {
            self.publish(gv, None);
        }
        self.remove_unused_services();
        self.enqueue(name);
    }
}

/// Groups of `records` ordered by priority, each listing its versions in
/// preference order.
fn ordered_groups(records: &[RegistrationRecord]) -> Vec<ApiGroup> {
    let mut groups: BTreeMap<&str, Vec<&RegistrationRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| !r.spec.group.is_empty()) {
        groups.entry(record.spec.group.as_str()).or_default().push(record);
    }

    let mut ordered: Vec<(i32, &str, Vec<&RegistrationRecord>)> = groups
        .into_iter()
        .map(|(name, mut members)| {
            members.sort_by(|a, b| {
                compare_versions(
                    a.spec.version_priority,
                    &a.spec.version,
                    b.spec.version_priority,
                    &b.spec.version,
                )
            });
            let priority = members
                .iter()
                .map(|r| r.spec.group_priority_minimum)
                .max()
                .unwrap_or(0);
            (priority, name, members)
        })
        .collect();
    ordered.sort_by(|a, b| compare_groups(a.0, a.1, b.0, b.1));

    ordered
        .into_iter()
        .map(|(_, name, members)| {
            ApiGroup::new(name, members.iter().map(|r| r.spec.version.clone()).collect())
        })
        .collect()
}

/// Legacy `/apis` document.
pub fn legacy_group_list(records: &[RegistrationRecord]) -> ApiGroupList {
    ApiGroupList::new(ordered_groups(records))
}

/// Legacy `/apis/<group>` document, or `None` when no record serves `group`.
pub fn legacy_group(records: &[RegistrationRecord], group: &str) -> Option<ApiGroup> {
    ordered_groups(records)
        .into_iter()
        .find(|g| g.name == group)
}
