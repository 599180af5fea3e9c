//! Swagger 2.0 aggregation: one merged document served at `/openapi/v2`.

use super::cache::{LeafNode, MergeNode};
use super::{Download, SpecDocument, SpecProvider, download, merge_order};
use crate::errors::{AggregatorError, Result};
use crate::http::{APPLICATION_JSON, compute_etag, if_none_match, not_modified, text_response};
use crate::metrics_defs::OPENAPI_MERGES;
use crate::proxy::Proxyable;
use crate::types::RegistrationRecord;
use async_trait::async_trait;
use http::header::{CONTENT_TYPE, ETAG};
use http::{HeaderMap, HeaderValue, StatusCode};
use hyper::Response;
use hyper::body::Bytes;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use shared::counter;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub const V2_PATH: &str = "/openapi/v2";

const LOCAL_KEY: &str = "local";

pub(crate) fn empty_v2() -> Value {
    json!({
        "swagger": "2.0",
        "info": {"title": "Aggregated API", "version": "v0"},
        "paths": {},
        "definitions": {},
    })
}

fn section_mut<'a>(doc: &'a mut Value, key: &str) -> Option<&'a mut Map<String, Value>> {
    let entry = doc
        .as_object_mut()?
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry.as_object_mut()
}

fn take_section(doc: &mut Value, key: &str) -> Map<String, Value> {
    doc.get_mut(key)
        .and_then(Value::as_object_mut)
        .map(std::mem::take)
        .unwrap_or_default()
}

/// New names for entries of `section` that collide with a different
/// definition already merged.
fn conflict_renames(merged: &Value, doc: &Value, section: &str) -> BTreeMap<String, String> {
    let empty = Map::new();
    let existing = merged
        .get(section)
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let incoming = doc.get(section).and_then(Value::as_object).unwrap_or(&empty);

    let mut renames = BTreeMap::new();
    for (key, value) in incoming {
        if existing.get(key).is_none_or(|current| current == value) {
            continue;
        }
        let renamed = (2..)
            .map(|n| format!("{key}_v{n}"))
            .find(|candidate| {
                !existing.contains_key(candidate)
                    && !incoming.contains_key(candidate)
                    && !renames.values().any(|r| r == candidate)
            })
            .unwrap_or_else(|| key.clone());
        renames.insert(key.clone(), renamed);
    }
    renames
}

fn rewrite_refs(value: &mut Value, prefix: &str, renames: &BTreeMap<String, String>) {
    match value {
        Value::Object(object) => {
            for (key, child) in object.iter_mut() {
                if key == "$ref"
                    && let Value::String(reference) = child
                    && let Some(target) = reference.strip_prefix(prefix)
                    && let Some(renamed) = renames.get(target)
                {
                    *reference = format!("{prefix}{renamed}");
                    continue;
                }
                rewrite_refs(child, prefix, renames);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_refs(item, prefix, renames);
            }
        }
        _ => {}
    }
}

/// Merges documents in order. Paths keep the first document that declared
/// them; colliding definitions and parameters of later documents are renamed
/// with a `_vN` suffix and their references rewritten.
pub fn merge_documents(documents: &[(String, Value)]) -> Value {
    let mut merged = empty_v2();
    if let Some((_, first)) = documents.first()
        && first.is_object()
    {
        merged = first.clone();
    }
    for section in ["paths", "definitions"] {
        section_mut(&mut merged, section);
    }

    for (name, document) in documents.iter().skip(1) {
        let mut document = document.clone();
        for (section, prefix) in [
            ("definitions", "#/definitions/"),
            ("parameters", "#/parameters/"),
        ] {
            let renames = conflict_renames(&merged, &document, section);
            if !renames.is_empty() {
                tracing::debug!(name, section, ?renames, "Renaming conflicting OpenAPI entries");
                rewrite_refs(&mut document, prefix, &renames);
            }
            let incoming = take_section(&mut document, section);
            if incoming.is_empty() {
                continue;
            }
            let Some(target) = section_mut(&mut merged, section) else {
                continue;
            };
            for (key, value) in incoming {
                let key = renames.get(&key).cloned().unwrap_or(key);
                target.entry(key).or_insert(value);
            }
        }

        let paths = take_section(&mut document, "paths");
        if let Some(target) = section_mut(&mut merged, "paths") {
            for (path, item) in paths {
                if target.contains_key(&path) {
                    tracing::debug!(name, path, "Ignoring conflicting OpenAPI path");
                    continue;
                }
                target.insert(path, item);
            }
        }
    }

    merged
}

struct SpecInfo {
    record: RegistrationRecord,
    handler: Arc<dyn Proxyable>,
    leaf: Arc<LeafNode<SpecDocument>>,
}

struct MergedDocument {
    bytes: Bytes,
    etag: String,
}

pub struct OpenApiV2Aggregator {
    specs: RwLock<HashMap<String, SpecInfo>>,
    /// Shared by every local record; fetched once.
    local: Arc<LeafNode<SpecDocument>>,
    merged: MergeNode<MergedDocument>,
    fetch_timeout: Duration,
}

impl OpenApiV2Aggregator {
    pub fn new(fetch_timeout: Duration) -> Self {
        OpenApiV2Aggregator {
            specs: RwLock::new(HashMap::new()),
            local: Arc::new(LeafNode::new_static()),
            merged: MergeNode::new(),
            fetch_timeout,
        }
    }

    /// Leaves in merge order, local first and listed once.
    fn inputs(&self) -> Vec<(String, Arc<SpecDocument>, String)> {
        let specs = self.specs.read();
        let mut records: Vec<&SpecInfo> = specs.values().collect();
        records.sort_by(|a, b| merge_order(&a.record, &b.record));

        let mut inputs = Vec::with_capacity(records.len());
        let mut local_added = false;
        for info in records {
            let key = if info.record.is_local() {
                if local_added {
                    continue;
                }
                local_added = true;
                LOCAL_KEY.to_string()
            } else {
                info.record.name.clone()
            };
            let cached = info.leaf.get();
            if let Some(value) = cached.value {
                inputs.push((key, value, cached.etag));
            }
        }
        inputs
    }

    fn merged(&self) -> Option<Arc<MergedDocument>> {
        let inputs = self.inputs();
        let key = inputs
            .iter()
            .map(|(name, _, etag)| (name.clone(), etag.clone()))
            .collect();

        self.merged.get(key, || {
            let documents: Vec<(String, Value)> = inputs
                .iter()
                .map(|(name, document, _)| (name.clone(), document.value.clone()))
                .collect();
            let merged = merge_documents(&documents);
            let bytes = serde_json::to_vec(&merged).map_err(|e| e.to_string())?;
            counter!(OPENAPI_MERGES, "version" => "v2").increment(1);
            Ok(MergedDocument {
                etag: compute_etag(&bytes),
                bytes: Bytes::from(bytes),
            })
        })
    }

    /// Serves the merged document, honoring `If-None-Match`.
    pub fn serve(&self, headers: &HeaderMap) -> Response<Bytes> {
        let Some(merged) = self.merged() else {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "OpenAPI document not ready");
        };
        if if_none_match(headers, &merged.etag) {
            return not_modified(&merged.etag);
        }

        let mut response = Response::new(merged.bytes.clone());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        if let Ok(etag) = HeaderValue::from_str(&merged.etag) {
            response.headers_mut().insert(ETAG, etag);
        }
        response
    }
}

#[async_trait]
impl SpecProvider for OpenApiV2Aggregator {
    fn add_or_update(&self, record: &RegistrationRecord, handler: Arc<dyn Proxyable>) {
        let mut specs = self.specs.write();
        let leaf = match specs.get(&record.name) {
            Some(existing) if existing.record.is_local() == record.is_local() => {
                existing.leaf.clone()
            }
            _ if record.is_local() => self.local.clone(),
            _ => Arc::new(LeafNode::new()),
        };
        specs.insert(
            record.name.clone(),
            SpecInfo {
                record: record.clone(),
                handler,
                leaf,
            },
        );
    }

    fn remove(&self, name: &str) {
        if self.specs.write().remove(name).is_some() {
            self.merged.invalidate();
        }
    }

    async fn update_spec(&self, name: &str) -> Result<()> {
        let (handler, leaf) = {
            let specs = self.specs.read();
            let info = specs
                .get(name)
                .ok_or_else(|| AggregatorError::UnknownRecord(name.to_string()))?;
            (info.handler.clone(), info.leaf.clone())
        };
        if !leaf.needs_fetch() {
            return Ok(());
        }

        let prior = leaf.etag();
        match download(handler.as_ref(), name, V2_PATH, &prior, self.fetch_timeout, "v2").await {
            Ok(Download::NotModified) => Ok(()),
            Ok(Download::Missing) => {
                leaf.clear();
                Ok(())
            }
            Ok(Download::Fetched { document, etag }) => {
                if etag != prior {
                    leaf.set(document, etag);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "Failed to download OpenAPI v2 document");
                leaf.set_error(e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{StubProxy, json_reply};
    use crate::types::tests::{local_record, remote_record};
    use http::header::IF_NONE_MATCH;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn doc(path: &str, definition: &str, shape: &str) -> Value {
        json!({
            "swagger": "2.0",
            "paths": {path: {"get": {"responses": {"200": {"schema": {"$ref": format!("#/definitions/{definition}")}}}}}},
            "definitions": {definition: {"type": shape}},
        })
    }

    fn merged_value(aggregator: &OpenApiV2Aggregator) -> Value {
        serde_json::from_slice(aggregator.serve(&HeaderMap::new()).body()).unwrap()
    }

    #[test]
    fn test_merge_renames_conflicting_definitions() {
        let merged = merge_documents(&[
            ("a".to_string(), doc("/apis/a.io/v1/things", "Thing", "object")),
            ("b".to_string(), doc("/apis/b.io/v1/things", "Thing", "string")),
            ("c".to_string(), doc("/apis/a.io/v1/things", "Other", "object")),
        ]);

        assert_eq!(merged["definitions"]["Thing"]["type"], "object");
        assert_eq!(merged["definitions"]["Thing_v2"]["type"], "string");
        let reference = &merged["paths"]["/apis/b.io/v1/things"]["get"]["responses"]["200"]["schema"]["$ref"];
        assert_eq!(reference, "#/definitions/Thing_v2");

        // The conflicting path stays with the first document
        let reference = &merged["paths"]["/apis/a.io/v1/things"]["get"]["responses"]["200"]["schema"]["$ref"];
        assert_eq!(reference, "#/definitions/Thing");
        // Its definitions are still merged
        assert!(merged["definitions"].get("Other").is_some());
    }

    #[test]
    fn test_identical_definitions_not_renamed() {
        let merged = merge_documents(&[
            ("a".to_string(), doc("/a", "Status", "object")),
            ("b".to_string(), doc("/b", "Status", "object")),
        ]);
        assert!(merged["definitions"].get("Status_v2").is_none());
    }

    #[tokio::test]
    async fn test_merges_by_priority_with_local_first() {
        let aggregator = OpenApiV2Aggregator::new(Duration::from_secs(1));
        let local = local_record("core.io", "v1", 1, 1);
        let low = remote_record("low.io", "v1", 10, 10);
        let high = remote_record("high.io", "v1", 1000, 10);

        aggregator.add_or_update(
            &local,
            Arc::new(StubProxy::new(|_| {
                Ok(json_reply(StatusCode::OK, &doc("/api/v1/x", "Shared", "local"), None, None))
            })),
        );
        aggregator.add_or_update(
            &low,
            Arc::new(StubProxy::new(|_| {
                Ok(json_reply(StatusCode::OK, &doc("/low", "Shared", "low"), None, None))
            })),
        );
        aggregator.add_or_update(
            &high,
            Arc::new(StubProxy::new(|_| {
                Ok(json_reply(StatusCode::OK, &doc("/high", "Shared", "high"), None, None))
            })),
        );
        for name in [&local.name, &low.name, &high.name] {
            aggregator.update_spec(name).await.unwrap();
        }

        let merged = merged_value(&aggregator);
        assert_eq!(merged["definitions"]["Shared"]["type"], "local");
        assert_eq!(merged["definitions"]["Shared_v2"]["type"], "high");
        assert_eq!(merged["definitions"]["Shared_v3"]["type"], "low");
    }

    #[tokio::test]
    async fn test_failing_backend_keeps_last_document() {
        let aggregator = OpenApiV2Aggregator::new(Duration::from_secs(1));
        let healthy = Arc::new(AtomicBool::new(true));
        let flag = healthy.clone();
        let record = remote_record("foo.io", "v1", 10, 10);
        let other = remote_record("bar.io", "v1", 10, 10);

        aggregator.add_or_update(
            &record,
            Arc::new(StubProxy::new(move |_| {
                if flag.load(Ordering::SeqCst) {
                    Ok(json_reply(StatusCode::OK, &doc("/foo", "Foo", "object"), None, None))
                } else {
                    Err(AggregatorError::UpstreamTimeout("v1.foo.io".to_string()))
                }
            })),
        );
        aggregator.add_or_update(
            &other,
            Arc::new(StubProxy::new(|_| {
                Ok(json_reply(StatusCode::SERVICE_UNAVAILABLE, &json!({}), None, None))
            })),
        );

        aggregator.update_spec(&record.name).await.unwrap();
        // A backend that never answered is simply absent from the merge
        assert!(matches!(
            aggregator.update_spec(&other.name).await,
            Err(AggregatorError::UpstreamStatus(_, StatusCode::SERVICE_UNAVAILABLE))
        ));
        let before = aggregator.serve(&HeaderMap::new());

        healthy.store(false, Ordering::SeqCst);
        assert!(aggregator.update_spec(&record.name).await.is_err());
        let after = aggregator.serve(&HeaderMap::new());

        assert_eq!(after.status(), StatusCode::OK);
        assert_eq!(before.headers()[ETAG], after.headers()[ETAG]);
        let merged: Value = serde_json::from_slice(after.body()).unwrap();
        assert!(merged["paths"].get("/foo").is_some());
    }

    #[tokio::test]
    async fn test_revalidates_with_etag_and_serves_304() {
        let aggregator = OpenApiV2Aggregator::new(Duration::from_secs(1));
        let record = remote_record("foo.io", "v1", 10, 10);
        let stub = Arc::new(StubProxy::new(|request| {
            if request.headers().get(IF_NONE_MATCH).is_some_and(|v| v == "\"rev1\"") {
                return Ok(json_reply(StatusCode::NOT_MODIFIED, &json!(null), None, None));
            }
            Ok(json_reply(StatusCode::OK, &doc("/foo", "Foo", "object"), None, Some("\"rev1\"")))
        }));
        aggregator.add_or_update(&record, stub.clone());

        aggregator.update_spec(&record.name).await.unwrap();
        let first = aggregator.serve(&HeaderMap::new());
        aggregator.update_spec(&record.name).await.unwrap();
        assert_eq!(stub.calls(), 2);

        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, first.headers()[ETAG].clone());
        assert_eq!(aggregator.serve(&headers).status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_removed_record_leaves_merge() {
        let aggregator = OpenApiV2Aggregator::new(Duration::from_secs(1));
        let record = remote_record("foo.io", "v1", 10, 10);
        aggregator.add_or_update(
            &record,
            Arc::new(StubProxy::new(|_| {
                Ok(json_reply(StatusCode::OK, &doc("/foo", "Foo", "object"), None, None))
            })),
        );
        aggregator.update_spec(&record.name).await.unwrap();
        assert!(merged_value(&aggregator)["paths"].get("/foo").is_some());

        aggregator.remove(&record.name);
        assert!(merged_value(&aggregator)["paths"].get("/foo").is_none());
        assert!(matches!(
            aggregator.update_spec(&record.name).await,
            Err(AggregatorError::UnknownRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_local_document_fetched_once() {
        let aggregator = OpenApiV2Aggregator::new(Duration::from_secs(1));
        let stub = Arc::new(StubProxy::new(|_| {
            Ok(json_reply(StatusCode::OK, &doc("/api/v1/x", "X", "object"), None, None))
        }));
        let first = local_record("a.io", "v1", 1, 1);
        let second = local_record("b.io", "v1", 1, 1);
        aggregator.add_or_update(&first, stub.clone());
        aggregator.add_or_update(&second, stub.clone());

        aggregator.update_spec(&first.name).await.unwrap();
        aggregator.update_spec(&second.name).await.unwrap();
        aggregator.update_spec(&first.name).await.unwrap();
        assert_eq!(stub.calls(), 1);
        assert!(merged_value(&aggregator)["paths"].get("/api/v1/x").is_some());
    }
}
