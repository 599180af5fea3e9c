//! OpenAPI v3 aggregation. Documents are served per group version; the
//! merged node is the index at `/openapi/v3` linking every group version by
//! content hash.
//!
//! ```json
//! {"paths": {"apis/foo.io/v1": {"serverRelativeURL": "/openapi/v3/apis/foo.io/v1?hash=9F86D0"}}}
//! ```

use super::cache::{LeafNode, MergeNode};
use super::{Download, SpecDocument, SpecProvider, download};
use crate::errors::{AggregatorError, Result};
use crate::http::{APPLICATION_JSON, compute_etag, if_none_match, not_modified, text_response};
use crate::metrics_defs::OPENAPI_MERGES;
use crate::proxy::Proxyable;
use crate::types::RegistrationRecord;
use async_trait::async_trait;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, LOCATION};
use http::{HeaderMap, HeaderValue, StatusCode, Uri};
use hyper::Response;
use hyper::body::Bytes;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const V3_PREFIX: &str = "/openapi/v3";

const IMMUTABLE: &str = "public, immutable";
const REVALIDATE: &str = "no-cache, private";

struct SpecInfo {
    record: RegistrationRecord,
    handler: Arc<dyn Proxyable>,
    leaf: Arc<LeafNode<SpecDocument>>,
}

impl SpecInfo {
    /// Index key, e.g. `apis/foo.io/v1` or `api/v1`.
    fn path(&self) -> String {
        index_path(&self.record)
    }
}

fn index_path(record: &RegistrationRecord) -> String {
    record
        .group_version()
        .api_path()
        .trim_start_matches('/')
        .to_string()
}

fn hash_of(etag: &str) -> &str {
    etag.trim_start_matches("W/").trim_matches('"')
}

struct Index {
    bytes: Bytes,
    etag: String,
}

pub struct OpenApiV3Aggregator {
    specs: RwLock<HashMap<String, SpecInfo>>,
    index: MergeNode<Index>,
    fetch_timeout: Duration,
}

impl OpenApiV3Aggregator {
    pub fn new(fetch_timeout: Duration) -> Self {
        OpenApiV3Aggregator {
            specs: RwLock::new(HashMap::new()),
            index: MergeNode::new(),
            fetch_timeout,
        }
    }

    /// `(path, etag)` of every group version holding a document, sorted by path.
    fn published(&self) -> Vec<(String, String)> {
        let mut published: Vec<(String, String)> = self
            .specs
            .read()
            .values()
            .filter_map(|info| {
                let cached = info.leaf.get();
                cached.value.map(|_| (info.path(), cached.etag))
            })
            .collect();
        published.sort();
        published
    }

    fn serve_index(&self, headers: &HeaderMap) -> Response<Bytes> {
        let published = self.published();
        let index = self.index.get(published.clone(), || {
            let paths: Map<String, Value> = published
                .iter()
                .map(|(path, etag)| {
                    let url = format!("{V3_PREFIX}/{path}?hash={}", hash_of(etag));
                    (path.clone(), json!({"serverRelativeURL": url}))
                })
                .collect();
            let bytes = serde_json::to_vec(&json!({"paths": paths})).map_err(|e| e.to_string())?;
            counter!(OPENAPI_MERGES, "version" => "v3").increment(1);
            Ok(Index {
                etag: compute_etag(&bytes),
                bytes: Bytes::from(bytes),
            })
        });

        let Some(index) = index else {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "OpenAPI index not ready");
        };
        if if_none_match(headers, &index.etag) {
            return not_modified(&index.etag);
        }
        document_response(index.bytes.clone(), &index.etag, REVALIDATE)
    }

    fn serve_group_version(&self, path: &str, query: Option<&str>, headers: &HeaderMap) -> Response<Bytes> {
        let cached = {
            let specs = self.specs.read();
            let Some(info) = specs.values().find(|info| info.path() == path) else {
                return text_response(StatusCode::NOT_FOUND, "not found");
            };
            info.leaf.get()
        };

        let Some(document) = cached.value else {
            return match cached.error {
                Some(_) => text_response(StatusCode::SERVICE_UNAVAILABLE, "OpenAPI document unavailable"),
                None => text_response(StatusCode::NOT_FOUND, "not found"),
            };
        };

        let current = hash_of(&cached.etag);
        let requested = query.and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == "hash")
                .map(|(_, value)| value.into_owned())
        });

        let cache_control = match requested.as_deref() {
            Some(hash) if hash != current => {
                let mut response = Response::new(Bytes::new());
                *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
                if let Ok(location) =
                    HeaderValue::from_str(&format!("{V3_PREFIX}/{path}?hash={current}"))
                {
                    response.headers_mut().insert(LOCATION, location);
                }
                response
                    .headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static(REVALIDATE));
                return response;
            }
            Some(_) => IMMUTABLE,
            None => REVALIDATE,
        };

        if if_none_match(headers, &cached.etag) {
            return not_modified(&cached.etag);
        }
        document_response(document.bytes.clone(), &cached.etag, cache_control)
    }

    /// Serves `/openapi/v3` and `/openapi/v3/<group version path>`.
    pub fn serve(&self, uri: &Uri, headers: &HeaderMap) -> Response<Bytes> {
        let rest = uri
            .path()
            .strip_prefix(V3_PREFIX)
            .unwrap_or_default()
            .trim_matches('/');
        if rest.is_empty() {
            self.serve_index(headers)
        } else {
            self.serve_group_version(rest, uri.query(), headers)
        }
    }
}

fn document_response(body: Bytes, etag: &str, cache_control: &'static str) -> Response<Bytes> {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    if let Ok(etag) = HeaderValue::from_str(etag) {
        headers.insert(ETAG, etag);
    }
    response
}

#[async_trait]
impl SpecProvider for OpenApiV3Aggregator {
    fn add_or_update(&self, record: &RegistrationRecord, handler: Arc<dyn Proxyable>) {
        let mut specs = self.specs.write();
        let leaf = match specs.get(&record.name) {
            Some(existing) if existing.record.is_local() == record.is_local() => {
                existing.leaf.clone()
            }
            _ if record.is_local() => Arc::new(LeafNode::new_static()),
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
            self.index.invalidate();
        }
    }

    async fn update_spec(&self, name: &str) -> Result<()> {
        let (handler, leaf, path) = {
            let specs = self.specs.read();
            let info = specs
                .get(name)
                .ok_or_else(|| AggregatorError::UnknownRecord(name.to_string()))?;
            (info.handler.clone(), info.leaf.clone(), info.path())
        };
        if !leaf.needs_fetch() {
            return Ok(());
        }

        let prior = leaf.etag();
        let path = format!("{V3_PREFIX}/{path}");
        match download(handler.as_ref(), name, &path, &prior, self.fetch_timeout, "v3").await {
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
                tracing::warn!(name, error = %e, "Failed to download OpenAPI v3 document");
                leaf.set_error(e.to_string());
                Err(e)
            }
        }
    }
}
