//! OpenAPI document aggregation.
//!
//! Every record contributes one leaf holding its backend's last document.
//! Reads fold the leaves into a merged document that is memoized on the ETags
//! of its inputs, so a refresh that returns the same ETag costs nothing.
//! Download failures only mark the affected leaf; its last good document stays
//! in the merge.

pub mod cache;
pub mod controller;
pub mod v2;
pub mod v3;

use crate::errors::{AggregatorError, Result};
use crate::http::{APPLICATION_JSON, compute_etag, get_with_timeout};
use crate::metrics_defs::OPENAPI_DOWNLOADS;
use crate::proxy::Proxyable;
use crate::types::RegistrationRecord;
use crate::version::{compare_groups, compare_versions};
use async_trait::async_trait;
use http::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use http::{HeaderMap, HeaderValue, StatusCode};
use hyper::body::Bytes;
use shared::counter;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Keeps per-record OpenAPI documents current.
#[async_trait]
pub trait SpecProvider: Send + Sync {
    /// Starts tracking `record` (or refreshes its snapshot), downloading through
    /// `handler`.
    fn add_or_update(&self, record: &RegistrationRecord, handler: Arc<dyn Proxyable>);

    fn remove(&self, name: &str);

    /// Downloads the record's current document. Errors are reported only here;
    /// merged reads keep serving the last good document.
    async fn update_spec(&self, name: &str) -> Result<()>;
}

/// A downloaded document and the bytes it was parsed from.
#[derive(Debug)]
pub struct SpecDocument {
    pub value: serde_json::Value,
    pub bytes: Bytes,
}

pub(crate) enum Download {
    NotModified,
    /// The backend does not publish this document.
    Missing,
    Fetched { document: SpecDocument, etag: String },
}

/// GETs `path` through `handler`, revalidating with `prior_etag`. Documents
/// without an ETag header get one computed from their content.
pub(crate) async fn download(
    handler: &dyn Proxyable,
    name: &str,
    path: &str,
    prior_etag: &str,
    timeout: Duration,
    version: &'static str,
) -> Result<Download> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
    if !prior_etag.is_empty()
        && let Ok(value) = HeaderValue::from_str(prior_etag)
    {
        headers.insert(IF_NONE_MATCH, value);
    }

    let response = match get_with_timeout(handler, name, path, headers, timeout).await {
        Ok(response) => response,
        Err(e) => {
            counter!(OPENAPI_DOWNLOADS, "version" => version, "result" => "error").increment(1);
            return Err(e);
        }
    };

    match response.status() {
        StatusCode::NOT_MODIFIED => {
            counter!(OPENAPI_DOWNLOADS, "version" => version, "result" => "not_modified")
                .increment(1);
            Ok(Download::NotModified)
        }
        StatusCode::NOT_FOUND => {
            counter!(OPENAPI_DOWNLOADS, "version" => version, "result" => "missing").increment(1);
            Ok(Download::Missing)
        }
        status if status.is_success() => {
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            let bytes = response.into_body();
            let value: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| AggregatorError::Decode(name.to_string(), e.to_string()))?;
            let etag = etag.unwrap_or_else(|| compute_etag(&bytes));
            counter!(OPENAPI_DOWNLOADS, "version" => version, "result" => "fetched").increment(1);
            Ok(Download::Fetched {
                document: SpecDocument { value, bytes },
                etag,
            })
        }
        status => {
            counter!(OPENAPI_DOWNLOADS, "version" => version, "result" => "error").increment(1);
            Err(AggregatorError::UpstreamStatus(name.to_string(), status))
        }
    }
}

/// Merge order: local records first, then by group and version priority.
pub(crate) fn merge_order(a: &RegistrationRecord, b: &RegistrationRecord) -> Ordering {
    b.is_local()
        .cmp(&a.is_local())
        .then_with(|| {
            compare_groups(
                a.spec.group_priority_minimum,
                &a.spec.group,
                b.spec.group_priority_minimum,
                &b.spec.group,
            )
        })
        .then_with(|| {
            compare_versions(
                a.spec.version_priority,
                &a.spec.version,
                b.spec.version_priority,
                &b.spec.version,
            )
        })
}
