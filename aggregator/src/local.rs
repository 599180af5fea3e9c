//! In-process handler for records without a backend, and the fallback for
//! every path no record claims.

use crate::discovery::negotiation::{DiscoveryFormat, negotiate};
use crate::discovery::types::{
    ApiGroup, ApiGroupDiscovery, ApiGroupDiscoveryList, ApiGroupList, ApiResource, ApiResourceList,
    ApiVersionDiscovery, ObjectMeta,
};
use crate::http::{APPLICATION_JSON, compute_etag, if_none_match, not_modified, text_response};
use crate::openapi::v2::{empty_v2, merge_documents};
use crate::types::GroupVersion;
use async_trait::async_trait;
use http::header::{CONTENT_TYPE, ETAG};
use http::{HeaderValue, Method, StatusCode};
use hyper::body::Bytes;
use hyper::{Request, Response};
use serde::Deserialize;
use serde_json::{Value, json};

#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn serve(&self, request: Request<Bytes>) -> Response<Bytes>;
}

/// A group version served by the gateway itself.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LocalApiGroup {
    /// Empty for the legacy core group served under `/api`.
    #[serde(default)]
    pub group: String,
    pub version: String,
    #[serde(default)]
    pub resources: Vec<ApiResource>,
    #[serde(default)]
    pub openapi_v2: Option<Value>,
    #[serde(default)]
    pub openapi_v3: Option<Value>,
}

impl LocalApiGroup {
    pub fn group_version(&self) -> GroupVersion {
        GroupVersion::new(&self.group, &self.version)
    }
}

/// Serves statically configured local groups. Documents are rendered once at
/// construction.
pub struct StaticApis {
    groups: Vec<LocalApiGroup>,
    openapi_v2: Bytes,
}

impl StaticApis {
    pub fn new(groups: Vec<LocalApiGroup>) -> Self {
        let documents: Vec<(String, Value)> = groups
            .iter()
            .filter_map(|g| {
                g.openapi_v2
                    .clone()
                    .map(|doc| (g.group_version().record_name(), doc))
            })
            .collect();
        let merged = if documents.is_empty() {
            empty_v2()
        } else {
            merge_documents(&documents)
        };

        StaticApis {
            groups,
            openapi_v2: Bytes::from(serde_json::to_vec(&merged).unwrap_or_default()),
        }
    }

    pub fn groups(&self) -> &[LocalApiGroup] {
        &self.groups
    }

    fn find(&self, group: &str, version: &str) -> Option<&LocalApiGroup> {
        self.groups
            .iter()
            .find(|g| g.group == group && g.version == version)
    }

    /// Versions of `group` in configuration order.
    fn versions_of(&self, group: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|g| g.group == group)
            .map(|g| g.version.clone())
            .collect()
    }

    fn group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for group in self.groups.iter().filter(|g| !g.group.is_empty()) {
            if !names.contains(&group.group.as_str()) {
                names.push(&group.group);
            }
        }
        names
    }

    fn serve_apis(&self, request: &Request<Bytes>) -> Response<Bytes> {
        match negotiate(request.headers()) {
            DiscoveryFormat::Legacy => {
                let groups = self
                    .group_names()
                    .into_iter()
                    .map(|name| ApiGroup::new(name, self.versions_of(name)))
                    .collect();
                with_etag(request, APPLICATION_JSON, &ApiGroupList::new(groups))
            }
            format @ DiscoveryFormat::Aggregated(version) => {
                let items = self
                    .group_names()
                    .into_iter()
                    .map(|name| ApiGroupDiscovery {
                        metadata: ObjectMeta {
                            name: name.to_string(),
                        },
                        versions: self
                            .groups
                            .iter()
                            .filter(|g| g.group == name)
                            .map(|g| {
                                ApiVersionDiscovery::from_resource_list(
                                    &g.group_version(),
                                    &ApiResourceList::new(&g.group_version(), g.resources.clone()),
                                )
                            })
                            .collect(),
                    })
                    .collect();
                let list = ApiGroupDiscoveryList::new(version.api_version(), items);
                with_etag(request, &format.content_type(), &list)
            }
        }
    }

    fn serve_resources(&self, request: &Request<Bytes>, group: &str, version: &str) -> Response<Bytes> {
        match self.find(group, version) {
            Some(local) => with_etag(
                request,
                APPLICATION_JSON,
                &ApiResourceList::new(&local.group_version(), local.resources.clone()),
            ),
            None => not_found(),
        }
    }

    fn serve_v3(&self, request: &Request<Bytes>, group: &str, version: &str) -> Response<Bytes> {
        match self.find(group, version) {
            Some(local) => {
                let doc = local
                    .openapi_v3
                    .clone()
                    .unwrap_or_else(|| empty_v3(&local.group_version()));
                with_etag(request, APPLICATION_JSON, &doc)
            }
            None => not_found(),
        }
    }
}

#[async_trait]
impl LocalHandler for StaticApis {
    async fn serve(&self, request: Request<Bytes>) -> Response<Bytes> {
        if request.method() != Method::GET && request.method() != Method::HEAD {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let path = request.uri().path().trim_end_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').skip(1).collect();

        match segments.as_slice() {
            ["apis"] => self.serve_apis(&request),
            ["apis", group] => {
                let versions = self.versions_of(group);
                if versions.is_empty() {
                    return not_found();
                }
                with_etag(&request, APPLICATION_JSON, &ApiGroup::new(group, versions))
            }
            ["apis", group, version] => self.serve_resources(&request, group, version),
            ["api"] => {
                let versions = self.versions_of("");
                if versions.is_empty() {
                    return not_found();
                }
                let doc = json!({"kind": "APIVersions", "versions": versions});
                with_etag(&request, APPLICATION_JSON, &doc)
            }
            ["api", version] => self.serve_resources(&request, "", version),
            ["openapi", "v2"] => {
                let etag = compute_etag(&self.openapi_v2);
                if if_none_match(request.headers(), &etag) {
                    return not_modified(&etag);
                }
                document_response(self.openapi_v2.clone(), APPLICATION_JSON, &etag)
            }
            ["openapi", "v3", "apis", group, version] => self.serve_v3(&request, group, version),
            ["openapi", "v3", "api", version] => self.serve_v3(&request, "", version),
            _ => not_found(),
        }
    }
}

fn not_found() -> Response<Bytes> {
    text_response(StatusCode::NOT_FOUND, "not found")
}

fn empty_v3(gv: &GroupVersion) -> Value {
    json!({
        "openapi": "3.0.0",
        "info": {"title": gv.as_path_segment(), "version": gv.version},
        "paths": {},
        "components": {"schemas": {}},
    })
}

fn document_response(body: Bytes, content_type: &str, etag: &str) -> Response<Bytes> {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(ETAG, value);
    }
    response
}

fn with_etag<T: serde::Serialize>(
    request: &Request<Bytes>,
    content_type: &str,
    value: &T,
) -> Response<Bytes> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => Bytes::from(body),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize local document");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to serialize response");
        }
    };
    let etag = compute_etag(&body);
    if if_none_match(request.headers(), &etag) {
        return not_modified(&etag);
    }
    document_response(body, content_type, &etag)
}
