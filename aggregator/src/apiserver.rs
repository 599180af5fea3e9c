//! The aggregated HTTP surface.
//!
//! [`Aggregator`] owns one [`ProxyHandler`] per record and keeps discovery and
//! OpenAPI aggregation in step with them. [`GatewayService`] routes incoming
//! requests:
//!
//! ```text
//!   /apis                  merged discovery
//!   /apis/<g>              group discovery, else local
//!   /apis/<g>/<v>/...      record "<v>.<g>", else local
//!   /api, /api/...         record "v1.", else local
//!   /openapi/v2            merged v2 document
//!   /openapi/v3[/...]      v3 index and per group-version documents
//!   anything else          local
//! ```

use crate::controller::HandlerManager;
use crate::discovery::{Discoverable, DiscoveryAggregator, legacy_group};
use crate::errors::{AggregatorError, Result};
use crate::http::{APPLICATION_JSON, GatewayBody, boxed_response, collect_request, json_response, text_response};
use crate::local::LocalHandler;
use crate::metrics_defs::REQUEST_DURATION;
use crate::openapi::controller::SpecSyncController;
use crate::openapi::v2::{OpenApiV2Aggregator, V2_PATH};
use crate::openapi::v3::{OpenApiV3Aggregator, V3_PREFIX};
use crate::openapi::SpecProvider;
use crate::proxy::resolver::ServiceResolver;
use crate::proxy::{ProxyHandler, Proxyable};
use crate::types::RegistrationRecord;
use crate::workqueue::Backoff;
use http::{Method, StatusCode};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response};
use parking_lot::RwLock;
use shared::histogram;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Record name of the legacy group served under `/api`.
const LEGACY_API_RECORD: &str = "v1.";

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub reject_forwarding_redirects: bool,
    pub discovery_fetch_timeout: Duration,
    pub openapi_fetch_timeout: Duration,
    pub openapi_refresh_interval: Duration,
    pub backoff: Backoff,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        AggregatorSettings {
            reject_forwarding_redirects: false,
            discovery_fetch_timeout: Duration::from_secs(5),
            openapi_fetch_timeout: Duration::from_secs(5),
            openapi_refresh_interval: Duration::from_secs(60),
            backoff: Backoff::default(),
        }
    }
}

pub struct Aggregator {
    local: Arc<dyn LocalHandler>,
    resolver: Arc<dyn ServiceResolver>,
    reject_forwarding_redirects: bool,
    handlers: RwLock<HashMap<String, Arc<ProxyHandler>>>,
    /// Records as last applied, which is what group discovery answers from.
    applied: RwLock<BTreeMap<String, RegistrationRecord>>,
    discovery: Arc<DiscoveryAggregator>,
    openapi_v2: Arc<OpenApiV2Aggregator>,
    openapi_v3: Arc<OpenApiV3Aggregator>,
    spec_sync: Arc<SpecSyncController>,
}

impl Aggregator {
    pub fn new(local: Arc<dyn LocalHandler>, resolver: Arc<dyn ServiceResolver>, settings: AggregatorSettings) -> Self {
        let openapi_v2 = Arc::new(OpenApiV2Aggregator::new(settings.openapi_fetch_timeout));
        let openapi_v3 = Arc::new(OpenApiV3Aggregator::new(settings.openapi_fetch_timeout));
        let spec_sync = Arc::new(SpecSyncController::new(
            vec![
                openapi_v2.clone() as Arc<dyn SpecProvider>,
                openapi_v3.clone() as Arc<dyn SpecProvider>,
            ],
            settings.openapi_refresh_interval,
            settings.backoff,
        ));

        Aggregator {
            local,
            resolver,
            reject_forwarding_redirects: settings.reject_forwarding_redirects,
            handlers: RwLock::new(HashMap::new()),
            applied: RwLock::new(BTreeMap::new()),
            discovery: Arc::new(DiscoveryAggregator::new(
                settings.discovery_fetch_timeout,
                settings.backoff,
            )),
            openapi_v2,
            openapi_v3,
            spec_sync,
        }
    }

    pub fn discovery(&self) -> Arc<DiscoveryAggregator> {
        self.discovery.clone()
    }

    pub fn spec_sync(&self) -> Arc<SpecSyncController> {
        self.spec_sync.clone()
    }

    fn handler(&self, name: &str) -> Option<Arc<ProxyHandler>> {
        self.handlers.read().get(name).cloned()
    }

    fn records(&self) -> Vec<RegistrationRecord> {
        self.applied.read().values().cloned().collect()
    }

    fn serves_group(&self, group: &str) -> bool {
        self.applied.read().values().any(|r| r.spec.group == group)
    }

    async fn serve_local(&self, request: Request<Incoming>) -> Response<GatewayBody> {
        match collect_request(request).await {
            Ok(request) => boxed_response(self.local.serve(request).await),
            Err(e) => boxed_response(text_response(StatusCode::BAD_REQUEST, e.to_string())),
        }
    }

    async fn route(&self, request: Request<Incoming>) -> (&'static str, Response<GatewayBody>) {
        let path = request.uri().path().to_string();
        let segments: Vec<&str> = path
            .trim_end_matches('/')
            .split('/')
            .skip(1)
            .collect();
        let readonly = matches!(*request.method(), Method::GET | Method::HEAD);

        match segments.as_slice() {
            ["apis"] if readonly => {
                let response = self.discovery.serve_apis(request.headers(), &self.records());
                ("discovery", boxed_response(response))
            }
            ["apis", group] if readonly => {
                match legacy_group(&self.records(), group) {
                    Some(group) => ("discovery", boxed_response(json_response(&group, APPLICATION_JSON))),
                    None => ("local", self.serve_local(request).await),
                }
            }
            ["apis", group, version, ..] => {
                match self.handler(&format!("{version}.{group}")) {
                    Some(handler) => ("proxy", handler.serve(request).await),
                    None => ("local", self.serve_local(request).await),
                }
            }
            ["api", ..] => match self.handler(LEGACY_API_RECORD) {
                Some(handler) => ("proxy", handler.serve(request).await),
                None => ("local", self.serve_local(request).await),
            },
            _ if path == V2_PATH && readonly => {
                ("openapi", boxed_response(self.openapi_v2.serve(request.headers())))
            }
            _ if (path == V3_PREFIX || path.starts_with(&format!("{V3_PREFIX}/"))) && readonly => {
                let response = self.openapi_v3.serve(request.uri(), request.headers());
                ("openapi", boxed_response(response))
            }
            _ => ("local", self.serve_local(request).await),
        }
    }
}

impl HandlerManager for Aggregator {
    fn add_or_update(&self, record: &RegistrationRecord) -> Result<()> {
        if let Err(e) = record.validate() {
            // Invalid records never reach the live state.
            tracing::warn!(name = %record.name, error = %e, "Ignoring invalid record");
            self.remove(&record.name);
            return Ok(());
        }

        let handler = {
            let mut handlers = self.handlers.write();
            handlers
                .entry(record.name.clone())
                .or_insert_with(|| {
                    Arc::new(ProxyHandler::new(
                        &record.name,
                        self.local.clone(),
                        self.resolver.clone(),
                        self.reject_forwarding_redirects,
                    ))
                })
                .clone()
        };
        handler.update(record);

        if !self.serves_group(&record.spec.group) {
            tracing::info!(group = %record.spec.group, "First version registered for group");
        }
        self.applied
            .write()
            .insert(record.name.clone(), record.clone());

        let proxyable = handler as Arc<dyn Proxyable>;
        self.discovery.add_api_service(record, proxyable.clone());
        self.openapi_v2.add_or_update(record, proxyable.clone());
        self.openapi_v3.add_or_update(record, proxyable);
        self.spec_sync.enqueue(&record.name);
        Ok(())
    }

    fn remove(&self, name: &str) {
        self.handlers.write().remove(name);
        let removed = self.applied.write().remove(name);
        if let Some(record) = removed
            && !self.serves_group(&record.spec.group)
        {
            tracing::info!(group = %record.spec.group, "Last version of group removed");
        }

        self.discovery.remove_api_service(name);
        self.openapi_v2.remove(name);
        self.openapi_v3.remove(name);
    }
}

/// Hyper service in front of an [`Aggregator`].
#[derive(Clone)]
pub struct GatewayService {
    aggregator: Arc<Aggregator>,
}

impl GatewayService {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        GatewayService { aggregator }
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<GatewayBody>;
    type Error = AggregatorError;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let aggregator = self.aggregator.clone();
        Box::pin(async move {
            let start = Instant::now();
            let (handler, response) = aggregator.route(request).await;
            histogram!(REQUEST_DURATION, "handler" => handler).record(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::tests::EchoLocal;
    use crate::testutils::{FixedResolver, TestBackend, available, start_backend};
    use crate::types::tests::{local_record, remote_record};
    use serde_json::Value;
    use shared::http::serve_listener;
    use tokio::net::TcpListener;

    struct Gateway {
        url: String,
        aggregator: Arc<Aggregator>,
    }

    async fn start_gateway(backend: &TestBackend) -> Gateway {
        let aggregator = Arc::new(Aggregator::new(
            Arc::new(EchoLocal),
            Arc::new(FixedResolver::new(&backend.url)),
            AggregatorSettings::default(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve_listener(listener, GatewayService::new(aggregator.clone())));
        Gateway { url, aggregator }
    }

    async fn get_json(url: String) -> Value {
        reqwest::get(url).await.unwrap().json().await.unwrap()
    }

    fn versions(group: &Value) -> Vec<&str> {
        group["versions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["version"].as_str().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_group_versions_follow_registrations() {
        let backend = start_backend().await;
        let gateway = start_gateway(&backend).await;

        let v1 = available(remote_record("foo", "v1", 11, 10));
        let v2 = available(remote_record("foo", "v2", 11, 20));
        gateway.aggregator.add_or_update(&v1).unwrap();
        gateway.aggregator.add_or_update(&v2).unwrap();

        let group = get_json(format!("{}/apis/foo", gateway.url)).await;
        assert_eq!(versions(&group), vec!["v2", "v1"]);
        assert_eq!(group["preferredVersion"]["version"], "v2");

        gateway.aggregator.remove(&v2.name);
        let group = get_json(format!("{}/apis/foo", gateway.url)).await;
        assert_eq!(versions(&group), vec!["v1"]);
        assert_eq!(group["preferredVersion"]["version"], "v1");

        // Group discovery comes from the applied records alone
        gateway.aggregator.remove(&v1.name);
        let body = reqwest::get(format!("{}/apis/foo", gateway.url))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "local /apis/foo");
    }

    #[tokio::test]
    async fn test_routes() {
        let backend = start_backend().await;
        let gateway = start_gateway(&backend).await;
        gateway
            .aggregator
            .add_or_update(&available(remote_record("foo", "v1", 11, 10)))
            .unwrap();
        gateway
            .aggregator
            .add_or_update(&local_record("", "v1", 18000, 1))
            .unwrap();

        // Registered group versions reach the backend with path and query intact
        let body = reqwest::get(format!("{}/apis/foo/v1/widgets?limit=2", gateway.url))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "GET /apis/foo/v1/widgets?limit=2");

        // Unknown group versions and groups fall through to the local handler
        let body = reqwest::get(format!("{}/apis/bar/v1/widgets", gateway.url))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "local /apis/bar/v1/widgets");
        let body = reqwest::get(format!("{}/apis/bar", gateway.url))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "local /apis/bar");

        // The legacy group is a local record here
        let body = reqwest::get(format!("{}/api/v1/namespaces", gateway.url))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "local /api/v1/namespaces");

        // Legacy /apis lists every named group
        let list = get_json(format!("{}/apis", gateway.url)).await;
        assert_eq!(list["kind"], "APIGroupList");
        let names: Vec<&str> = list["groups"]
            .as_array()
            .unwrap()
            .iter()
            .map(|g| g["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["foo"]);

        let response = reqwest::get(format!("{}/healthz", gateway.url)).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "local /healthz");
    }

    #[tokio::test]
    async fn test_unavailable_record_returns_503() {
        let backend = start_backend().await;
        let gateway = start_gateway(&backend).await;
        gateway
            .aggregator
            .add_or_update(&remote_record("foo", "v1", 11, 10))
            .unwrap();

        let response = reqwest::get(format!("{}/apis/foo/v1/widgets", gateway.url))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_invalid_record_not_installed() {
        let backend = start_backend().await;
        let gateway = start_gateway(&backend).await;
        let mut record = available(remote_record("foo", "v1", 11, 10));
        record.spec.group_priority_minimum = 0;
        gateway.aggregator.add_or_update(&record).unwrap();

        assert!(gateway.aggregator.handler(&record.name).is_none());
        let body = reqwest::get(format!("{}/apis/foo", gateway.url))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "local /apis/foo");
    }
}
