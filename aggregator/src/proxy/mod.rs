//! Per-record HTTP handler forwarding traffic to the record's backend.
//!
//! ```text
//!   request ─▶ ProxyHandler ──┬─ no entry yet / local ─▶ LocalHandler
//!                             ├─ not available ────────▶ 503
//!                             ├─ transport failed ─────▶ 500
//!                             └─ remote ─▶ ServiceResolver ─▶ backend
//!                                           (upgrades take a separate path)
//! ```
//!
//! The routing entry is rebuilt on every record update and swapped in
//! atomically; in-flight requests keep the entry they loaded.

pub mod identity;
pub mod resolver;
pub mod transport;

use crate::errors::{AggregatorError, Result};
use crate::http::{GatewayBody, boxed_response, collect_request, text_response};
use crate::local::LocalHandler;
use crate::metrics_defs::PROXY_ERRORS;
use crate::types::{BackendRef, RegistrationRecord};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::StreamExt;
use http::header::HOST;
use http::{StatusCode, Uri, Version};
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use identity::{UserInfo, apply_identity};
use resolver::ServiceResolver;
use shared::counter;
use shared::headers::{add_via_header, filter_hop_by_hop, is_upgrade_request};
use std::sync::Arc;
use transport::BackendTransport;
use url::Url;

const REDIRECT_REJECTED: &str =
    "the backend attempted to redirect this request, which is not permitted";

/// Buffered round trip through a record's routing decision. Used for
/// discovery and OpenAPI downloads, which never stream.
#[async_trait]
pub trait Proxyable: Send + Sync {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// Routing state derived from one version of a record.
#[derive(Debug)]
pub struct RoutingEntry {
    pub name: String,
    pub local: bool,
    pub backend: Option<BackendRef>,
    /// Construction failures are kept and reported on every request.
    pub transport: std::result::Result<BackendTransport, String>,
    pub service_available: bool,
}

impl RoutingEntry {
    pub fn from_record(record: &RegistrationRecord) -> Self {
        let transport = match record.spec.backend {
            Some(_) => BackendTransport::build(&record.spec),
            // Local records are served in-process and need no client.
            None => Err("local records have no transport".to_string()),
        };
        if let (Some(_), Err(e)) = (&record.spec.backend, &transport) {
            tracing::error!(name = %record.name, error = %e, "Failed to build backend transport");
        }

        RoutingEntry {
            name: record.name.clone(),
            local: record.is_local(),
            backend: record.spec.backend.clone(),
            transport,
            service_available: record.is_available(),
        }
    }
}

enum Target {
    Local,
    Unavailable,
    TransportFailed(String),
    Unresolvable(String),
    Remote { location: Url, client: reqwest::Client },
}

pub struct ProxyHandler {
    name: String,
    local: Arc<dyn LocalHandler>,
    resolver: Arc<dyn ServiceResolver>,
    reject_forwarding_redirects: bool,
    entry: ArcSwapOption<RoutingEntry>,
}

impl ProxyHandler {
    pub fn new(
        name: &str,
        local: Arc<dyn LocalHandler>,
        resolver: Arc<dyn ServiceResolver>,
        reject_forwarding_redirects: bool,
    ) -> Self {
        ProxyHandler {
            name: name.to_string(),
            local,
            resolver,
            reject_forwarding_redirects,
            entry: ArcSwapOption::empty(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the routing entry with one built from `record`.
    pub fn update(&self, record: &RegistrationRecord) {
        self.entry
            .store(Some(Arc::new(RoutingEntry::from_record(record))));
    }

    pub fn routing_entry(&self) -> Option<Arc<RoutingEntry>> {
        self.entry.load_full()
    }

    fn target(&self) -> Target {
        let Some(entry) = self.entry.load_full() else {
            return Target::Local;
        };
        if entry.local {
            return Target::Local;
        }
        if !entry.service_available {
            return Target::Unavailable;
        }
        let client = match &entry.transport {
            Ok(transport) => transport.client().clone(),
            Err(e) => return Target::TransportFailed(e.clone()),
        };
        let Some(backend) = &entry.backend else {
            return Target::Local;
        };
        match self
            .resolver
            .resolve(&backend.namespace, &backend.name, backend.port)
        {
            Ok(location) => Target::Remote { location, client },
            Err(e) => Target::Unresolvable(e.to_string()),
        }
    }

    /// Serves a client request, streaming the backend's response.
    pub async fn serve(&self, request: Request<Incoming>) -> Response<GatewayBody> {
        match self.target() {
            Target::Local => match collect_request(request).await {
                Ok(request) => boxed_response(self.local.serve(request).await),
                Err(e) => boxed_response(text_response(StatusCode::BAD_REQUEST, e.to_string())),
            },
            Target::Unavailable => boxed_response(service_unavailable()),
            Target::TransportFailed(e) => boxed_response(transport_failed(&self.name, &e)),
            Target::Unresolvable(e) => boxed_response(unresolvable(&self.name, &e)),
            Target::Remote { location, client } => {
                if is_upgrade_request(request.headers()) {
                    self.proxy_upgrade(request, &location, &client).await
                } else {
                    self.proxy_streaming(request, &location, &client).await
                }
            }
        }
    }

    async fn proxy_streaming(
        &self,
        request: Request<Incoming>,
        location: &Url,
        client: &reqwest::Client,
    ) -> Response<GatewayBody> {
        let request = match collect_request(request).await {
            Ok(request) => request,
            Err(e) => return boxed_response(text_response(StatusCode::BAD_REQUEST, e.to_string())),
        };

        let response = match self.send(request, location, client, false).await {
            Ok(response) => response,
            Err(e) => return boxed_response(unreachable(&self.name, &e)),
        };

        if self.reject_forwarding_redirects && response.status().is_redirection() {
            return boxed_response(redirect_rejected(&self.name));
        }

        let status = response.status();
        let version = response.version();
        let mut headers = response.headers().clone();
        filter_hop_by_hop(&mut headers, version);
        add_via_header(&mut headers, version);

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(Frame::data)
                .map_err(|e| AggregatorError::ResponseBodyError(e.to_string()))
        });
        let mut proxied = Response::new(StreamBody::new(stream).boxed_unsync());
        *proxied.status_mut() = status;
        *proxied.headers_mut() = headers;
        proxied
    }

    /// Protocol upgrades keep their Connection/Upgrade headers and, once both
    /// sides switched, the two sockets are spliced byte for byte.
    async fn proxy_upgrade(
        &self,
        mut request: Request<Incoming>,
        location: &Url,
        client: &reqwest::Client,
    ) -> Response<GatewayBody> {
        let client_upgrade = hyper::upgrade::on(&mut request);
        let (parts, _body) = request.into_parts();
        let request = Request::from_parts(parts, Bytes::new());

        let response = match self.send(request, location, client, true).await {
            Ok(response) => response,
            Err(e) => return boxed_response(unreachable(&self.name, &e)),
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            if self.reject_forwarding_redirects && response.status().is_redirection() {
                return boxed_response(redirect_rejected(&self.name));
            }
            // The backend declined the upgrade; relay its answer as is.
            let status = response.status();
            let headers = response.headers().clone();
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    let error = AggregatorError::ResponseBodyError(e.to_string());
                    return boxed_response(bad_gateway(&self.name, &error));
                }
            };
            let mut declined = Response::new(body);
            *declined.status_mut() = status;
            *declined.headers_mut() = headers;
            return boxed_response(declined);
        }

        let mut switched = Response::new(
            Empty::<Bytes>::new()
                .map_err(|e| match e {})
                .boxed_unsync(),
        );
        *switched.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *switched.headers_mut() = response.headers().clone();

        let name = self.name.clone();
        tokio::spawn(async move {
            let mut backend = match response.upgrade().await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!(name, error = %e, "Backend upgrade failed");
                    return;
                }
            };
            let mut client = match client_upgrade.await {
                Ok(upgraded) => TokioIo::new(upgraded),
                Err(e) => {
                    tracing::warn!(name, error = %e, "Client upgrade failed");
                    return;
                }
            };
            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                tracing::debug!(name, error = %e, "Upgraded connection closed");
            }
        });

        switched
    }

    /// Sends `request` to the backend at `location`, keeping path and query.
    async fn send(
        &self,
        request: Request<Bytes>,
        location: &Url,
        client: &reqwest::Client,
        upgrade: bool,
    ) -> Result<reqwest::Response> {
        let (mut parts, body) = request.into_parts();
        let url = backend_url(location, &parts.uri)?;

        let version = parts.version;
        if !upgrade {
            filter_hop_by_hop(&mut parts.headers, version);
        }
        add_via_header(&mut parts.headers, version);
        apply_identity(&mut parts.headers, parts.extensions.get::<UserInfo>());
        parts.headers.remove(HOST);

        let mut builder = client.request(parts.method, url).headers(parts.headers);
        if upgrade {
            builder = builder.version(Version::HTTP_11);
        } else {
            builder = builder.body(body);
        }

        builder.send().await.map_err(|e| {
            AggregatorError::UpstreamRequestFailed(location.to_string(), e.to_string())
        })
    }
}

#[async_trait]
impl Proxyable for ProxyHandler {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let (location, client) = match self.target() {
            Target::Local => return Ok(self.local.serve(request).await),
            Target::Unavailable => return Ok(service_unavailable()),
            Target::TransportFailed(e) => return Ok(transport_failed(&self.name, &e)),
            Target::Unresolvable(e) => return Ok(unresolvable(&self.name, &e)),
            Target::Remote { location, client } => (location, client),
        };

        let response = self.send(request, &location, &client, false).await?;
        if self.reject_forwarding_redirects && response.status().is_redirection() {
            return Ok(redirect_rejected(&self.name));
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| AggregatorError::ResponseBodyError(e.to_string()))?;

        let mut buffered = Response::new(body);
        *buffered.status_mut() = status;
        *buffered.headers_mut() = headers;
        Ok(buffered)
    }
}

fn backend_url(location: &Url, uri: &Uri) -> Result<Url> {
    let mut url = location.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    if url.cannot_be_a_base() {
        return Err(AggregatorError::InternalError(format!(
            "cannot proxy to {location}"
        )));
    }
    Ok(url)
}

fn service_unavailable() -> Response<Bytes> {
    text_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
}

fn transport_failed(name: &str, error: &str) -> Response<Bytes> {
    counter!(PROXY_ERRORS, "reason" => "transport").increment(1);
    tracing::error!(name, error, "Refusing request, backend transport is broken");
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "backend transport unavailable")
}

fn unresolvable(name: &str, error: &str) -> Response<Bytes> {
    counter!(PROXY_ERRORS, "reason" => "resolve").increment(1);
    tracing::warn!(name, error, "Could not resolve backend");
    service_unavailable()
}

fn unreachable(name: &str, error: &AggregatorError) -> Response<Bytes> {
    counter!(PROXY_ERRORS, "reason" => "unreachable").increment(1);
    tracing::warn!(name, error = %error, "Backend request failed");
    text_response(
        StatusCode::SERVICE_UNAVAILABLE,
        format!("error trying to reach service: {error}"),
    )
}

fn bad_gateway(name: &str, error: &AggregatorError) -> Response<Bytes> {
    counter!(PROXY_ERRORS, "reason" => "body").increment(1);
    tracing::warn!(name, error = %error, "Backend response was cut short");
    text_response(StatusCode::BAD_GATEWAY, "backend response was cut short")
}

fn redirect_rejected(name: &str) -> Response<Bytes> {
    counter!(PROXY_ERRORS, "reason" => "redirect").increment(1);
    tracing::warn!(name, "Rejected redirect from backend");
    text_response(StatusCode::FORBIDDEN, REDIRECT_REJECTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::GatewayBody;
    use crate::local::tests::EchoLocal;
    use crate::testutils::{FixedResolver, available, start_backend};
    use crate::types::tests::{local_record, remote_record};
    use http::header::{CONNECTION, UPGRADE};
    use http_body_util::BodyExt;
    use hyper::service::service_fn;
    use shared::http::serve_listener;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn body_string(response: Response<GatewayBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn handler(location: &str, reject_redirects: bool) -> ProxyHandler {
        ProxyHandler::new(
            "v1.foo.io",
            Arc::new(EchoLocal),
            Arc::new(FixedResolver::new(location)),
            reject_redirects,
        )
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_no_entry_delegates_locally() {
        let handler = handler("http://192.0.2.1:1", false);
        let response = handler.round_trip(get("/apis/foo.io/v1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"local /apis/foo.io/v1");
    }

    #[tokio::test]
    async fn test_local_record_delegates_locally() {
        let handler = handler("http://192.0.2.1:1", false);
        handler.update(&local_record("foo.io", "v1", 10, 10));
        let response = handler.round_trip(get("/apis/foo.io/v1")).await.unwrap();
        assert_eq!(response.body().as_ref(), b"local /apis/foo.io/v1");
    }

    #[tokio::test]
    async fn test_unavailable_returns_503_without_io() {
        // Resolving to a blackhole address would time out if it were dialed.
        let handler = handler("http://192.0.2.1:1", false);
        handler.update(&remote_record("foo.io", "v1", 10, 10));
        let response = handler.round_trip(get("/apis/foo.io/v1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_broken_transport_returns_500() {
        let handler = handler("http://192.0.2.1:1", false);
        let mut record = available(remote_record("foo.io", "v1", 10, 10));
        record.spec.insecure_skip_tls_verify = false;
        record.spec.ca_bundle = Some(
            "-----BEGIN CERTIFICATE-----\nnot base64\n-----END CERTIFICATE-----\n".to_string(),
        );
        handler.update(&record);
        assert!(handler.routing_entry().unwrap().transport.is_err());

        let response = handler.round_trip(get("/apis/foo.io/v1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_forwards_path_and_query() {
        let backend = start_backend().await;
        let handler = handler(&backend.url, false);
        handler.update(&available(remote_record("foo.io", "v1", 10, 10)));

        let response = handler
            .round_trip(get("/apis/foo.io/v1/widgets?limit=5"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.body().as_ref(),
            b"GET /apis/foo.io/v1/widgets?limit=5"
        );
    }

    #[tokio::test]
    async fn test_redirects_are_rejected_when_configured() {
        let backend = start_backend().await;

        let passthrough = handler(&backend.url, false);
        passthrough.update(&available(remote_record("foo.io", "v1", 10, 10)));
        let response = passthrough.round_trip(get("/redirect")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        let rejecting = handler(&backend.url, true);
        rejecting.update(&available(remote_record("foo.io", "v1", 10, 10)));
        let response = rejecting.round_trip(get("/redirect")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_identity_headers_forwarded() {
        let backend = start_backend().await;
        let handler = handler(&backend.url, false);
        handler.update(&available(remote_record("foo.io", "v1", 10, 10)));

        let mut request = get("/whoami");
        request
            .headers_mut()
            .insert("x-remote-user", "spoofed".parse().unwrap());
        request.extensions_mut().insert(UserInfo {
            name: "alice".to_string(),
            groups: vec!["admins".to_string()],
            extra: Default::default(),
        });

        let response = handler.round_trip(request).await.unwrap();
        assert_eq!(response.body().as_ref(), b"alice|admins");
    }

    #[tokio::test]
    async fn test_update_swaps_entry() {
        let handler = handler("http://192.0.2.1:1", false);
        handler.update(&remote_record("foo.io", "v1", 10, 10));
        let before = handler.routing_entry().unwrap();
        assert!(!before.service_available);

        handler.update(&available(remote_record("foo.io", "v1", 10, 10)));
        let after = handler.routing_entry().unwrap();
        assert!(after.service_available);
        // Readers holding the old entry are unaffected
        assert!(!before.service_available);
    }

    #[test]
    fn test_backend_url() {
        let location = Url::parse("https://api.ns.svc:8443").unwrap();
        let uri: Uri = "/apis/foo.io/v1/widgets?watch=true".parse().unwrap();
        assert_eq!(
            backend_url(&location, &uri).unwrap().as_str(),
            "https://api.ns.svc:8443/apis/foo.io/v1/widgets?watch=true"
        );
        let uri: Uri = "/api".parse().unwrap();
        assert_eq!(
            backend_url(&location, &uri).unwrap().as_str(),
            "https://api.ns.svc:8443/api"
        );
    }

    #[tokio::test]
    async fn test_serve_body_type() {
        let response: Response<GatewayBody> = boxed_response(service_unavailable());
        assert_eq!(body_string(response).await, "service unavailable\n");
    }

    /// Serves `handler` on a loopback port the way the gateway does.
    async fn serve_handler(handler: ProxyHandler) -> String {
        let handler = Arc::new(handler);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let service = service_fn(move |request| {
            let handler = handler.clone();
            async move { Ok::<_, AggregatorError>(handler.serve(request).await) }
        });
        tokio::spawn(serve_listener(listener, service));
        url
    }

    fn upgrade_request(url: String) -> reqwest::RequestBuilder {
        reqwest::Client::new()
            .get(url)
            .version(Version::HTTP_11)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "echo")
    }

    #[tokio::test]
    async fn test_upgrade_splices_connections() {
        let backend = start_backend().await;
        let handler = handler(&backend.url, false);
        handler.update(&available(remote_record("foo.io", "v1", 10, 10)));
        let url = serve_handler(handler).await;

        let response = upgrade_request(format!("{url}/upgrade")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[UPGRADE], "echo");

        let mut stream = response.upgrade().await.unwrap();
        for message in [&b"ping"[..], &b"second frame"[..]] {
            stream.write_all(message).await.unwrap();
            let mut echoed = vec![0; message.len()];
            stream.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, message);
        }
    }

    #[tokio::test]
    async fn test_declined_upgrade_is_relayed() {
        let backend = start_backend().await;
        let handler = handler(&backend.url, false);
        handler.update(&available(remote_record("foo.io", "v1", 10, 10)));
        let url = serve_handler(handler).await;

        let response = upgrade_request(format!("{url}/no-upgrade")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.text().await.unwrap(), "upgrade not supported");
    }

    #[tokio::test]
    async fn test_declined_upgrade_with_truncated_body_is_502() {
        // Promises more body than it sends, then hangs up
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_url = format!("http://{}", backend.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = backend.accept().await.unwrap();
            let mut request = vec![0; 4096];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 100\r\n\r\nshort")
                .await
                .unwrap();
        });

        let handler = handler(&backend_url, false);
        handler.update(&available(remote_record("foo.io", "v1", 10, 10)));
        let url = serve_handler(handler).await;

        let response = upgrade_request(format!("{url}/upgrade")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
