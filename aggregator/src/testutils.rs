//! Helpers shared by the unit tests of several modules.

use crate::errors::Result;
use crate::proxy::Proxyable;
use crate::proxy::identity::{REMOTE_GROUP, REMOTE_USER};
use crate::proxy::resolver::{ResolveError, ServiceResolver};
use crate::types::{Condition, ConditionStatus, ConditionType, RegistrationRecord};
use async_trait::async_trait;
use http::StatusCode;
use http::header::{CONNECTION, UPGRADE};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use url::Url;

/// Resolves every backend to the same location.
pub struct FixedResolver {
    location: String,
}

impl FixedResolver {
    pub fn new(location: &str) -> Self {
        FixedResolver {
            location: location.to_string(),
        }
    }
}

impl ServiceResolver for FixedResolver {
    fn resolve(&self, _namespace: &str, _name: &str, _port: u16) -> Result<Url, ResolveError> {
        Url::parse(&self.location).map_err(|e| ResolveError::InvalidUrl(e.to_string()))
    }
}

/// Marks a record as passing its availability checks.
pub fn available(mut record: RegistrationRecord) -> RegistrationRecord {
    record.status.set_condition(Condition::new(
        ConditionType::Available,
        ConditionStatus::True,
        "Passed",
        "all checks passed",
    ));
    record
}

pub struct TestBackend {
    pub url: String,
}

/// Echoes every byte written to an upgraded connection back to the client.
fn echo_upgraded(request: &mut Request<Incoming>) -> Response<Full<Bytes>> {
    let upgrade = hyper::upgrade::on(request);
    tokio::spawn(async move {
        if let Ok(upgraded) = upgrade.await {
            let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
    });
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "echo")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn backend_handler(mut request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = request.uri().path().to_string();
    let response = match path.as_str() {
        "/upgrade" if request.headers().contains_key(UPGRADE) => echo_upgraded(&mut request),
        "/no-upgrade" => Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::new(Bytes::from("upgrade not supported")))
            .unwrap(),
        "/redirect" => Response::builder()
            .status(StatusCode::FOUND)
            .header("location", "https://elsewhere.example/")
            .body(Full::new(Bytes::new()))
            .unwrap(),
        "/whoami" => {
            let header = |name: &str| {
                request
                    .headers()
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            let body = format!("{}|{}", header(REMOTE_USER), header(REMOTE_GROUP));
            Response::new(Full::new(Bytes::from(body)))
        }
        _ => {
            let query = request
                .uri()
                .query()
                .map(|q| format!("?{q}"))
                .unwrap_or_default();
            let body = format!("{} {}{}", request.method(), request.uri().path(), query);
            Response::new(Full::new(Bytes::from(body)))
        }
    };
    Ok(response)
}

/// Starts a plain HTTP backend on a random local port. `/redirect` answers
/// 302, `/whoami` echoes identity headers, `/upgrade` switches to a byte echo
/// and `/no-upgrade` refuses with 400. Everything else echoes the request line.
pub async fn start_backend() -> TestBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, service_fn(backend_handler))
                    .await;
            });
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    TestBackend {
        url: format!("http://127.0.0.1:{port}"),
    }
}

type Responder = dyn Fn(&Request<Bytes>) -> Result<Response<Bytes>> + Send + Sync;

/// In-process stand-in for a record's handler.
pub struct StubProxy {
    responder: Box<Responder>,
    calls: AtomicUsize,
}

impl StubProxy {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Request<Bytes>) -> Result<Response<Bytes>> + Send + Sync + 'static,
    {
        StubProxy {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Proxyable for StubProxy {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(&request)
    }
}

/// Response with a JSON body and optional content type / ETag.
pub fn json_reply(
    status: StatusCode,
    body: &serde_json::Value,
    content_type: Option<&str>,
    etag: Option<&str>,
) -> Response<Bytes> {
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header("content-type", content_type);
    }
    if let Some(etag) = etag {
        builder = builder.header("etag", etag);
    }
    builder
        .body(Bytes::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}
