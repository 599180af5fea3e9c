use crate::errors::{AggregatorError, Result};
use crate::proxy::Proxyable;
use http::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::timeout;

/// Body type of every response the gateway serves.
pub type GatewayBody = UnsyncBoxBody<Bytes, AggregatorError>;

pub const APPLICATION_JSON: &str = "application/json";

pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into())
        .map_err(|e| match e {})
        .boxed_unsync()
}

pub fn boxed_response(response: Response<Bytes>) -> Response<GatewayBody> {
    response.map(full_body)
}

pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(format!("{}\n", message.into())));
    *response.status_mut() = status;
    response
}

pub fn not_modified(etag: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    if let Ok(value) = HeaderValue::from_str(etag) {
        response.headers_mut().insert(ETAG, value);
    }
    response
}

/// Serializes `value` as a JSON response with the given content type.
pub fn json_response<T: Serialize>(value: &T, content_type: &str) -> Response<Bytes> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Bytes::from(body));
            if let Ok(value) = HeaderValue::from_str(content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to serialize response")
        }
    }
}

/// Strong ETag derived from the document bytes.
pub fn compute_etag(data: &[u8]) -> String {
    format!("\"{:X}\"", Sha256::digest(data))
}

/// True when the request's `If-None-Match` lists `etag` (or `*`).
pub fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|tag| tag.trim().trim_start_matches("W/"))
        .any(|tag| tag == "*" || tag == etag)
}

/// Reads the whole request body so the request can be replayed in-process.
pub async fn collect_request<B>(request: Request<B>) -> Result<Request<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = request.into_parts();
    let bytes = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| AggregatorError::RequestBodyError(e.to_string()))?;
    Ok(Request::from_parts(parts, bytes))
}

/// Issues a GET through `handler` and waits at most `timeout_after` for the
/// complete response.
pub async fn get_with_timeout(
    handler: &dyn Proxyable,
    identifier: &str,
    path: &str,
    headers: HeaderMap,
    timeout_after: Duration,
) -> Result<Response<Bytes>> {
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Bytes::new())
        .map_err(|e| AggregatorError::InternalError(format!("Failed to build request: {e}")))?;
    *request.headers_mut() = headers;

    timeout(timeout_after, handler.round_trip(request))
        .await
        .map_err(|_| AggregatorError::UpstreamTimeout(identifier.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_if_none_match() {
        let etag = compute_etag(b"doc");
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(etag, compute_etag(b"doc"));
        assert_ne!(etag, compute_etag(b"other"));

        let mut headers = HeaderMap::new();
        assert!(!if_none_match(&headers, &etag));

        headers.insert(
            IF_NONE_MATCH,
            HeaderValue::from_str(&format!("\"abc\", W/{etag}")).unwrap(),
        );
        assert!(if_none_match(&headers, &etag));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(if_none_match(&headers, &etag));
    }

    #[tokio::test]
    async fn test_collect_request() {
        let request = Request::builder()
            .uri("/apis")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();
        let collected = collect_request(request).await.unwrap();
        assert_eq!(collected.body().as_ref(), b"payload");
        assert_eq!(collected.uri().path(), "/apis");
    }
}
