use thiserror::Error;

/// Result type alias for aggregator operations
pub type Result<T, E = AggregatorError> = std::result::Result<T, E>;

/// Errors that can occur while reconciling, fetching or proxying
#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("invalid record: {0}")]
    Validation(#[from] crate::types::ValidationError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("could not resolve backend: {0}")]
    Resolve(#[from] crate::proxy::resolver::ResolveError),

    #[error("could not build transport for {0}: {1}")]
    Transport(String, String),

    #[error("upstream request failed for {0}: {1}")]
    UpstreamRequestFailed(String, String),

    #[error("upstream timeout for {0}")]
    UpstreamTimeout(String),

    #[error("unexpected status {1} from {0}")]
    UpstreamStatus(String, http::StatusCode),

    #[error("failed to read response body: {0}")]
    ResponseBodyError(String),

    #[error("failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("could not decode document from {0}: {1}")]
    Decode(String, String),

    #[error("no registration named {0}")]
    UnknownRecord(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
