// =============================================================================
// Error taxonomy
// =============================================================================
//
// Library-level errors are `thiserror` enums; `main` and configuration
// loading work with `anyhow`.  `ApiError` is the only type that knows about
// HTTP status codes.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

// =============================================================================
// Provider errors
// =============================================================================

/// Failure modes of the market-data fetch capability.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by provider{}", fmt_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// Whether the updater may retry the request after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::ProviderUnavailable(_))
    }
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

// =============================================================================
// Record store errors
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no records stored for {ticker}")]
    NotFound { ticker: String },

    #[error("invalid ticker symbol: {0:?}")]
    InvalidTicker(String),

    #[error("record file I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialise records: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A persisted line that could not be parsed.  Loading skips such lines and
/// reports them instead of failing the whole store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct MalformedRecordLine {
    /// 1-based line number in the record file.
    pub line: usize,
    pub reason: String,
}

// =============================================================================
// Update errors
// =============================================================================

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("an update cycle is already running")]
    ConcurrentUpdateRejected,

    #[error("fetch failed: {source}")]
    Fetch {
        ticker: String,
        #[source]
        source: FetchError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// HTTP API errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { ticker } => Self::NotFound(format!("{ticker} not found")),
            StoreError::InvalidTicker(_) => Self::BadRequest(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
