//! Error types for refkb.
//!
//! Library crates use [`RefKbError`] via `thiserror`; remote failures are
//! classified into a single tagged [`ApiError`]. The CLI wraps these with
//! `color-eyre` for rich diagnostics.

use std::fmt;
use std::path::PathBuf;

/// Classification of a failed remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// 401/403: credentials rejected. Never retried.
    Authentication,
    /// 429 after the retry budget was spent.
    RateLimited { retry_after_secs: u64 },
    /// 5xx after the retry budget was spent.
    ServerError { status: u16 },
    /// Connection-level failure (DNS, refused, reset, body read).
    Network,
    /// The request exceeded the client timeout.
    Timeout,
    /// 404, any other client error, or an unreadable success body.
    Unclassified { status: Option<u16> },
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication failed"),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate limited (retry after {retry_after_secs}s)")
            }
            Self::ServerError { status } => write!(f, "server error {status}"),
            Self::Network => write!(f, "network error"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Unclassified { status: Some(status) } => write!(f, "client error {status}"),
            Self::Unclassified { status: None } => write!(f, "unexpected response"),
        }
    }
}

/// A failed remote call, tagged by [`ApiErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {method} {endpoint} - {detail}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    /// HTTP method of the originating request.
    pub method: String,
    /// Endpoint path (relative to the service base URL).
    pub endpoint: String,
    /// Message extracted from the response body, or a transport description.
    pub detail: String,
}

impl ApiError {
    pub fn new(
        kind: ApiErrorKind,
        method: impl Into<String>,
        endpoint: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            method: method.into(),
            endpoint: endpoint.into(),
            detail: detail.into(),
        }
    }

    /// HTTP status carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match &self.kind {
            ApiErrorKind::Authentication => None,
            ApiErrorKind::RateLimited { .. } => Some(429),
            ApiErrorKind::ServerError { status } => Some(*status),
            ApiErrorKind::Unclassified { status } => *status,
            ApiErrorKind::Network | ApiErrorKind::Timeout => None,
        }
    }

    /// Whether a caller-level retry could plausibly succeed.
    ///
    /// The transport already retried 429/5xx internally, so those are
    /// reported retryable only in the sense that the condition is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ApiErrorKind::RateLimited { .. }
                | ApiErrorKind::ServerError { .. }
                | ApiErrorKind::Network
                | ApiErrorKind::Timeout
        )
    }
}

/// Top-level error type for all refkb operations.
#[derive(Debug, thiserror::Error)]
pub enum RefKbError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Classified failure from the knowledge-base service.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Network/HTTP error outside the typed transport (enrichment, downloads).
    #[error("network error: {0}")]
    Network(String),

    /// Database or ledger error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Record enrichment error.
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Local precondition violation (bad process mode, empty name, ...).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RefKbError>;

impl RefKbError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The classified API error, if this is one.
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.is_retryable(),
            Self::Network(_) => true,
            _ => false,
        }
    }
}
