//! galcache error types

use std::time::Duration;

/// galcache error types
///
/// `Clone` so that every caller waiting on a coalesced fetch can receive
/// the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GalcacheError {
    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // Upstream errors
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// HTTP 429 from the upstream. Retried like [`Server`](Self::Server) but
    /// kept distinct for logging.
    #[error("upstream rate limited, retry after {retry_after:?}")]
    UpstreamRateLimited { retry_after: Option<Duration> },

    /// Non-auth 4xx from the upstream.
    #[error("upstream rejected request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("not found: {0}")]
    NotFound(String),

    // Access control
    #[error("'{command}' is on cooldown, retry after {retry_after:?}")]
    RateLimited {
        command: String,
        retry_after: Duration,
    },

    // Image cache errors
    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("I/O error: {0}")]
    Io(String),

    // Search errors
    #[error("fuzzy search exceeded its {0:?} budget")]
    SearchTimeout(Duration),
}

impl GalcacheError {
    /// Whether the upstream retry loop should try again after this error.
    ///
    /// Network faults, per-attempt timeouts, 5xx responses and upstream
    /// 429s are transient. Everything else, including authentication
    /// failures (which have their own refresh-then-retry path), is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GalcacheError::Network(_)
                | GalcacheError::Timeout(_)
                | GalcacheError::Server { .. }
                | GalcacheError::UpstreamRateLimited { .. }
        )
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GalcacheError::UpstreamRateLimited { retry_after } => *retry_after,
            GalcacheError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub(crate) fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        GalcacheError::Io(format!("{context}: {err}"))
    }
}

impl From<reqwest::Error> for GalcacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GalcacheError::Malformed(err.to_string())
        } else {
            GalcacheError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GalcacheError {
    fn from(err: serde_json::Error) -> Self {
        GalcacheError::Malformed(err.to_string())
    }
}

/// Result type alias for galcache operations
pub type Result<T> = std::result::Result<T, GalcacheError>;
