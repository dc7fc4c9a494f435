//! Unified error handling for the tsugi crate
//!
//! Every failure that can reach a job is classified into an [`ErrorKind`],
//! which drives the retry policy and the process-wide rate-limit gate:
//!
//! - `Network` and `Protocol` are retried locally inside a job, up to the
//!   attempt cap.
//! - `RateLimited` aborts the job and pauses the whole process.
//! - `Conflict` is expected under concurrent upserts and swallowed at the
//!   write site.
//! - `Fatal` fails the job immediately.

use thiserror::Error;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeout or connection failure; retryable
    Network,
    /// The source signalled overload (HTTP 429); pauses the whole process
    RateLimited,
    /// Malformed or unexpected response; retryable
    Protocol,
    /// Duplicate-key on write; expected, swallowed
    Conflict,
    /// Anything else; fails the job immediately
    Fatal,
}

impl ErrorKind {
    /// Whether a job may retry this error within its attempt budget
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Protocol)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::Protocol => "protocol",
            Self::Conflict => "conflict",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised by the source fetcher
#[derive(Error, Debug)]
pub enum FetchError {
    /// Request timeout
    #[error("request timeout")]
    Timeout,

    /// Connection-level failure
    #[error("connection failed: {0}")]
    Connection(String),

    /// The source asked us to back off; `retry_after_secs` comes from the
    /// Retry-After header when present
    #[error("rate limited by source (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Server-side error status
    #[error("server error: HTTP {0}")]
    ServerError(u16),

    /// Response did not match the expected shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying HTTP client error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout | Self::Connection(_) | Self::ServerError(_) => ErrorKind::Network,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    ErrorKind::Network
                } else if e.is_decode() {
                    ErrorKind::Protocol
                } else {
                    ErrorKind::Fatal
                }
            }
        }
    }
}

/// Errors raised by the persistent store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The connection to the database was lost; the pool must be rebuilt
    #[error("database connection lost: {0}")]
    ConnectionLost(String),

    /// Unique-constraint violation; expected under concurrent upserts
    #[error("duplicate key: {0}")]
    Conflict(String),

    /// Could not obtain a pooled connection
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Any other database error
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionLost(_) | Self::Pool(_) => ErrorKind::Network,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Database(e) => classify_postgres(e),
        }
    }
}

/// Map a raw postgres error onto the taxonomy
///
/// SQLSTATE class 23 is integrity violation (conflict); class 08 is a
/// connection exception. Errors without a DB code never made it to the
/// server, so they are treated as connection loss.
fn classify_postgres(e: &tokio_postgres::Error) -> ErrorKind {
    match e.code() {
        Some(code) if code.code().starts_with("23") => ErrorKind::Conflict,
        Some(code) if code.code().starts_with("08") => ErrorKind::Network,
        Some(_) => ErrorKind::Fatal,
        None => ErrorKind::Network,
    }
}

/// Unified error type for the tsugi crate
#[derive(Error, Debug)]
pub enum Error {
    /// Source fetcher errors
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Persistent store errors
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Classify this error for the retry policy and the rate-limit gate
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Config(_) => ErrorKind::Fatal,
            Self::Other { .. } => ErrorKind::Fatal,
        }
    }

    /// Retry-after hint carried by a rate-limit error, if any
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Fetch(FetchError::RateLimited { retry_after_secs }) => *retry_after_secs,
            _ => None,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
