//! Error types for feedrelay.

use thiserror::Error;

/// Why a single source could not be fetched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The server answered with something other than 200 OK.
    #[error("HTTP status {0}")]
    Status(u16),

    /// The request did not complete within the fetch timeout.
    #[error("timeout")]
    Timeout,

    /// Connection, TLS, redirect or body read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The body was not a feed document we could parse.
    #[error("parse error: {0}")]
    Parse(String),

    /// The body exceeded the configured size limit.
    #[error("feed too large: {size} bytes (max {max} bytes)")]
    TooLarge { size: u64, max: u64 },
}

/// Failure to fetch one source.
///
/// Never fatal: the poll cycle logs it and moves on to the next source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to fetch {url}: {cause}")]
pub struct FetchError {
    /// Source URL that failed.
    pub url: String,
    /// What went wrong.
    pub cause: FetchErrorKind,
}

impl FetchError {
    /// Create a new fetch error for the given URL.
    pub fn new(url: impl Into<String>, cause: FetchErrorKind) -> Self {
        Self {
            url: url.into(),
            cause,
        }
    }
}

/// Failure to deliver one notification.
///
/// The entry stays unrecorded so the next cycle retries it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to deliver to {destination}: {cause}")]
pub struct DeliveryError {
    /// Destination subscriber ID.
    pub destination: String,
    /// Human readable cause.
    pub cause: String,
}

impl DeliveryError {
    /// Create a new delivery error for the given destination.
    pub fn new(destination: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            cause: cause.into(),
        }
    }
}

/// Common error type for feedrelay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Feed fetch error.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Notification delivery error.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Poll interval outside 1 minute to 1 week.
    #[error("invalid interval: {0} minutes (allowed 1 to 10080)")]
    InvalidInterval(u64),

    /// Persisted state could not be loaded or saved.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Validation error for user input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Persistence(e.to_string())
    }
}

/// Result type alias for feedrelay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
