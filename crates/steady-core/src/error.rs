//! Error types for Steady.
//!
//! [`RequestError`] is the transport taxonomy surfaced by the request
//! executor. [`Error`] wraps it together with configuration, session and
//! decoding failures.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using Steady's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Steady.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request error with structured details
    #[error("{0}")]
    Request(#[from] RequestError),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// The session backend could not be reached after retries
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Malformed or incomplete JSON
    #[error("Decode error: {0}")]
    Decode(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/steady/config.toml"),
            Error::Request(e) => e.recovery_suggestion(),
            Error::BackendUnavailable(_) => {
                Some("The session backend is degraded; history is served from the local cache")
            }
            Error::Decode(_) => Some("The remote service sent malformed JSON; retry the request"),
            _ => None,
        }
    }
}

/// Errors produced while talking to the remote query service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// HTTP 429, or a local limiter denial that outlasted the retry budget
    #[error("Rate limited{}", retry_after.map(|d| format!(" (retry after {:.1}s)", d.as_secs_f64())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx
    #[error("Server error {status}: {message}")]
    ServerTransient { status: u16, message: String },

    /// HTTP 4xx other than 429
    #[error("Client error {status}: {message}")]
    ClientError { status: u16, message: String },

    /// The request did not complete within its timeout
    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Connection-level failure
    #[error("Network error: {message}")]
    Network { message: String },

    /// The byte stream broke after it was established
    #[error("Stream error: {message}")]
    Stream { message: String },

    /// The response body was not valid JSON
    #[error("Failed to decode response: {message}")]
    Decode { message: String },
}

impl RequestError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        match status {
            429 => RequestError::RateLimited { retry_after },
            500..=599 => RequestError::ServerTransient {
                status,
                message: message.into(),
            },
            _ => RequestError::ClientError {
                status,
                message: message.into(),
            },
        }
    }

    /// Only rate limiting is retried automatically by the transport.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RequestError::RateLimited { .. })
    }

    /// HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::RateLimited { .. } => Some(429),
            RequestError::ServerTransient { status, .. } | RequestError::ClientError { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            RequestError::RateLimited { .. } => Some("You've hit rate limits. Wait a moment and try again"),
            RequestError::ServerTransient { .. } => Some("The service is having issues. Try again later"),
            RequestError::ClientError { status: 401 | 403, .. } => Some("Check your credentials"),
            RequestError::ClientError { .. } => Some("Check the request URL and body"),
            RequestError::Timeout { .. } => Some("Try a smaller request or raise http.timeout_seconds"),
            RequestError::Network { .. } => Some("Check your network connection"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
