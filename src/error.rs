//! Error types for the chirpstream client.

use std::time::Duration;
use thiserror::Error;

/// Error for invalid HTTP header configuration.
#[derive(Debug, Clone, Error)]
pub enum InvalidHeaderError {
    #[error("invalid header name: {0}")]
    InvalidName(String),
    #[error("invalid header value: {0}")]
    InvalidValue(String),
}

/// Main error type for request and connection setup.
///
/// Once a stream is open, failures are no longer reported through this
/// type: they arrive as terminal [`StreamEvent`](crate::StreamEvent)
/// sentinels on the iteration channel.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {message}")]
    Forbidden { message: String },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid request: {message}")]
    BadRequest { message: String },

    #[error("server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("json error: {0}")]
    Json(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("response is not chunked; streaming requires Transfer-Encoding: chunked")]
    UnsupportedFraming,

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("missing parameter for ':{0}'")]
    MissingParameter(String),
}

impl StreamError {
    /// Create error from HTTP status code and response body text.
    pub fn from_status(status: u16, url: &str, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("status {}", status)
        } else {
            body.to_string()
        };
        match status {
            400 | 406 | 413 | 416 => StreamError::BadRequest { message },
            401 => StreamError::Unauthorized,
            403 => StreamError::Forbidden { message },
            404 => StreamError::NotFound {
                url: url.to_string(),
            },
            420 | 429 => StreamError::RateLimited { retry_after: None },
            _ if status >= 500 => StreamError::ServerError { status, message },
            _ => StreamError::ServerError {
                status,
                message: format!("Unexpected status {}: {}", status, message),
            },
        }
    }

    /// Whether reissuing the request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::RateLimited { .. } => true,
            StreamError::ServerError { status, .. } => *status >= 500,
            StreamError::Network(_) => true,
            StreamError::Io(_) => true,
            StreamError::Timeout => true,
            _ => false,
        }
    }

    /// HTTP status code if applicable
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StreamError::NotFound { .. } => Some(404),
            StreamError::Unauthorized => Some(401),
            StreamError::Forbidden { .. } => Some(403),
            StreamError::RateLimited { .. } => Some(429),
            StreamError::BadRequest { .. } => Some(400),
            StreamError::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StreamError::Timeout
        } else {
            StreamError::Network(err)
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Json(err.to_string())
    }
}
