//! Error types for shai-llm

use thiserror::Error;

/// Result type alias using shai-llm Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to an LLM provider
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Provider not supported
    #[error("Provider not supported: {0}")]
    UnsupportedProvider(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Map a non-success HTTP status and its body to an error
    pub fn from_status(status: u16, body: &str, retry_after: Option<u64>) -> Self {
        match status {
            401 | 403 => Error::InvalidApiKey,
            429 => Error::RateLimited { retry_after },
            _ => Error::api(format!("http_{}", status), body.trim()),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Adapters never retry on their own; this is a hint for the caller's
    /// retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::RateLimited { .. } | Error::Sse(_) => true,
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || et.starts_with("http_5")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }
}
