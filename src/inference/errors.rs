//! Inference error types.
//!
//! Variants carry the status, body or reason the caller needs for a log line;
//! nothing here logs on its own.

use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the provider endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The provider endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// The provider refused the request because of rate limiting.
    #[error("rate limited (HTTP {status}): {body}")]
    RateLimited {
        status: u16,
        body: String,
    },

    /// Non-2xx HTTP response from the provider endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// SSE stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError {
        reason: String,
    },

    /// Provider configuration could not be resolved.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl InferenceError {
    /// Build the error for a non-2xx response, classifying rate limits.
    ///
    /// Some OpenAI-compatible providers signal throttling with a 4xx/5xx other
    /// than 429 and put the reason in the body, so the body is inspected too.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 429 || body_mentions_rate_limit(&body) {
            InferenceError::RateLimited { status, body }
        } else {
            InferenceError::HttpError { status, body }
        }
    }

    /// Whether this error is a rate-limit signal that should be retried.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, InferenceError::RateLimited { .. })
    }

    /// Extract the error body text, if this is an HTTP-level error.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } | InferenceError::RateLimited { body, .. } => {
                Some(body)
            }
            _ => None,
        }
    }
}

fn body_mentions_rate_limit(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too_many_requests")
        || lower.contains("too many requests")
}
