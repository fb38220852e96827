use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

/// Errors produced by the relay core and its components.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Admission rejected: the identity already holds its full quota of
    /// queued requests.
    #[error("this user already has a request in the queue")]
    TooManyQueued,

    /// A preprocessor stage rejected the request (bad body, blocked origin,
    /// content violation). Carries the client-facing status (400 or 403).
    #[error("request rejected: {message}")]
    Rewriting { status: u16, message: String },

    /// Upstream returned a non-success status code.
    ///
    /// The executor classifies this further: permanent auth failure,
    /// transient rate limit, quota exhaustion, or terminal 4xx. The
    /// `retry_after` field is populated from the `Retry-After` response
    /// header when present.
    #[error("upstream HTTP {status}: {body}")]
    UpstreamHttp {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Every key for the requested family has been disabled or exhausted.
    #[error("no API keys remain usable for this model family")]
    KeysExhausted,

    /// The request sat in the queue longer than the stall timeout and was
    /// terminated by the proxy.
    #[error("your request has been terminated by the proxy because it timed out in the queue")]
    QueueTimeout,

    /// The client connection went away while the request was queued or
    /// in flight.
    #[error("client aborted the request")]
    Aborted,

    /// Internal invariant violation: a ticket id was enqueued twice.
    #[error("ticket {0} is already queued")]
    DuplicateTicket(u64),

    /// Invalid configuration detected at load time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Other(err.to_string())
    }
}

impl RelayError {
    /// The HTTP status this error maps to when surfaced as a JSON envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::TooManyQueued => 429,
            RelayError::Rewriting { status, .. } => *status,
            RelayError::UpstreamHttp { status, .. } => *status,
            RelayError::KeysExhausted => 503,
            RelayError::QueueTimeout => 500,
            RelayError::Aborted => 499,
            RelayError::Json(_) => 400,
            _ => 500,
        }
    }

    /// Stable error type tag used in the client-facing envelope.
    pub fn type_tag(&self) -> &'static str {
        match self {
            RelayError::TooManyQueued => "proxy_error",
            RelayError::Rewriting { .. } => "proxy_rejection",
            RelayError::UpstreamHttp { .. } => "upstream_error",
            RelayError::KeysExhausted => "proxy_error",
            RelayError::QueueTimeout => "proxy_error",
            RelayError::Aborted => "client_aborted",
            _ => "internal_error",
        }
    }

    /// Render the non-streaming error envelope:
    /// `{ type, message, proxy_note? }`.
    pub fn to_envelope(&self, proxy_note: Option<&str>) -> Value {
        let mut envelope = json!({
            "type": self.type_tag(),
            "message": self.to_string(),
        });
        if let Some(note) = proxy_note {
            envelope["proxy_note"] = json!(note);
        }
        envelope
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_many_queued_envelope() {
        let err = RelayError::TooManyQueued;
        assert_eq!(err.status_code(), 429);
        let envelope = err.to_envelope(None);
        assert_eq!(envelope["type"], "proxy_error");
        assert!(envelope["message"]
            .as_str()
            .unwrap()
            .contains("already has a request in the queue"));
        assert!(envelope.get("proxy_note").is_none());
    }

    #[test]
    fn test_queue_timeout_message() {
        let err = RelayError::QueueTimeout;
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains("terminated by the proxy"));
    }

    #[test]
    fn test_rewriting_status_passthrough() {
        let err = RelayError::Rewriting {
            status: 403,
            message: "blocked origin".into(),
        };
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.type_tag(), "proxy_rejection");
    }

    #[test]
    fn test_upstream_preserves_status_and_body() {
        let err = RelayError::UpstreamHttp {
            status: 418,
            body: "short and stout".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.status_code(), 418);
        assert!(err.to_string().contains("short and stout"));
    }

    #[test]
    fn test_envelope_with_proxy_note() {
        let err = RelayError::KeysExhausted;
        let envelope = err.to_envelope(Some("prompts are logged"));
        assert_eq!(envelope["proxy_note"], "prompts are logged");
    }
}
