//! Error types shared by the queue, the retrier, and the model client.
//!
//! Transport failures are normalized into [`TransportError`] at the boundary so
//! that rate-limit detection is a pattern match rather than field probing.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// HTTP status the provider uses to signal throttling.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Provider status token for an exhausted quota.
pub const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";

// Lowercase substrings that mark a free-text message as a rate-limit signal.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "quota",
    "rate limit",
    "rate-limit",
    "resource_exhausted",
    "resource exhausted",
    "too many requests",
];

/// Errors produced by the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The provider kept throttling past the retry bound. The message is meant
    /// to be shown to the user as-is.
    #[error(
        "The AI service is receiving too much traffic right now. Please wait a moment and try again."
    )]
    RetryExhausted { attempts: u32 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl Error {
    /// Returns `true` for the terminal "too much traffic" condition.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Returns `true` if the underlying transport failure was a throttling signal.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_rate_limited(),
            _ => false,
        }
    }
}

/// Errors synthesized by the request queue itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The task was dispatched but never produced a result (it panicked or
    /// the runtime shut down underneath it).
    #[error("queued request was abandoned before it settled")]
    Abandoned,
}

/// A provider error code, either numeric or a symbolic status token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCode {
    Numeric(i64),
    Status(String),
}

impl fmt::Display for ProviderCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Status(s) => f.write_str(s),
        }
    }
}

/// A failure reported by the model transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("provider error {code}: {message}")]
    Provider { code: ProviderCode, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed provider response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns the free-text message carried by any variant.
    pub fn message(&self) -> &str {
        match self {
            Self::Http { message, .. } | Self::Provider { message, .. } => message,
            Self::Network(m) | Self::Decode(m) | Self::Other(m) => m,
        }
    }

    /// Classifies this failure as a throttling signal worth retrying.
    ///
    /// A failure is rate-limited when it carries HTTP `429`, a provider code of
    /// `429` or `RESOURCE_EXHAUSTED`, or a message mentioning a rate-limit or
    /// quota marker. Everything else is non-retryable.
    pub fn is_rate_limited(&self) -> bool {
        let coded = match self {
            Self::Http { status, .. } => *status == TOO_MANY_REQUESTS,
            Self::Provider {
                code: ProviderCode::Numeric(n),
                ..
            } => *n == i64::from(TOO_MANY_REQUESTS),
            Self::Provider {
                code: ProviderCode::Status(s),
                ..
            } => {
                s.eq_ignore_ascii_case(RESOURCE_EXHAUSTED)
                    || s.trim().parse::<u16>() == Ok(TOO_MANY_REQUESTS)
            }
            _ => false,
        };
        coded || message_signals_rate_limit(self.message())
    }

    /// Normalizes a loosely-shaped JSON error body into a [`TransportError`].
    ///
    /// Probes, in order: a top-level `status`, a nested `response.status`, a
    /// nested `error.code`, a nested `error.status`, and finally a
    /// bare `message` or `error.message`. Bodies matching none of these become
    /// [`TransportError::Other`] with the serialized JSON as message.
    ///
    /// A status that is a number, or a string holding a number, becomes
    /// [`TransportError::Http`]; any other status string becomes a
    /// [`ProviderCode::Status`] token.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use sluice::TransportError;
    ///
    /// let err = TransportError::from_value(&json!({ "response": { "status": 429 } }));
    /// assert!(err.is_rate_limited());
    ///
    /// let err = TransportError::from_value(&json!({ "status": 400, "message": "bad schema" }));
    /// assert!(!err.is_rate_limited());
    /// ```
    pub fn from_value(value: &Value) -> Self {
        let message = value
            .get("message")
            .or_else(|| value.pointer("/error/message"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        if let Some(err) = value
            .get("status")
            .and_then(|s| Self::from_status(s, &message))
        {
            return err;
        }

        if let Some(err) = value
            .pointer("/response/status")
            .and_then(|s| Self::from_status(s, &message))
        {
            return err;
        }

        if let Some(code) = value.pointer("/error/code").and_then(Value::as_i64) {
            return Self::Provider {
                code: ProviderCode::Numeric(code),
                message,
            };
        }

        if let Some(err) = value
            .pointer("/error/status")
            .and_then(|s| Self::from_status(s, &message))
        {
            return err;
        }

        if message.is_empty() {
            Self::Other(value.to_string())
        } else {
            Self::Other(message)
        }
    }

    // A numeric status (or a numeric string such as `"429"`) is an HTTP
    // status; any other string is a provider status token.
    fn from_status(status: &Value, message: &str) -> Option<Self> {
        let message = message.to_owned();
        match status {
            Value::Number(n) => n
                .as_u64()
                .and_then(|s| u16::try_from(s).ok())
                .map(|status| Self::Http { status, message }),
            Value::String(s) => Some(match s.trim().parse::<u16>() {
                Ok(status) => Self::Http { status, message },
                Err(_) => Self::Provider {
                    code: ProviderCode::Status(s.clone()),
                    message,
                },
            }),
            _ => None,
        }
    }
}

fn message_signals_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| lower.contains(marker))
}
