//! Chat transport errors.
//!
//! The oracle layer maps these onto its own error kinds; only the
//! transient/permanent split matters for retry.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single chat-completion request.
#[derive(Debug, Error)]
#[error("{kind}{}: {message}", .status_code.map(|c| format!(" (HTTP {})", c)).unwrap_or_default())]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// Server-suggested delay from a `Retry-After` header
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn new(kind: LlmErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(LlmErrorKind::RateLimited, Some(429), message)
        }
    }

    pub fn server_error(status_code: u16, message: String) -> Self {
        Self::new(LlmErrorKind::ServerError, Some(status_code), message)
    }

    /// Bad request, auth failure, unknown model.
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self::new(LlmErrorKind::ClientError, Some(status_code), message)
    }

    pub fn network_error(message: String) -> Self {
        Self::new(LlmErrorKind::NetworkError, None, message)
    }

    pub fn timeout(message: String) -> Self {
        Self::new(LlmErrorKind::Timeout, None, message)
    }

    /// Response body was not a chat completion.
    pub fn parse_error(message: String) -> Self {
        Self::new(LlmErrorKind::ParseError, None, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    RateLimited,
    ServerError,
    ClientError,
    NetworkError,
    Timeout,
    ParseError,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LlmErrorKind::RateLimited => "Rate limited",
            LlmErrorKind::ServerError => "Server error",
            LlmErrorKind::ClientError => "Client error",
            LlmErrorKind::NetworkError => "Network error",
            LlmErrorKind::Timeout => "Timeout",
            LlmErrorKind::ParseError => "Parse error",
        })
    }
}

impl LlmErrorKind {
    /// Whether the same request may succeed if sent again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, LlmErrorKind::ClientError | LlmErrorKind::ParseError)
    }
}

/// Map an HTTP status onto an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        408 => LlmErrorKind::Timeout,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}
