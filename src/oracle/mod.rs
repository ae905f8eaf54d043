//! Language oracle: structured prompt in, structured fields out.
//!
//! The oracle is the only way the pipeline talks to a language model. A
//! [`Prompt`] carries an instruction, optional demonstrations, typed input
//! fields and the output fields the caller wants back. Implementations return
//! exactly those output fields or an [`OracleError`].
//!
//! # Implementations
//! - [`ChatOracle`]: renders the prompt into chat messages over an [`LlmClient`](crate::llm::LlmClient)
//! - [`CachedOracle`]: memoizes another oracle by prompt content

mod cache;
mod chat;

pub use cache::CachedOracle;
pub use chat::ChatOracle;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryableError;
use crate::signature::{FieldSpec, Fields};

/// One input/output pair shown to the oracle before the real inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exemplar {
    pub inputs: Fields,
    pub outputs: Fields,
}

/// A complete oracle request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub instruction: String,
    pub demonstrations: Vec<Exemplar>,
    pub inputs: Fields,
    pub outputs: Vec<FieldSpec>,
}

impl Prompt {
    pub fn new(instruction: impl Into<String>, inputs: Fields, outputs: Vec<FieldSpec>) -> Self {
        Self {
            instruction: instruction.into(),
            demonstrations: Vec::new(),
            inputs,
            outputs,
        }
    }

    pub fn with_demonstrations(mut self, demonstrations: Vec<Exemplar>) -> Self {
        self.demonstrations = demonstrations;
        self
    }
}

/// Classification of oracle failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleErrorKind {
    /// Call exceeded its timeout - transient
    Timeout,
    /// Provider throttled the call - transient
    RateLimited,
    /// Provider or network unreachable - transient
    Unavailable,
    /// Request itself is malformed or unauthorized - permanent
    Rejected,
    /// Output did not fit the requested fields - recurs for identical input
    NonConforming,
}

impl OracleErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleErrorKind::Timeout | OracleErrorKind::RateLimited | OracleErrorKind::Unavailable
        )
    }
}

impl std::fmt::Display for OracleErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OracleErrorKind::Timeout => write!(f, "Timeout"),
            OracleErrorKind::RateLimited => write!(f, "Rate limited"),
            OracleErrorKind::Unavailable => write!(f, "Unavailable"),
            OracleErrorKind::Rejected => write!(f, "Rejected"),
            OracleErrorKind::NonConforming => write!(f, "Non-conforming output"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct OracleError {
    pub kind: OracleErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl OracleError {
    pub fn new(kind: OracleErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(OracleErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(OracleErrorKind::Unavailable, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(OracleErrorKind::Rejected, message)
    }

    pub fn non_conforming(message: impl Into<String>) -> Self {
        Self::new(OracleErrorKind::NonConforming, message)
    }
}

impl RetryableError for OracleError {
    fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    fn timed_out(after: Duration) -> Self {
        OracleError::timeout(format!("no response within {:?}", after))
    }
}

/// A language model behind a structured interface.
///
/// # Postconditions
/// - `Ok(fields)` contains every name in `prompt.outputs`
#[async_trait]
pub trait LanguageOracle: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<Fields, OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(OracleErrorKind::Timeout.is_transient());
        assert!(OracleErrorKind::RateLimited.is_transient());
        assert!(OracleErrorKind::Unavailable.is_transient());
        assert!(!OracleErrorKind::Rejected.is_transient());
        assert!(!OracleErrorKind::NonConforming.is_transient());
    }

    #[test]
    fn test_timeout_error_is_retryable() {
        let err = OracleError::timed_out(Duration::from_secs(3));
        assert_eq!(err.kind, OracleErrorKind::Timeout);
        assert!(RetryableError::is_transient(&err));
    }
}
