//! Evidence sources for grounding verification.
//!
//! An [`EvidenceSource`] answers a query with scored snippets. Its internal
//! retrieval mechanism is opaque; the pipeline only relies on the ordering
//! produced by [`order_snippets`], which every result passes through.

mod corpus;

pub use corpus::{CorpusDocument, CorpusEvidence};

use std::cmp::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryableError;

/// A retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSnippet {
    pub source_id: String,
    pub text: String,
    pub score: f64,
}

impl EvidenceSnippet {
    pub fn new(source_id: impl Into<String>, text: impl Into<String>, score: f64) -> Self {
        Self {
            source_id: source_id.into(),
            text: text.into(),
            score,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Retrieval timed out after {0:?}")]
    Timeout(Duration),

    #[error("Evidence source unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid retrieval request: {0}")]
    InvalidRequest(String),
}

impl RetryableError for RetrievalError {
    fn is_transient(&self) -> bool {
        matches!(self, RetrievalError::Timeout(_) | RetrievalError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        RetrievalError::Timeout(after)
    }
}

/// Something that can be searched for evidence.
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    /// Up to `k` snippets relevant to `query`. May be empty.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<EvidenceSnippet>, RetrievalError>;
}

/// Canonical snippet order: score descending, ties by `source_id`, truncated to `k`.
///
/// Snippets with a NaN score cannot be ranked and are dropped.
pub fn order_snippets(mut snippets: Vec<EvidenceSnippet>, k: usize) -> Vec<EvidenceSnippet> {
    snippets.retain(|s| !s.score.is_nan());
    snippets.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    snippets.truncate(k);
    snippets
}

/// Evidence rendered for a prompt, one numbered block per snippet.
pub fn render_evidence(snippets: &[EvidenceSnippet]) -> String {
    snippets
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] ({}) {}", i + 1, s.source_id, s.text))
        .collect::<Vec<_>>()
        .join("\n")
}
