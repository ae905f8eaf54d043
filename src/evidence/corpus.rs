//! In-memory evidence source over a fixed document set.
//!
//! Scores a document by the fraction of distinct query terms it contains.
//! Documents sharing no term with the query are not returned.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{order_snippets, EvidenceSnippet, EvidenceSource, RetrievalError};

/// Minimum term length considered during scoring.
const MIN_TERM_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusDocument {
    pub source_id: String,
    pub text: String,
}

pub struct CorpusEvidence {
    documents: Vec<(CorpusDocument, HashSet<String>)>,
}

impl CorpusEvidence {
    pub fn new(documents: Vec<CorpusDocument>) -> Self {
        let documents = documents
            .into_iter()
            .map(|doc| {
                let terms = terms(&doc.text);
                (doc, terms)
            })
            .collect();
        Self { documents }
    }

    /// Load a JSON array of `{source_id, text}` objects.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let documents: Vec<CorpusDocument> = serde_json::from_slice(&bytes)?;
        tracing::info!(
            "Loaded {} evidence documents from {}",
            documents.len(),
            path.display()
        );
        Ok(Self::new(documents))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl EvidenceSource for CorpusEvidence {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<EvidenceSnippet>, RetrievalError> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let snippets = self
            .documents
            .iter()
            .filter_map(|(doc, doc_terms)| {
                let overlap = query_terms.intersection(doc_terms).count();
                (overlap > 0).then(|| {
                    EvidenceSnippet::new(
                        doc.source_id.clone(),
                        doc.text.clone(),
                        overlap as f64 / query_terms.len() as f64,
                    )
                })
            })
            .collect();

        Ok(order_snippets(snippets, k))
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= MIN_TERM_LEN)
        .map(|t| t.to_lowercase())
        .collect()
}
