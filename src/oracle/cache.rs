//! Memoizing oracle wrapper.
//!
//! Used during compilation, where resampling passes repeat many identical
//! calls. The key covers instruction, demonstration set, inputs and requested
//! outputs, so a prompt with a different demonstration set is a different key.
//! Only successful completions are stored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::{LanguageOracle, OracleError, Prompt};
use crate::signature::Fields;

pub struct CachedOracle {
    inner: Arc<dyn LanguageOracle>,
    entries: RwLock<HashMap<String, Fields>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedOracle {
    pub fn new(inner: Arc<dyn LanguageOracle>) -> Self {
        Self {
            inner,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Content hash of a prompt.
    pub fn key(prompt: &Prompt) -> String {
        let encoded = serde_json::to_vec(prompt).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl LanguageOracle for CachedOracle {
    async fn complete(&self, prompt: &Prompt) -> Result<Fields, OracleError> {
        let key = Self::key(prompt);
        if let Some(hit) = self.entries.read().await.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let fields = self.inner.complete(prompt).await?;
        self.entries.write().await.insert(key, fields.clone());
        Ok(fields)
    }
}
