//! Program persistence with atomic replacement.
//!
//! Readers take an `Arc` snapshot via [`ProgramStore::current`] and keep it for
//! the whole task, so a concurrent commit never changes a program mid-run.
//! On disk the new program is written next to the target and renamed over it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::{CompiledProgram, PROGRAM_SCHEMA_VERSION};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Program store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Program file is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Program schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("Program violates invariants: {0}")]
    Invalid(String),
}

pub struct ProgramStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<CompiledProgram>>,
    persist_lock: Mutex<()>,
}

impl ProgramStore {
    /// Store that never touches disk.
    pub fn in_memory(initial: CompiledProgram) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(initial)),
            persist_lock: Mutex::new(()),
        }
    }

    /// Open a file-backed store.
    ///
    /// A missing file starts from `fallback`. An existing file must load
    /// cleanly; a schema mismatch or invariant violation is an error, not a
    /// silent fallback.
    pub async fn open(path: PathBuf, fallback: CompiledProgram) -> Result<Self, StoreError> {
        let initial = if fs::try_exists(&path).await? {
            let program = Self::load(&path).await?;
            tracing::info!(
                "Loaded compiled program v{} ({} demonstrations) from {}",
                program.version,
                program.demonstrations.len(),
                path.display()
            );
            program
        } else {
            tracing::info!(
                "No compiled program at {}, using uncompiled pipeline",
                path.display()
            );
            fallback
        };

        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(initial)),
            persist_lock: Mutex::new(()),
        })
    }

    /// Read and validate a program file.
    pub async fn load(path: &Path) -> Result<CompiledProgram, StoreError> {
        let bytes = fs::read(path).await?;

        // Check the version before decoding the rest, so an incompatible
        // layout reports a mismatch rather than a parse error.
        let raw: serde_json::Value = serde_json::from_slice(&bytes)?;
        let found = raw
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if found != PROGRAM_SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                found,
                expected: PROGRAM_SCHEMA_VERSION,
            });
        }

        let program: CompiledProgram = serde_json::from_value(raw)?;
        program.check_invariants().map_err(StoreError::Invalid)?;
        Ok(program)
    }

    /// Snapshot of the committed program.
    pub async fn current(&self) -> Arc<CompiledProgram> {
        self.current.read().await.clone()
    }

    /// Persist `program` and make it current.
    ///
    /// # Postconditions
    /// - On `Ok`, disk and memory both hold the new program with `version` bumped
    /// - On `Err`, the previously committed program is unchanged
    pub async fn commit(&self, mut program: CompiledProgram) -> Result<Arc<CompiledProgram>, StoreError> {
        program.check_invariants().map_err(StoreError::Invalid)?;

        let _guard = self.persist_lock.lock().await;
        program.schema_version = PROGRAM_SCHEMA_VERSION;
        program.version = self.current.read().await.version + 1;

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let data = serde_json::to_vec_pretty(&program)?;
            let tmp_path = path.with_extension("json.tmp");
            fs::write(&tmp_path, data).await?;
            fs::rename(&tmp_path, path).await?;
        }

        let program = Arc::new(program);
        *self.current.write().await = program.clone();
        tracing::info!(
            "Committed compiled program v{} ({} demonstrations)",
            program.version,
            program.demonstrations.len()
        );
        Ok(program)
    }
}
