//! Crate-level error taxonomy.

use thiserror::Error;

use crate::compiler::CompilationError;
use crate::evidence::RetrievalError;
use crate::oracle::OracleError;
use crate::pipeline::{Stage, TaskId};
use crate::program::StoreError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Retrieval failure: {0}")]
    RetrievalFailure(#[from] RetrievalError),

    #[error("Oracle failure: {0}")]
    OracleFailure(#[from] OracleError),

    #[error("Verification inconclusive for task {task_id}: {reason}")]
    VerificationInconclusive { task_id: TaskId, reason: String },

    #[error("Compilation failure: {0}")]
    CompilationFailure(#[from] CompilationError),

    #[error("Program store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cancelled before {0:?} stage")]
    Cancelled(Stage),
}
