//! Pipeline orchestrator - generate, retrieve, verify, decide.
//!
//! # State Machine
//! ```text
//! Start -> Generated -> Retrieved -> Verified -> Accepted
//!   |          |                          \---> Corrected
//!   |          |                           \--> Flagged
//!   \----------+----------------------------->  Flagged
//! ```
//! Stages run strictly in sequence. Terminal states are never re-entered
//! and a flagged task is not retried here; that choice belongs to the caller.
//! Cancellation is honoured only at stage boundaries.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::failure_log::FailureLogEntry;
use super::generator::{Generator, OracleGenerator};
use super::task::{Candidate, Task, TaskId, Verdict};
use super::verifier::Verifier;
use crate::error::PipelineError;
use crate::evidence::{order_snippets, EvidenceSnippet, RetrievalError};
use crate::oracle::OracleError;
use crate::program::CompiledProgram;
use crate::signature::Fields;

/// Pipeline stage, as recorded in the failure log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    Retrieve,
    Verify,
}

/// Why an outcome was withheld.
#[derive(Debug, Clone)]
pub enum FlagReason {
    /// Generator failed after its retry budget
    GenerationFailed(OracleError),
    /// Evidence source failed after its retry budget
    RetrievalFailed(RetrievalError),
    /// Verifier oracle failed or returned an illegal verdict
    VerificationFailed(OracleError),
    /// No usable evidence
    Unverifiable,
    /// Inconsistent, and the proposed correction was missing or malformed
    NoValidCorrection,
}

impl std::fmt::Display for FlagReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagReason::GenerationFailed(e) => write!(f, "generation failed: {}", e),
            FlagReason::RetrievalFailed(e) => write!(f, "retrieval failed: {}", e),
            FlagReason::VerificationFailed(e) => write!(f, "verification failed: {}", e),
            FlagReason::Unverifiable => write!(f, "no usable evidence to verify against"),
            FlagReason::NoValidCorrection => {
                write!(f, "candidate contradicts evidence and no valid correction was proposed")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum TerminalState {
    Accepted,
    Corrected,
    Flagged(FlagReason),
}

impl TerminalState {
    pub fn is_flagged(&self) -> bool {
        matches!(self, TerminalState::Flagged(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TerminalState::Accepted => "Accepted",
            TerminalState::Corrected => "Corrected",
            TerminalState::Flagged(_) => "Flagged",
        }
    }
}

/// Terminal result of one task plus the trace that produced it.
///
/// # Invariants
/// - `output.is_some()` iff the state is Accepted or Corrected
/// - `verdict.is_some()` whenever a candidate reached the decision step
#[derive(Debug, Clone)]
pub struct Outcome {
    pub task_id: TaskId,
    pub state: TerminalState,
    /// Delivered artifact: the candidate or its correction
    pub output: Option<Candidate>,
    /// First generated candidate, if generation succeeded
    pub candidate: Option<Candidate>,
    /// Evidence consulted, in canonical order
    pub evidence: Vec<EvidenceSnippet>,
    pub verdict: Option<Verdict>,
    /// Raw verifier output fields
    pub verification: Option<Fields>,
    /// Set when the failure log could not record this task
    pub log_error: Option<String>,
}

impl Outcome {
    fn flagged(task: &Task, reason: FlagReason) -> Self {
        Self {
            task_id: task.id().clone(),
            state: TerminalState::Flagged(reason),
            output: None,
            candidate: None,
            evidence: Vec::new(),
            verdict: None,
            verification: None,
            log_error: None,
        }
    }

    /// The delivered artifact, or the error explaining why there is none.
    pub fn into_result(self) -> Result<Candidate, PipelineError> {
        match self.state {
            TerminalState::Accepted | TerminalState::Corrected => {
                self.output.ok_or_else(|| PipelineError::VerificationInconclusive {
                    task_id: self.task_id,
                    reason: "missing output".to_string(),
                })
            }
            TerminalState::Flagged(FlagReason::GenerationFailed(e))
            | TerminalState::Flagged(FlagReason::VerificationFailed(e)) => {
                Err(PipelineError::OracleFailure(e))
            }
            TerminalState::Flagged(FlagReason::RetrievalFailed(e)) => {
                Err(PipelineError::RetrievalFailure(e))
            }
            TerminalState::Flagged(reason) => Err(PipelineError::VerificationInconclusive {
                task_id: self.task_id,
                reason: reason.to_string(),
            }),
        }
    }
}

/// Sequences generator, evidence source and verifier for one task.
pub struct Orchestrator {
    generator: Arc<dyn Generator>,
    verifier: Verifier,
}

impl Orchestrator {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            verifier: Verifier::new(),
        }
    }

    /// Run `task` to a terminal state under `program`.
    ///
    /// # Errors
    /// Only `PipelineError::Cancelled`; every other failure becomes a
    /// `Flagged` outcome.
    pub async fn run(
        &self,
        task: &Task,
        program: &CompiledProgram,
        ctx: &ExecutionContext,
    ) -> Result<Outcome, PipelineError> {
        check_cancel(ctx, Stage::Generate)?;
        let candidate = match self.generator.generate(task, program, ctx).await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(task_id = %task.id(), "Generation failed: {}", e);
                let log_error = record(
                    ctx,
                    FailureLogEntry::error(task.id().clone(), Stage::Generate, e.to_string()),
                )
                .await;
                let mut outcome = Outcome::flagged(task, FlagReason::GenerationFailed(e));
                outcome.log_error = log_error;
                return Ok(outcome);
            }
        };
        debug!(task_id = %task.id(), "Generated candidate");

        check_cancel(ctx, Stage::Retrieve)?;
        let query = retrieval_query(task, &candidate);
        let k = program.params.evidence_k;
        let evidence = match ctx
            .retrieval_policy
            .run("retrieve", || ctx.evidence.search(&query, k))
            .await
        {
            Ok(snippets) => order_snippets(snippets, k),
            Err(e) => {
                warn!(task_id = %task.id(), "Retrieval failed: {}", e);
                let log_error = record(
                    ctx,
                    FailureLogEntry::error(task.id().clone(), Stage::Retrieve, e.to_string()),
                )
                .await;
                let mut outcome = Outcome::flagged(task, FlagReason::RetrievalFailed(e));
                outcome.candidate = Some(candidate);
                outcome.log_error = log_error;
                return Ok(outcome);
            }
        };
        debug!(task_id = %task.id(), snippets = evidence.len(), "Retrieved evidence");

        check_cancel(ctx, Stage::Verify)?;
        let judgment = match self
            .verifier
            .verify(task, &candidate, &evidence, program, ctx)
            .await
        {
            Ok(judgment) => judgment,
            Err(e) => {
                warn!(task_id = %task.id(), "Verification failed: {}", e);
                let log_error = record(
                    ctx,
                    FailureLogEntry::error(task.id().clone(), Stage::Verify, e.to_string()),
                )
                .await;
                let mut outcome = Outcome::flagged(task, FlagReason::VerificationFailed(e));
                outcome.candidate = Some(candidate);
                outcome.evidence = evidence;
                outcome.log_error = log_error;
                return Ok(outcome);
            }
        };

        let mut log_error = None;
        let (state, output) = match (judgment.verdict, judgment.correction) {
            (Verdict::Consistent, _) => (TerminalState::Accepted, Some(candidate.clone())),
            (Verdict::Inconsistent, Some(correction)) => {
                log_error = record(
                    ctx,
                    FailureLogEntry::verdict(task.id().clone(), Stage::Verify, Verdict::Inconsistent),
                )
                .await;
                (TerminalState::Corrected, Some(correction))
            }
            (Verdict::Inconsistent, None) => {
                log_error = record(
                    ctx,
                    FailureLogEntry::verdict(task.id().clone(), Stage::Verify, Verdict::Inconsistent),
                )
                .await;
                (TerminalState::Flagged(FlagReason::NoValidCorrection), None)
            }
            (Verdict::Unverifiable, _) => {
                log_error = record(
                    ctx,
                    FailureLogEntry::verdict(task.id().clone(), Stage::Verify, Verdict::Unverifiable),
                )
                .await;
                (TerminalState::Flagged(FlagReason::Unverifiable), None)
            }
        };

        match &state {
            TerminalState::Flagged(reason) => {
                warn!(task_id = %task.id(), "Task flagged: {}", reason)
            }
            other => info!(task_id = %task.id(), "Task {}", other.label()),
        }

        Ok(Outcome {
            task_id: task.id().clone(),
            state,
            output,
            candidate: Some(candidate),
            evidence,
            verdict: Some(judgment.verdict),
            verification: judgment.raw,
            log_error,
        })
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(Arc::new(OracleGenerator::new()))
    }
}

fn check_cancel(ctx: &ExecutionContext, next: Stage) -> Result<(), PipelineError> {
    if ctx.is_cancelled() {
        return Err(PipelineError::Cancelled(next));
    }
    Ok(())
}

/// Append to the failure log; returns the write error, if any.
async fn record(ctx: &ExecutionContext, entry: FailureLogEntry) -> Option<String> {
    match ctx.failure_log.append(entry).await {
        Ok(()) => None,
        Err(e) => {
            warn!("Failed to write failure log entry: {}", e);
            Some(e.to_string())
        }
    }
}

/// Query grounding a candidate: the task plus every generated field.
fn retrieval_query(task: &Task, candidate: &Candidate) -> String {
    let mut query = task.description().to_string();
    for value in candidate.fields().values() {
        query.push('\n');
        query.push_str(value);
    }
    query
}
