//! Online pipeline: one task from generation to a terminal state.
//!
//! - `task`: tasks, candidates, verdicts
//! - `generator`: candidate production via the oracle
//! - `verifier`: evidence-grounded judgment and correction
//! - `orchestrator`: the state machine tying them together
//! - `failure_log`: append-only audit trail
//! - `context`: collaborators and call policies passed into every run

mod context;
mod failure_log;
mod generator;
mod orchestrator;
mod task;
mod verifier;

pub use context::ExecutionContext;
pub use failure_log::{FailureLog, FailureLogEntry};
pub use generator::{Generator, OracleGenerator};
pub use orchestrator::{FlagReason, Orchestrator, Outcome, Stage, TerminalState};
pub use task::{Candidate, Provenance, Task, TaskError, TaskId, TaskSpec, Verdict, TASK_FIELD};
pub use verifier::{Judgment, Verifier, CORRECTION_FIELD, RATIONALE_FIELD, VERDICT_FIELD};
