//! Evidence-grounded verification.
//!
//! # Policies
//! - Empty evidence is `Unverifiable` without consulting the oracle
//! - A verdict word outside the three legal values is an oracle failure
//! - A correction that fails schema validation is dropped; the original
//!   candidate stands and the caller decides what to do with it

use super::context::ExecutionContext;
use super::task::{Candidate, Provenance, Task, Verdict, TASK_FIELD};
use crate::evidence::{render_evidence, EvidenceSnippet};
use crate::oracle::{OracleError, Prompt};
use crate::program::CompiledProgram;
use crate::signature::{FieldSpec, Fields};

const VERIFY_INSTRUCTION: &str = "You check whether a candidate answer to a task is consistent with the \
evidence. Judge only against the evidence. If the candidate contradicts the evidence, answer \
Inconsistent and give a corrected answer with the same fields as the candidate. Otherwise answer \
Consistent and give an empty correction.";

pub const VERDICT_FIELD: &str = "verdict";
pub const RATIONALE_FIELD: &str = "rationale";
pub const CORRECTION_FIELD: &str = "correction";

/// Result of one verification.
///
/// # Invariants
/// - `correction.is_some()` implies `verdict == Inconsistent`
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub verdict: Verdict,
    pub correction: Option<Candidate>,
    pub rationale: String,
    /// Raw oracle fields, `None` when the oracle was not consulted
    pub raw: Option<Fields>,
}

impl Judgment {
    fn unverifiable(rationale: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Unverifiable,
            correction: None,
            rationale: rationale.into(),
            raw: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Self
    }

    fn outputs() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new(
                VERDICT_FIELD,
                "exactly one of: Consistent, Inconsistent",
            ),
            FieldSpec::new(RATIONALE_FIELD, "one or two sentences citing the evidence"),
            FieldSpec::new(
                CORRECTION_FIELD,
                "if Inconsistent, a JSON object with the corrected candidate fields; otherwise {}",
            ),
        ]
    }

    pub fn prompt(
        task: &Task,
        candidate: &Candidate,
        evidence: &[EvidenceSnippet],
        program: &CompiledProgram,
    ) -> Prompt {
        let mut inputs = Fields::new();
        inputs.insert(TASK_FIELD.to_string(), task.description().to_string());
        inputs.insert("candidate".to_string(), candidate.to_json());
        inputs.insert("evidence".to_string(), render_evidence(evidence));

        Prompt::new(VERIFY_INSTRUCTION, inputs, Self::outputs())
            .with_demonstrations(program.verification_exemplars())
    }

    /// Judge `candidate` against `evidence`.
    ///
    /// # Errors
    /// `OracleError` when the oracle fails after retries or answers with an
    /// illegal verdict.
    pub async fn verify(
        &self,
        task: &Task,
        candidate: &Candidate,
        evidence: &[EvidenceSnippet],
        program: &CompiledProgram,
        ctx: &ExecutionContext,
    ) -> Result<Judgment, OracleError> {
        if evidence.is_empty() {
            return Ok(Judgment::unverifiable("no evidence retrieved"));
        }

        let prompt = Self::prompt(task, candidate, evidence, program);
        let raw = ctx
            .oracle_policy
            .run("verify", || ctx.oracle.complete(&prompt))
            .await?;

        let verdict_text = raw.get(VERDICT_FIELD).map(String::as_str).unwrap_or("");
        let verdict = Verdict::parse(verdict_text).ok_or_else(|| {
            OracleError::non_conforming(format!("illegal verdict '{}'", verdict_text))
        })?;
        let rationale = raw.get(RATIONALE_FIELD).cloned().unwrap_or_default();

        let correction = match verdict {
            Verdict::Inconsistent => parse_correction(task, raw.get(CORRECTION_FIELD)),
            Verdict::Consistent | Verdict::Unverifiable => None,
        };

        Ok(Judgment {
            verdict,
            correction,
            rationale,
            raw: Some(raw),
        })
    }
}

fn parse_correction(task: &Task, text: Option<&String>) -> Option<Candidate> {
    let text = text?;
    let value: serde_json::Value = match serde_json::from_str(text.trim()) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(task_id = %task.id(), "Discarding unparseable correction: {}", e);
            return None;
        }
    };
    let object = value.as_object()?;
    let fields: Fields = object
        .iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((k.clone(), s.clone())),
            other => Some((k.clone(), other.to_string())),
        })
        .collect();

    match Candidate::for_task(task, &fields, Provenance::Correction) {
        Ok(candidate) => Some(candidate),
        Err(e) => {
            tracing::warn!(task_id = %task.id(), "Discarding correction that fails schema: {}", e);
            None
        }
    }
}
