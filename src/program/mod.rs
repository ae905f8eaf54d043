//! Compiled programs: the artifact the compiler produces and the pipeline reads.
//!
//! A program bundles instruction text, orchestration parameters and an
//! ordered set of demonstrations. Programs are values; a new compilation
//! yields a new program and the [`ProgramStore`] swaps it in whole.
//!
//! # Invariants
//! - `demonstrations.len() <= params.max_demonstrations`
//! - Every demonstration scores `>= params.acceptance_threshold`

mod store;

pub use store::{ProgramStore, StoreError};

use serde::{Deserialize, Serialize};

use crate::evidence::{render_evidence, EvidenceSnippet};
use crate::oracle::Exemplar;
use crate::pipeline::TASK_FIELD;
use crate::signature::Fields;

/// Bump when the persisted layout changes. Loading any other version fails.
pub const PROGRAM_SCHEMA_VERSION: u32 = 2;

/// Default generation instruction for uncompiled programs.
pub const DEFAULT_INSTRUCTION: &str = "Complete the task. Be precise and use current, non-deprecated APIs.";

/// A validated execution trace used to steer later generations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demonstration {
    /// Generator inputs
    pub inputs: Fields,
    /// Evidence retrieved for this trace
    pub evidence: Vec<EvidenceSnippet>,
    /// Generated candidate, before any correction
    pub candidate: Fields,
    /// Final output fields of the trace
    pub outputs: Fields,
    /// Raw verifier output fields, when verification ran
    #[serde(default)]
    pub verification: Option<Fields>,
    /// Metric score at acceptance time
    pub score: f64,
}

impl Demonstration {
    /// Generator exemplar for this trace.
    pub fn generation_exemplar(&self) -> Exemplar {
        Exemplar {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }
    }

    /// Verifier exemplar for this trace, if it was verified against evidence.
    pub fn verification_exemplar(&self) -> Option<Exemplar> {
        let verification = self.verification.as_ref()?;
        if self.evidence.is_empty() {
            return None;
        }
        let mut inputs = Fields::new();
        if let Some(task) = self.inputs.get(TASK_FIELD) {
            inputs.insert(TASK_FIELD.to_string(), task.clone());
        }
        inputs.insert(
            "candidate".to_string(),
            serde_json::to_string(&self.candidate).unwrap_or_default(),
        );
        inputs.insert("evidence".to_string(), render_evidence(&self.evidence));
        Some(Exemplar {
            inputs,
            outputs: verification.clone(),
        })
    }
}

/// Knobs the orchestrator and compiler read from a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationParams {
    /// Snippets requested per task
    pub evidence_k: usize,
    /// Upper bound on attached demonstrations (K)
    pub max_demonstrations: usize,
    /// Metric floor used when the demonstrations were accepted
    pub acceptance_threshold: f64,
}

impl Default for OrchestrationParams {
    fn default() -> Self {
        Self {
            evidence_k: 5,
            max_demonstrations: 4,
            acceptance_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub schema_version: u32,
    /// Monotonic, assigned by the store on commit (0 = never committed)
    #[serde(default)]
    pub version: u64,
    pub instruction: String,
    pub demonstrations: Vec<Demonstration>,
    pub params: OrchestrationParams,
}

impl CompiledProgram {
    /// Zero-demonstration program.
    pub fn uncompiled(instruction: impl Into<String>, params: OrchestrationParams) -> Self {
        Self {
            schema_version: PROGRAM_SCHEMA_VERSION,
            version: 0,
            instruction: instruction.into(),
            demonstrations: Vec::new(),
            params,
        }
    }

    /// New program with the given demonstrations and acceptance parameters.
    ///
    /// `self` is left untouched.
    pub fn with_demonstrations(
        &self,
        demonstrations: Vec<Demonstration>,
        max_demonstrations: usize,
        acceptance_threshold: f64,
    ) -> Self {
        Self {
            schema_version: PROGRAM_SCHEMA_VERSION,
            version: 0,
            instruction: self.instruction.clone(),
            demonstrations,
            params: OrchestrationParams {
                max_demonstrations,
                acceptance_threshold,
                ..self.params.clone()
            },
        }
    }

    pub fn is_compiled(&self) -> bool {
        !self.demonstrations.is_empty()
    }

    pub fn generation_exemplars(&self) -> Vec<Exemplar> {
        self.demonstrations
            .iter()
            .map(Demonstration::generation_exemplar)
            .collect()
    }

    pub fn verification_exemplars(&self) -> Vec<Exemplar> {
        self.demonstrations
            .iter()
            .filter_map(Demonstration::verification_exemplar)
            .collect()
    }

    /// Check the size and threshold invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.demonstrations.len() > self.params.max_demonstrations {
            return Err(format!(
                "{} demonstrations exceed the limit of {}",
                self.demonstrations.len(),
                self.params.max_demonstrations
            ));
        }
        if let Some(low) = self
            .demonstrations
            .iter()
            .find(|d| !(d.score >= self.params.acceptance_threshold))
        {
            return Err(format!(
                "demonstration score {} is below threshold {}",
                low.score, self.params.acceptance_threshold
            ));
        }
        Ok(())
    }
}

impl Default for CompiledProgram {
    fn default() -> Self {
        Self::uncompiled(DEFAULT_INSTRUCTION, OrchestrationParams::default())
    }
}
