//! Candidate generation.
//!
//! Generators never retrieve; grounding is the verifier's job. Any
//! implementation of [`Generator`] can be dropped into the orchestrator.

use async_trait::async_trait;

use super::context::ExecutionContext;
use super::task::{Candidate, Provenance, Task};
use crate::oracle::{OracleError, Prompt};
use crate::program::CompiledProgram;

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a candidate for `task`.
    ///
    /// # Postconditions
    /// - `Ok(c)`: `c` validates against `task.schema()`
    ///
    /// # Errors
    /// `OracleError` once the call policy is exhausted, or immediately for
    /// output that does not fit the schema.
    async fn generate(
        &self,
        task: &Task,
        program: &CompiledProgram,
        ctx: &ExecutionContext,
    ) -> Result<Candidate, OracleError>;
}

/// Generator backed by the context's language oracle.
#[derive(Debug, Default, Clone)]
pub struct OracleGenerator;

impl OracleGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn prompt(task: &Task, program: &CompiledProgram) -> Prompt {
        Prompt::new(
            program.instruction.clone(),
            task.inputs(),
            task.schema().outputs().to_vec(),
        )
        .with_demonstrations(program.generation_exemplars())
    }
}

#[async_trait]
impl Generator for OracleGenerator {
    async fn generate(
        &self,
        task: &Task,
        program: &CompiledProgram,
        ctx: &ExecutionContext,
    ) -> Result<Candidate, OracleError> {
        let prompt = Self::prompt(task, program);
        let fields = ctx
            .oracle_policy
            .run("generate", || ctx.oracle.complete(&prompt))
            .await?;

        let provenance = Provenance::Generator {
            demonstrations: prompt.demonstrations.len(),
        };
        Candidate::for_task(task, &fields, provenance).map_err(|e| {
            OracleError::non_conforming(format!("generated output does not fit schema: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceSnippet, EvidenceSource, RetrievalError};
    use crate::oracle::{LanguageOracle, OracleErrorKind};
    use crate::program::{Demonstration, OrchestrationParams};
    use crate::signature::{FieldSpec, Fields};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct NoEvidence;

    #[async_trait]
    impl EvidenceSource for NoEvidence {
        async fn search(&self, _q: &str, _k: usize) -> Result<Vec<EvidenceSnippet>, RetrievalError> {
            Ok(vec![])
        }
    }

    struct FixedOracle {
        reply: Fields,
        calls: AtomicU32,
        demos_seen: AtomicU32,
    }

    #[async_trait]
    impl LanguageOracle for FixedOracle {
        async fn complete(&self, prompt: &Prompt) -> Result<Fields, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.demos_seen
                .store(prompt.demonstrations.len() as u32, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn task() -> Task {
        Task::new("t1", "iterate a dict", vec![FieldSpec::named("code")]).unwrap()
    }

    fn ctx(oracle: Arc<FixedOracle>) -> ExecutionContext {
        ExecutionContext::new(oracle, Arc::new(NoEvidence))
    }

    #[tokio::test]
    async fn test_generate_attaches_demonstrations() {
        let mut reply = Fields::new();
        reply.insert("code".into(), "for k, v in d.items(): pass".into());
        let oracle = Arc::new(FixedOracle {
            reply: reply.clone(),
            calls: AtomicU32::new(0),
            demos_seen: AtomicU32::new(0),
        });

        let program = CompiledProgram::uncompiled("go", OrchestrationParams::default())
            .with_demonstrations(
                vec![Demonstration {
                    inputs: task().inputs(),
                    evidence: vec![],
                    candidate: reply.clone(),
                    outputs: reply,
                    verification: None,
                    score: 1.0,
                }],
                2,
                0.5,
            );

        let candidate = OracleGenerator::new()
            .generate(&task(), &program, &ctx(oracle.clone()))
            .await
            .unwrap();
        assert_eq!(candidate.provenance(), Provenance::Generator { demonstrations: 1 });
        assert_eq!(oracle.demos_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_not_retried() {
        let mut reply = Fields::new();
        reply.insert("code".into(), "   ".into());
        let oracle = Arc::new(FixedOracle {
            reply,
            calls: AtomicU32::new(0),
            demos_seen: AtomicU32::new(0),
        });

        let err = OracleGenerator::new()
            .generate(&task(), &CompiledProgram::default(), &ctx(oracle.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, OracleErrorKind::NonConforming);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }
}
