//! Demonstration compiler: bootstrap few-shot search over labeled examples.
//!
//! # Algorithm
//! 1. Run every example through the orchestrator with no demonstrations
//!    attached and score the real trace with the caller's metric.
//! 2. Traces scoring at or above the threshold become candidates.
//! 3. While fewer than K are accepted, re-run the still-failing examples
//!    with the current best candidates attached. Stop at K, when the
//!    round budget runs out, or when a pass accepts nothing new.
//! 4. Keep the top K by score, ties going to the earliest discovery.
//!
//! Each pass fans out over a bounded worker pool and finishes completely
//! before the next begins. Oracle calls are memoized for the duration of
//! one compilation.

mod metric;

pub use metric::{metric_by_name, ExactMatch, Metric, TokenF1};

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::oracle::CachedOracle;
use crate::pipeline::{ExecutionContext, FailureLog, Orchestrator, Task, TaskSpec};
use crate::program::{CompiledProgram, Demonstration, ProgramStore};
use crate::signature::Fields;

#[derive(Debug, Error)]
pub enum CompilationError {
    #[error(
        "Insufficient demonstrations: none reached the threshold after {passes} passes ({evaluated} evaluations)"
    )]
    InsufficientDemonstrations { passes: usize, evaluated: usize },

    #[error("Invalid compile settings: {0}")]
    InvalidSettings(String),

    #[error("Compilation cancelled")]
    Cancelled,
}

/// A task paired with its gold output fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "LabeledRecord")]
pub struct LabeledExample {
    pub task: Task,
    pub gold: Fields,
}

#[derive(Deserialize)]
struct LabeledRecord {
    #[serde(flatten)]
    task: TaskSpec,
    gold: Fields,
}

impl TryFrom<LabeledRecord> for LabeledExample {
    type Error = crate::pipeline::TaskError;

    fn try_from(record: LabeledRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            task: Task::try_from(record.task)?,
            gold: record.gold,
        })
    }
}

impl LabeledExample {
    pub fn new(task: Task, gold: Fields) -> Self {
        Self { task, gold }
    }

    /// Parse a JSONL file, one example per non-blank line.
    pub async fn load_jsonl(path: &Path) -> anyhow::Result<Vec<Self>> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut examples = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let example: Self = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid labeled example", path.display(), lineno + 1))?;
            examples.push(example);
        }
        Ok(examples)
    }
}

/// Search bounds for one compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileSettings {
    /// K: demonstrations kept in the compiled program
    pub max_demonstrations: usize,
    /// Minimum metric score for a trace to become a demonstration
    pub acceptance_threshold: f64,
    /// Resampling passes allowed after the first
    pub max_rounds: usize,
    /// Examples evaluated concurrently within a pass
    pub concurrency: usize,
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            max_demonstrations: 4,
            acceptance_threshold: 0.8,
            max_rounds: 3,
            concurrency: 4,
        }
    }
}

impl CompileSettings {
    pub fn validate(&self) -> Result<(), CompilationError> {
        if self.max_demonstrations == 0 {
            return Err(CompilationError::InvalidSettings(
                "max_demonstrations must be at least 1".to_string(),
            ));
        }
        if !(self.acceptance_threshold > 0.0 && self.acceptance_threshold <= 1.0) {
            return Err(CompilationError::InvalidSettings(format!(
                "acceptance_threshold must lie in (0, 1], got {}",
                self.acceptance_threshold
            )));
        }
        if self.concurrency == 0 {
            return Err(CompilationError::InvalidSettings(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// An accepted trace with its discovery position.
#[derive(Debug, Clone)]
struct Discovered {
    demonstration: Demonstration,
    pass: usize,
    index: usize,
}

/// Best `k` discoveries: score descending, then earliest (pass, index).
fn top_k(accepted: &[Discovered], k: usize) -> Vec<Demonstration> {
    let mut ranked: Vec<&Discovered> = accepted.iter().collect();
    ranked.sort_by(|a, b| {
        b.demonstration
            .score
            .total_cmp(&a.demonstration.score)
            .then(a.pass.cmp(&b.pass))
            .then(a.index.cmp(&b.index))
    });
    ranked
        .into_iter()
        .take(k)
        .map(|d| d.demonstration.clone())
        .collect()
}

pub struct Compiler {
    orchestrator: Arc<Orchestrator>,
    settings: CompileSettings,
}

impl Compiler {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: CompileSettings) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    /// Compile a new program from `base` without touching `base`.
    ///
    /// # Errors
    /// - `InvalidSettings` for bad settings or an empty example set
    /// - `InsufficientDemonstrations` when no trace reaches the threshold
    /// - `Cancelled` when the context is cancelled between passes or stages
    pub async fn compile(
        &self,
        base: &CompiledProgram,
        examples: &[LabeledExample],
        metric: &dyn Metric,
        ctx: &ExecutionContext,
    ) -> Result<CompiledProgram, CompilationError> {
        self.settings.validate()?;
        if examples.is_empty() {
            return Err(CompilationError::InvalidSettings(
                "no labeled examples".to_string(),
            ));
        }

        let k = self.settings.max_demonstrations;
        let threshold = self.settings.acceptance_threshold;

        // Compilation traces are not user-facing; keep them out of the real log.
        let cache = Arc::new(CachedOracle::new(ctx.oracle.clone()));
        let ctx = ctx
            .clone()
            .with_oracle(cache.clone())
            .with_failure_log(Arc::new(FailureLog::in_memory()));

        let uncompiled = base.with_demonstrations(Vec::new(), k, threshold);
        let mut accepted: Vec<Discovered> = Vec::new();
        let mut pending: Vec<usize> = (0..examples.len()).collect();
        let mut evaluated = 0usize;
        let mut passes = 0usize;

        info!(
            examples = examples.len(),
            k,
            threshold,
            metric = metric.name(),
            "Starting compilation"
        );

        for pass in 0..=self.settings.max_rounds {
            if ctx.is_cancelled() {
                return Err(CompilationError::Cancelled);
            }

            let program = if pass == 0 {
                uncompiled.clone()
            } else {
                uncompiled.with_demonstrations(top_k(&accepted, k), k, threshold)
            };

            let mut results: Vec<(usize, Result<Option<Demonstration>, PipelineError>)> =
                stream::iter(pending.iter().copied())
                    .map(|index| {
                        let program = &program;
                        let ctx = &ctx;
                        async move {
                            let result = self.evaluate(&examples[index], program, metric, ctx).await;
                            (index, result)
                        }
                    })
                    .buffer_unordered(self.settings.concurrency)
                    .collect()
                    .await;
            results.sort_by_key(|(index, _)| *index);

            passes += 1;
            evaluated += results.len();
            let mut newly_accepted = 0usize;
            for (index, result) in results {
                match result {
                    Ok(Some(demonstration)) if demonstration.score >= threshold => {
                        debug!(pass, index, score = demonstration.score, "Accepted trace");
                        accepted.push(Discovered {
                            demonstration,
                            pass,
                            index,
                        });
                        pending.retain(|&i| i != index);
                        newly_accepted += 1;
                    }
                    Ok(_) => {}
                    Err(PipelineError::Cancelled(_)) => return Err(CompilationError::Cancelled),
                    Err(e) => debug!(pass, index, "Trace discarded: {}", e),
                }
            }

            info!(
                pass,
                newly_accepted,
                accepted = accepted.len(),
                pending = pending.len(),
                "Compilation pass finished"
            );

            if accepted.len() >= k || pending.is_empty() || newly_accepted == 0 {
                break;
            }
        }

        if accepted.is_empty() {
            return Err(CompilationError::InsufficientDemonstrations { passes, evaluated });
        }

        let program = uncompiled.with_demonstrations(top_k(&accepted, k), k, threshold);
        info!(
            passes,
            evaluated,
            demonstrations = program.demonstrations.len(),
            cache_hits = cache.hits(),
            cache_misses = cache.misses(),
            "Compilation finished"
        );
        Ok(program)
    }

    /// Compile and commit atomically; the store is untouched on failure.
    pub async fn compile_and_commit(
        &self,
        store: &ProgramStore,
        examples: &[LabeledExample],
        metric: &dyn Metric,
        ctx: &ExecutionContext,
    ) -> Result<Arc<CompiledProgram>, PipelineError> {
        let base = store.current().await;
        let program = self.compile(&base, examples, metric, ctx).await?;
        Ok(store.commit(program).await?)
    }

    /// Run one example and turn its trace into a scored demonstration.
    ///
    /// Flagged traces yield `None`.
    async fn evaluate(
        &self,
        example: &LabeledExample,
        program: &CompiledProgram,
        metric: &dyn Metric,
        ctx: &ExecutionContext,
    ) -> Result<Option<Demonstration>, PipelineError> {
        let outcome = self.orchestrator.run(&example.task, program, ctx).await?;
        let Some(output) = outcome.output else {
            return Ok(None);
        };

        let score = metric.score(&example.gold, output.fields());
        let candidate = outcome
            .candidate
            .map(|c| c.fields().clone())
            .unwrap_or_else(|| output.fields().clone());
        Ok(Some(Demonstration {
            inputs: example.task.inputs(),
            evidence: outcome.evidence,
            candidate,
            outputs: output.fields().clone(),
            verification: outcome.verification,
            score,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceSnippet, EvidenceSource, RetrievalError};
    use crate::oracle::{LanguageOracle, OracleError, Prompt};
    use crate::pipeline::{CORRECTION_FIELD, RATIONALE_FIELD, TASK_FIELD, VERDICT_FIELD};
    use crate::signature::FieldSpec;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Scores a trace by the number written into its `answer` field.
    struct AnswerAsScore;

    impl Metric for AnswerAsScore {
        fn name(&self) -> &str {
            "answer_as_score"
        }

        fn score(&self, _gold: &Fields, prediction: &Fields) -> f64 {
            prediction
                .get("answer")
                .and_then(|a| a.parse().ok())
                .unwrap_or(0.0)
        }
    }

    /// Answers each task with a fixed score, or its primed score once enough
    /// demonstrations are attached.
    struct ScoreOracle {
        cold: HashMap<String, &'static str>,
        primed: HashMap<String, (usize, &'static str)>,
        generate_calls: AtomicU32,
    }

    impl ScoreOracle {
        fn new(cold: &[(&str, &'static str)], primed: &[(&str, &'static str)]) -> Arc<Self> {
            let primed: Vec<_> = primed.iter().map(|(k, v)| (*k, 1, *v)).collect();
            Self::staged(cold, &primed)
        }

        /// `primed` entries are `(task, demonstrations needed, answer)`.
        fn staged(cold: &[(&str, &'static str)], primed: &[(&str, usize, &'static str)]) -> Arc<Self> {
            Arc::new(Self {
                cold: cold.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                primed: primed.iter().map(|(k, n, v)| (k.to_string(), (*n, *v))).collect(),
                generate_calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LanguageOracle for ScoreOracle {
        async fn complete(&self, prompt: &Prompt) -> Result<Fields, OracleError> {
            let mut out = Fields::new();
            if prompt.outputs.iter().any(|f| f.name == VERDICT_FIELD) {
                out.insert(VERDICT_FIELD.into(), "Consistent".into());
                out.insert("rationale".into(), "matches [1]".into());
                out.insert("correction".into(), "{}".into());
                return Ok(out);
            }
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            let task = prompt.inputs.get(TASK_FIELD).cloned().unwrap_or_default();
            let attached = prompt.demonstrations.len();
            let answer = self
                .primed
                .get(&task)
                .filter(|(needed, _)| attached >= *needed)
                .map(|(_, answer)| answer)
                .or_else(|| self.cold.get(&task));
            out.insert("answer".into(), answer.copied().unwrap_or("0").into());
            Ok(out)
        }
    }

    /// Generates a removed method; the verifier corrects it against the evidence.
    struct CorrectingOracle;

    #[async_trait]
    impl LanguageOracle for CorrectingOracle {
        async fn complete(&self, prompt: &Prompt) -> Result<Fields, OracleError> {
            let mut out = Fields::new();
            if prompt.outputs.iter().any(|f| f.name == VERDICT_FIELD) {
                out.insert(VERDICT_FIELD.into(), "Inconsistent".into());
                out.insert(RATIONALE_FIELD.into(), "[1] says iteritems() was removed".into());
                out.insert(CORRECTION_FIELD.into(), r#"{"code": "d.items()"}"#.into());
            } else {
                out.insert("code".into(), "d.iteritems()".into());
            }
            Ok(out)
        }
    }

    struct OneSnippet;

    #[async_trait]
    impl EvidenceSource for OneSnippet {
        async fn search(&self, _q: &str, _k: usize) -> Result<Vec<EvidenceSnippet>, RetrievalError> {
            Ok(vec![EvidenceSnippet::new("doc", "reference text", 1.0)])
        }
    }

    fn example(name: &str) -> LabeledExample {
        LabeledExample::new(
            Task::new(name, name, vec![FieldSpec::named("answer")]).unwrap(),
            Fields::new(),
        )
    }

    fn compiler(k: usize, threshold: f64) -> Compiler {
        Compiler::new(
            Arc::new(Orchestrator::default()),
            CompileSettings {
                max_demonstrations: k,
                acceptance_threshold: threshold,
                max_rounds: 3,
                concurrency: 2,
            },
        )
    }

    fn ctx(oracle: Arc<ScoreOracle>) -> ExecutionContext {
        ExecutionContext::new(oracle, Arc::new(OneSnippet))
    }

    fn answers(program: &CompiledProgram) -> Vec<&str> {
        program
            .demonstrations
            .iter()
            .map(|d| d.outputs["answer"].as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_first_pass_keeps_top_k_without_resampling() {
        let oracle = ScoreOracle::new(
            &[("a", "0.85"), ("b", "0.95"), ("c", "0.5"), ("d", "0.9"), ("e", "0.8")],
            &[("c", "1.0")],
        );
        let examples: Vec<_> = ["a", "b", "c", "d", "e"].iter().map(|n| example(n)).collect();

        let program = compiler(3, 0.8)
            .compile(&CompiledProgram::default(), &examples, &AnswerAsScore, &ctx(oracle.clone()))
            .await
            .unwrap();

        assert_eq!(answers(&program), vec!["0.95", "0.9", "0.85"]);
        assert_eq!(program.params.max_demonstrations, 3);
        assert_eq!(program.params.acceptance_threshold, 0.8);
        assert!(program.check_invariants().is_ok());
        assert_eq!(oracle.generate_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_ties_go_to_earliest_discovery() {
        let oracle = ScoreOracle::new(&[("a", "0.9"), ("b", "0.9"), ("c", "0.9")], &[]);
        let examples: Vec<_> = ["a", "b", "c"].iter().map(|n| example(n)).collect();

        let program = compiler(2, 0.8)
            .compile(&CompiledProgram::default(), &examples, &AnswerAsScore, &ctx(oracle))
            .await
            .unwrap();
        let tasks: Vec<_> = program
            .demonstrations
            .iter()
            .map(|d| d.inputs[TASK_FIELD].as_str())
            .collect();
        assert_eq!(tasks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_resampling_primes_failing_examples() {
        let oracle = ScoreOracle::new(&[("easy", "0.9"), ("hard", "0.2")], &[("hard", "0.85")]);
        let examples = vec![example("easy"), example("hard")];

        let program = compiler(2, 0.8)
            .compile(&CompiledProgram::default(), &examples, &AnswerAsScore, &ctx(oracle.clone()))
            .await
            .unwrap();

        assert_eq!(answers(&program), vec!["0.9", "0.85"]);
        // two cold generations, then one primed retry for "hard"
        assert_eq!(oracle.generate_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_when_a_pass_adds_nothing() {
        let oracle = ScoreOracle::new(&[("easy", "0.9"), ("hard", "0.2")], &[]);
        let examples = vec![example("easy"), example("hard")];

        let program = compiler(2, 0.8)
            .compile(&CompiledProgram::default(), &examples, &AnswerAsScore, &ctx(oracle.clone()))
            .await
            .unwrap();

        assert_eq!(answers(&program), vec!["0.9"]);
        assert_eq!(oracle.generate_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_when_round_budget_runs_out() {
        // "c" would need two demonstrations, which only a third pass could offer
        let oracle = ScoreOracle::staged(
            &[("a", "0.9"), ("b", "0.2"), ("c", "0.2")],
            &[("b", 1, "0.85"), ("c", 2, "0.95")],
        );
        let examples = vec![example("a"), example("b"), example("c")];
        let compiler = Compiler::new(
            Arc::new(Orchestrator::default()),
            CompileSettings {
                max_demonstrations: 3,
                acceptance_threshold: 0.8,
                max_rounds: 1,
                concurrency: 2,
            },
        );

        let program = compiler
            .compile(&CompiledProgram::default(), &examples, &AnswerAsScore, &ctx(oracle.clone()))
            .await
            .unwrap();

        assert_eq!(answers(&program), vec!["0.9", "0.85"]);
        assert_eq!(program.params.max_demonstrations, 3);
        assert!(program.check_invariants().is_ok());
        // three cold generations, then "b" and "c" once more with one demonstration
        assert_eq!(oracle.generate_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_corrected_trace_keeps_original_candidate() {
        let example = LabeledExample::new(
            Task::new("iter-map", "iterate a mapping", vec![FieldSpec::named("code")]).unwrap(),
            Fields::from([("code".to_string(), "d.items()".to_string())]),
        );
        let ctx = ExecutionContext::new(Arc::new(CorrectingOracle), Arc::new(OneSnippet));

        let program = compiler(1, 0.8)
            .compile(&CompiledProgram::default(), &[example], &ExactMatch, &ctx)
            .await
            .unwrap();

        let demo = &program.demonstrations[0];
        assert_eq!(demo.candidate["code"], "d.iteritems()");
        assert_eq!(demo.outputs["code"], "d.items()");

        let verification = &program.verification_exemplars()[0];
        assert_eq!(verification.inputs["candidate"], r#"{"code":"d.iteritems()"}"#);
        assert_eq!(verification.outputs[VERDICT_FIELD], "Inconsistent");
        assert_eq!(program.generation_exemplars()[0].outputs["code"], "d.items()");
    }

    #[tokio::test]
    async fn test_insufficient_demonstrations() {
        let oracle = ScoreOracle::new(&[("a", "0.1"), ("b", "0.3")], &[]);
        let examples = vec![example("a"), example("b")];

        let err = compiler(2, 0.8)
            .compile(&CompiledProgram::default(), &examples, &AnswerAsScore, &ctx(oracle))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CompilationError::InsufficientDemonstrations { passes: 1, evaluated: 2 }
        ));
    }

    #[tokio::test]
    async fn test_compilation_is_deterministic() {
        let cold = [("a", "0.85"), ("b", "0.95"), ("c", "0.5"), ("d", "0.9")];
        let primed = [("c", "0.99")];
        let examples: Vec<_> = ["a", "b", "c", "d"].iter().map(|n| example(n)).collect();

        let first = compiler(4, 0.8)
            .compile(
                &CompiledProgram::default(),
                &examples,
                &AnswerAsScore,
                &ctx(ScoreOracle::new(&cold, &primed)),
            )
            .await
            .unwrap();
        let second = compiler(4, 0.8)
            .compile(
                &CompiledProgram::default(),
                &examples,
                &AnswerAsScore,
                &ctx(ScoreOracle::new(&cold, &primed)),
            )
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(answers(&first), vec!["0.99", "0.95", "0.9", "0.85"]);
    }

    #[tokio::test]
    async fn test_invalid_settings() {
        let oracle = ScoreOracle::new(&[], &[]);
        let examples = vec![example("a")];
        for (k, threshold) in [(0, 0.8), (2, 0.0), (2, 1.5), (2, f64::NAN)] {
            let err = compiler(k, threshold)
                .compile(&CompiledProgram::default(), &examples, &AnswerAsScore, &ctx(oracle.clone()))
                .await
                .unwrap_err();
            assert!(matches!(err, CompilationError::InvalidSettings(_)));
        }
        let err = compiler(2, 0.8)
            .compile(&CompiledProgram::default(), &[], &AnswerAsScore, &ctx(oracle))
            .await
            .unwrap_err();
        assert!(matches!(err, CompilationError::InvalidSettings(_)));
    }

    #[tokio::test]
    async fn test_cancelled_compilation() {
        let oracle = ScoreOracle::new(&[("a", "0.9")], &[]);
        let token = CancellationToken::new();
        token.cancel();
        let err = compiler(1, 0.8)
            .compile(
                &CompiledProgram::default(),
                &[example("a")],
                &AnswerAsScore,
                &ctx(oracle).with_cancel_token(token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CompilationError::Cancelled));
    }

    #[tokio::test]
    async fn test_failed_compile_keeps_committed_program() {
        let store = ProgramStore::in_memory(CompiledProgram::default());
        let good = ScoreOracle::new(&[("a", "0.9")], &[]);
        let committed = compiler(1, 0.8)
            .compile_and_commit(&store, &[example("a")], &AnswerAsScore, &ctx(good))
            .await
            .unwrap();
        assert_eq!(committed.version, 1);

        let bad = ScoreOracle::new(&[("a", "0.1")], &[]);
        let err = compiler(1, 0.8)
            .compile_and_commit(&store, &[example("a")], &AnswerAsScore, &ctx(bad))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CompilationFailure(_)));

        let current = store.current().await;
        assert_eq!(current.version, 1);
        assert_eq!(answers(&current), vec!["0.9"]);
    }

    #[tokio::test]
    async fn test_load_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("examples.jsonl");
        tokio::fs::write(
            &path,
            concat!(
                r#"{"id": "iter-map", "description": "iterate a mapping", "outputs": [{"name": "code"}], "gold": {"code": "d.items()"}}"#,
                "\n\n",
                r#"{"description": "capital of France", "outputs": [{"name": "answer"}], "gold": {"answer": "Paris"}}"#,
                "\n"
            ),
        )
        .await
        .unwrap();

        let examples = LabeledExample::load_jsonl(&path).await.unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].task.id().as_str(), "iter-map");
        assert_eq!(examples[1].gold["answer"], "Paris");

        tokio::fs::write(&path, r#"{"description": "", "outputs": [{"name": "x"}], "gold": {}}"#)
            .await
            .unwrap();
        assert!(LabeledExample::load_jsonl(&path).await.is_err());
    }
}
