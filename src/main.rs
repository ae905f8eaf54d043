//! verigen - command line entry point

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use verigen::compiler::{metric_by_name, Compiler, LabeledExample};
use verigen::config::Config;
use verigen::evidence::{CorpusEvidence, EvidenceSource};
use verigen::llm::OpenRouterClient;
use verigen::oracle::ChatOracle;
use verigen::pipeline::{ExecutionContext, FailureLog, Orchestrator, Task, TaskId, TerminalState};
use verigen::program::{CompiledProgram, ProgramStore, DEFAULT_INSTRUCTION};
use verigen::signature::FieldSpec;

#[derive(Parser, Debug)]
#[command(name = "verigen")]
#[command(about = "Self-verifying generation with compiled demonstrations", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run one task against the committed program
    Run {
        /// What the task should produce
        description: String,

        /// Output fields to generate
        #[arg(required = true, num_args = 1..)]
        outputs: Vec<String>,
    },
    /// Compile labeled examples into a new program and commit it
    Compile {
        /// JSONL file of labeled examples
        examples: PathBuf,

        /// Scoring metric (exact_match or token_f1)
        metric: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries results
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "verigen=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    info!("Loaded configuration: model={}", config.model);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping at the next stage boundary");
                cancel.cancel();
            }
        });
    }

    let ctx = build_context(&config, cancel).await?;
    let store = ProgramStore::open(
        config.program_path.clone(),
        CompiledProgram::uncompiled(DEFAULT_INSTRUCTION, config.orchestration_params()),
    )
    .await
    .with_context(|| format!("opening program store at {}", config.program_path.display()))?;

    match cli.command {
        Command::Run {
            description,
            outputs,
        } => run_task(&ctx, &store, &description, &outputs).await,
        Command::Compile { examples, metric } => {
            compile(&config, &ctx, &store, &examples, &metric).await
        }
    }
}

async fn build_context(config: &Config, cancel: CancellationToken) -> anyhow::Result<ExecutionContext> {
    let llm = Arc::new(OpenRouterClient::new(config.api_key.clone()));
    let oracle = Arc::new(ChatOracle::new(llm, config.model.clone()).with_options(config.chat_options()));

    let evidence: Arc<dyn EvidenceSource> = match &config.evidence_corpus_path {
        Some(path) => Arc::new(
            CorpusEvidence::load(path)
                .await
                .with_context(|| format!("loading evidence corpus {}", path.display()))?,
        ),
        None => {
            warn!("EVIDENCE_CORPUS_PATH not set; every task will be unverifiable");
            Arc::new(CorpusEvidence::new(Vec::new()))
        }
    };

    let failure_log = FailureLog::open(config.failure_log_path.clone())
        .await
        .with_context(|| format!("opening failure log {}", config.failure_log_path.display()))?;

    Ok(ExecutionContext::new(oracle, evidence)
        .with_policies(config.call_policy(), config.call_policy())
        .with_failure_log(Arc::new(failure_log))
        .with_cancel_token(cancel))
}

async fn run_task(
    ctx: &ExecutionContext,
    store: &ProgramStore,
    description: &str,
    outputs: &[String],
) -> anyhow::Result<()> {
    let outputs: Vec<FieldSpec> = outputs.iter().map(|name| FieldSpec::named(name.as_str())).collect();
    let task = Task::new(TaskId::new(), description, outputs)?;
    let program = store.current().await;
    if !program.is_compiled() {
        info!("Running uncompiled program");
    }

    let outcome = Orchestrator::default().run(&task, &program, ctx).await?;

    println!("task: {}", outcome.task_id);
    println!("state: {}", outcome.state.label());
    if let Some(output) = &outcome.output {
        println!("{}", serde_json::to_string_pretty(output.fields())?);
    }
    if let TerminalState::Flagged(reason) = &outcome.state {
        bail!("task flagged: {}", reason);
    }
    Ok(())
}

async fn compile(
    config: &Config,
    ctx: &ExecutionContext,
    store: &ProgramStore,
    examples_path: &Path,
    metric_name: &str,
) -> anyhow::Result<()> {
    let metric = metric_by_name(metric_name)?;
    let examples = LabeledExample::load_jsonl(examples_path).await?;
    info!(
        "Loaded {} labeled examples from {}",
        examples.len(),
        examples_path.display()
    );

    let compiler = Compiler::new(Arc::new(Orchestrator::default()), config.compile_settings());
    match compiler
        .compile_and_commit(store, &examples, metric.as_ref(), ctx)
        .await
    {
        Ok(program) => {
            println!(
                "committed program v{} with {} demonstrations to {}",
                program.version,
                program.demonstrations.len(),
                config.program_path.display()
            );
            Ok(())
        }
        Err(e) => {
            let previous = store.current().await;
            bail!(
                "{}; keeping program v{} ({} demonstrations)",
                e,
                previous.version,
                previous.demonstrations.len()
            )
        }
    }
}
