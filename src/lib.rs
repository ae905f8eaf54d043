//! # verigen
//!
//! Self-verifying generation pipeline with a demonstration-bootstrapping
//! compiler.
//!
//! This library provides:
//! - An orchestrator that grounds each generated answer in retrieved
//!   evidence, judges consistency and repairs contradictions
//! - A compiler that searches for few-shot demonstrations which make that
//!   loop reliable, and a store that swaps compiled programs in atomically
//! - An append-only failure log of every answer that was not accepted as-is
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │            Compiler              │
//!        │  (bootstrap passes, offline)     │
//!        └────────────────┬─────────────────┘
//!                         │ runs many times
//!                         ▼
//!        ┌──────────────────────────────────┐
//!        │          Orchestrator            │
//!        │ Generator → Evidence → Verifier  │
//!        └───────┬────────────────┬─────────┘
//!                │                │
//!                ▼                ▼
//!        ┌──────────────┐  ┌──────────────┐
//!        │   Language   │  │   Evidence   │
//!        │    Oracle    │  │    Source    │
//!        └──────────────┘  └──────────────┘
//! ```
//!
//! ## Task Flow
//! 1. Generate a candidate with the committed program's demonstrations
//! 2. Retrieve evidence for the task and candidate
//! 3. Verify: Consistent → Accepted, Inconsistent + valid fix → Corrected,
//!    anything else → Flagged
//! 4. Log every non-accepted outcome
//!
//! ## Modules
//! - `pipeline`: tasks, generator, verifier, orchestrator, failure log
//! - `compiler`: metrics and the demonstration search
//! - `program`: compiled programs and their store
//! - `oracle` / `llm`: language oracle over an OpenRouter chat client
//! - `evidence`: evidence sources and snippet ordering

pub mod compiler;
pub mod config;
pub mod error;
pub mod evidence;
pub mod llm;
pub mod oracle;
pub mod pipeline;
pub mod program;
pub mod retry;
pub mod signature;

pub use compiler::{CompilationError, CompileSettings, Compiler, LabeledExample, Metric};
pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{ExecutionContext, Orchestrator, Outcome, Task, TerminalState};
pub use program::{CompiledProgram, ProgramStore};
