//! Configuration management for verigen.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required. Your OpenRouter API key.
//! - `VERIGEN_MODEL` - Optional. Model for generation and verification. Defaults to `openai/gpt-4o-mini`.
//! - `VERIGEN_TEMPERATURE` - Optional. Sampling temperature for oracle calls. Defaults to `0.0`.
//! - `ORACLE_MAX_TOKENS` - Optional. Completion token cap per oracle call. Unset means provider default.
//! - `ORACLE_TIMEOUT_SECS` - Optional. Per-call timeout for oracle and evidence calls. Defaults to `60`.
//! - `ORACLE_MAX_RETRIES` - Optional. Retries after the first attempt. Defaults to `2`.
//! - `RETRY_BASE_DELAY_MS` - Optional. Backoff base delay. Defaults to `500`.
//! - `RETRY_MAX_DELAY_MS` - Optional. Backoff ceiling. Defaults to `30000`.
//! - `EVIDENCE_K` - Optional. Snippets requested per task. Defaults to `5`.
//! - `DEMO_K` - Optional. Maximum demonstrations per compiled program. Defaults to `4`.
//! - `ACCEPTANCE_THRESHOLD` - Optional. Metric floor for demonstrations, in (0, 1]. Defaults to `0.8`.
//! - `MAX_BOOTSTRAP_ROUNDS` - Optional. Resampling passes after the first. Defaults to `3`.
//! - `COMPILE_CONCURRENCY` - Optional. Examples evaluated in parallel. Defaults to `4`.
//! - `PROGRAM_PATH` - Optional. Compiled program file. Defaults to `.verigen/program.json`.
//! - `FAILURE_LOG_PATH` - Optional. Failure log file. Defaults to `.verigen/failures.jsonl`.
//! - `EVIDENCE_CORPUS_PATH` - Optional. JSON array of `{source_id, text}` documents.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::compiler::CompileSettings;
use crate::llm::ChatOptions;
use crate::program::OrchestrationParams;
use crate::retry::CallPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// LLM model identifier (OpenRouter format)
    pub model: String,

    pub temperature: f64,
    pub max_tokens: Option<u64>,

    /// Timeout for each remote call
    pub call_timeout: Duration,

    /// Retries after the first attempt
    pub max_retries: u32,

    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// Snippets requested per task
    pub evidence_k: usize,

    /// K: demonstrations per compiled program
    pub max_demonstrations: usize,

    /// Minimum metric score for a demonstration
    pub acceptance_threshold: f64,

    /// Resampling passes after the first
    pub max_bootstrap_rounds: usize,

    /// Worker-pool width during compilation
    pub compile_concurrency: usize,

    pub program_path: PathBuf,
    pub failure_log_path: PathBuf,
    pub evidence_corpus_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set,
    /// and `ConfigError::InvalidValue` for unparseable or out-of-range values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup("OPENROUTER_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let model = lookup("VERIGEN_MODEL").unwrap_or_else(|| "openai/gpt-4o-mini".to_string());
        let temperature = parse_or(&lookup, "VERIGEN_TEMPERATURE", 0.0)?;
        let max_tokens = match lookup("ORACLE_MAX_TOKENS") {
            Some(_) => Some(parse_or(&lookup, "ORACLE_MAX_TOKENS", 0)?),
            None => None,
        };

        let call_timeout = Duration::from_secs(parse_or(&lookup, "ORACLE_TIMEOUT_SECS", 60)?);
        let max_retries = parse_or(&lookup, "ORACLE_MAX_RETRIES", 2)?;
        let retry_base_delay = Duration::from_millis(parse_or(&lookup, "RETRY_BASE_DELAY_MS", 500)?);
        let retry_max_delay = Duration::from_millis(parse_or(&lookup, "RETRY_MAX_DELAY_MS", 30_000)?);

        let evidence_k = parse_or(&lookup, "EVIDENCE_K", 5)?;
        let max_demonstrations = parse_or(&lookup, "DEMO_K", 4)?;
        let acceptance_threshold = parse_or(&lookup, "ACCEPTANCE_THRESHOLD", 0.8)?;
        let max_bootstrap_rounds = parse_or(&lookup, "MAX_BOOTSTRAP_ROUNDS", 3)?;
        let compile_concurrency = parse_or(&lookup, "COMPILE_CONCURRENCY", 4)?;

        let program_path = lookup("PROGRAM_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".verigen/program.json"));
        let failure_log_path = lookup("FAILURE_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".verigen/failures.jsonl"));
        let evidence_corpus_path = lookup("EVIDENCE_CORPUS_PATH").map(PathBuf::from);

        let config = Self {
            api_key,
            model,
            temperature,
            max_tokens,
            call_timeout,
            max_retries,
            retry_base_delay,
            retry_max_delay,
            evidence_k,
            max_demonstrations,
            acceptance_threshold,
            max_bootstrap_rounds,
            compile_concurrency,
            program_path,
            failure_log_path,
            evidence_corpus_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, model: String, state_dir: PathBuf) -> Self {
        Self {
            api_key,
            model,
            temperature: 0.0,
            max_tokens: None,
            call_timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            evidence_k: 5,
            max_demonstrations: 4,
            acceptance_threshold: 0.8,
            max_bootstrap_rounds: 3,
            compile_concurrency: 4,
            program_path: state_dir.join("program.json"),
            failure_log_path: state_dir.join("failures.jsonl"),
            evidence_corpus_path: None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.acceptance_threshold > 0.0 && self.acceptance_threshold <= 1.0) {
            return Err(ConfigError::InvalidValue(
                "ACCEPTANCE_THRESHOLD".to_string(),
                format!("{} is outside (0, 1]", self.acceptance_threshold),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidValue(
                "VERIGEN_TEMPERATURE".to_string(),
                format!("{} is outside [0, 2]", self.temperature),
            ));
        }
        if self.max_tokens == Some(0) {
            return Err(ConfigError::InvalidValue(
                "ORACLE_MAX_TOKENS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("EVIDENCE_K", self.evidence_k),
            ("DEMO_K", self.max_demonstrations),
            ("COMPILE_CONCURRENCY", self.compile_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "must be at least 1".to_string(),
                ));
            }
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(ConfigError::InvalidValue(
                "RETRY_MAX_DELAY_MS".to_string(),
                "must not be below RETRY_BASE_DELAY_MS".to_string(),
            ));
        }
        Ok(())
    }

    /// Timeout and retry policy shared by oracle and evidence calls.
    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            timeout: self.call_timeout,
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }

    /// Sampling options for every oracle call.
    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: Some(self.temperature),
            max_tokens: self.max_tokens,
        }
    }

    pub fn orchestration_params(&self) -> OrchestrationParams {
        OrchestrationParams {
            evidence_k: self.evidence_k,
            max_demonstrations: self.max_demonstrations,
            acceptance_threshold: self.acceptance_threshold,
        }
    }

    pub fn compile_settings(&self) -> CompileSettings {
        CompileSettings {
            max_demonstrations: self.max_demonstrations,
            acceptance_threshold: self.acceptance_threshold,
            max_rounds: self.max_bootstrap_rounds,
            concurrency: self.compile_concurrency,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = assert_ok!(Config::from_lookup(lookup(&[("OPENROUTER_API_KEY", "sk-test")])));
        assert_eq!(config.model, "openai/gpt-4o-mini");
        assert_eq!(config.chat_options().temperature, Some(0.0));
        assert!(config.chat_options().max_tokens.is_none());
        assert_eq!(config.call_policy(), CallPolicy::default());
        assert_eq!(config.orchestration_params(), OrchestrationParams::default());
        assert_eq!(config.compile_settings(), CompileSettings::default());
        assert_eq!(config.program_path, PathBuf::from(".verigen/program.json"));
        assert!(config.evidence_corpus_path.is_none());
    }

    #[test]
    fn test_missing_api_key() {
        let err = assert_err!(Config::from_lookup(lookup(&[])));
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn test_overrides() {
        let config = assert_ok!(Config::from_lookup(lookup(&[
            ("OPENROUTER_API_KEY", "sk-test"),
            ("ORACLE_MAX_RETRIES", "5"),
            ("DEMO_K", "2"),
            ("ACCEPTANCE_THRESHOLD", "1.0"),
            ("EVIDENCE_CORPUS_PATH", "docs.json"),
            ("VERIGEN_TEMPERATURE", "0.7"),
            ("ORACLE_MAX_TOKENS", "512"),
        ])));
        assert_eq!(config.chat_options().temperature, Some(0.7));
        assert_eq!(config.chat_options().max_tokens, Some(512));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.compile_settings().max_demonstrations, 2);
        assert_eq!(config.acceptance_threshold, 1.0);
        assert_eq!(config.evidence_corpus_path, Some(PathBuf::from("docs.json")));
    }

    #[test]
    fn test_invalid_values() {
        for (var, value) in [
            ("ACCEPTANCE_THRESHOLD", "0"),
            ("ACCEPTANCE_THRESHOLD", "1.2"),
            ("ACCEPTANCE_THRESHOLD", "NaN"),
            ("DEMO_K", "0"),
            ("DEMO_K", "-1"),
            ("ORACLE_TIMEOUT_SECS", "soon"),
            ("VERIGEN_TEMPERATURE", "3"),
            ("ORACLE_MAX_TOKENS", "0"),
        ] {
            let err = assert_err!(Config::from_lookup(lookup(&[
                ("OPENROUTER_API_KEY", "sk-test"),
                (var, value),
            ])));
            match err {
                ConfigError::InvalidValue(name, _) => assert_eq!(name, var),
                other => panic!("expected InvalidValue for {}, got {:?}", var, other),
            }
        }
    }
}
