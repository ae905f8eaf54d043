//! Quality metrics for scoring pipeline outputs against gold labels.
//!
//! Scores lie in `[0.0, 1.0]`. No built-in metric accepts unconditionally.

use std::collections::HashMap;

use super::CompilationError;
use crate::signature::Fields;

pub trait Metric: Send + Sync {
    /// Identifier used on the command line.
    fn name(&self) -> &str;

    /// Score `prediction` against `gold`.
    ///
    /// Only fields present in `gold` are compared; extra predicted
    /// fields are ignored.
    fn score(&self, gold: &Fields, prediction: &Fields) -> f64;
}

/// Fraction of gold fields matched exactly after case/whitespace normalization.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactMatch;

impl Metric for ExactMatch {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn score(&self, gold: &Fields, prediction: &Fields) -> f64 {
        mean_over_gold(gold, prediction, |g, p| {
            if normalize(g) == normalize(p) {
                1.0
            } else {
                0.0
            }
        })
    }
}

/// Mean token-level F1 over gold fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenF1;

impl Metric for TokenF1 {
    fn name(&self) -> &str {
        "token_f1"
    }

    fn score(&self, gold: &Fields, prediction: &Fields) -> f64 {
        mean_over_gold(gold, prediction, token_f1)
    }
}

/// Resolve a metric by identifier.
pub fn metric_by_name(name: &str) -> Result<Box<dyn Metric>, CompilationError> {
    match name {
        "exact_match" => Ok(Box::new(ExactMatch)),
        "token_f1" => Ok(Box::new(TokenF1)),
        other => Err(CompilationError::InvalidSettings(format!(
            "unknown metric '{}' (expected exact_match or token_f1)",
            other
        ))),
    }
}

fn mean_over_gold(gold: &Fields, prediction: &Fields, field_score: impl Fn(&str, &str) -> f64) -> f64 {
    if gold.is_empty() {
        return 0.0;
    }
    let total: f64 = gold
        .iter()
        .map(|(name, g)| match prediction.get(name) {
            Some(p) => field_score(g, p),
            None => 0.0,
        })
        .sum();
    total / gold.len() as f64
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn token_f1(gold: &str, prediction: &str) -> f64 {
    let gold_tokens = normalize(gold);
    let pred_tokens = normalize(prediction);
    let gold_tokens: Vec<&str> = gold_tokens.split(' ').filter(|t| !t.is_empty()).collect();
    let pred_tokens: Vec<&str> = pred_tokens.split(' ').filter(|t| !t.is_empty()).collect();

    if gold_tokens.is_empty() || pred_tokens.is_empty() {
        return if gold_tokens.is_empty() && pred_tokens.is_empty() {
            1.0
        } else {
            0.0
        };
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in &gold_tokens {
        *counts.entry(*t).or_default() += 1;
    }
    let mut overlap = 0usize;
    for t in &pred_tokens {
        if let Some(c) = counts.get_mut(t) {
            if *c > 0 {
                *c -= 1;
                overlap += 1;
            }
        }
    }
    if overlap == 0 {
        return 0.0;
    }

    let precision = overlap as f64 / pred_tokens.len() as f64;
    let recall = overlap as f64 / gold_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}
