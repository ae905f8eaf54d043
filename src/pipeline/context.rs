//! Execution context passed explicitly to every pipeline and compiler call.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::failure_log::FailureLog;
use crate::evidence::EvidenceSource;
use crate::oracle::LanguageOracle;
use crate::retry::CallPolicy;

/// Collaborators and call policies for one run.
///
/// # Thread Safety
/// Cheap to clone; every field is shared. Independent tasks may run
/// concurrently against the same context.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Language oracle for generation and verification
    pub oracle: Arc<dyn LanguageOracle>,

    /// Evidence source for grounding
    pub evidence: Arc<dyn EvidenceSource>,

    /// Timeout/retry policy for oracle calls
    pub oracle_policy: CallPolicy,

    /// Timeout/retry policy for evidence calls
    pub retrieval_policy: CallPolicy,

    /// Audit trail for non-accepted outcomes
    pub failure_log: Arc<FailureLog>,

    /// Optional cancellation token, checked between stages.
    pub cancel_token: Option<CancellationToken>,
}

impl ExecutionContext {
    pub fn new(oracle: Arc<dyn LanguageOracle>, evidence: Arc<dyn EvidenceSource>) -> Self {
        Self {
            oracle,
            evidence,
            oracle_policy: CallPolicy::default(),
            retrieval_policy: CallPolicy::default(),
            failure_log: Arc::new(FailureLog::in_memory()),
            cancel_token: None,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn LanguageOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_policies(mut self, oracle_policy: CallPolicy, retrieval_policy: CallPolicy) -> Self {
        self.oracle_policy = oracle_policy;
        self.retrieval_policy = retrieval_policy;
        self
    }

    pub fn with_failure_log(mut self, failure_log: Arc<FailureLog>) -> Self {
        self.failure_log = failure_log;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token
            .as_ref()
            .map_or(false, |token| token.is_cancelled())
    }
}
