//! Tasks, candidates and verdicts.
//!
//! # Invariants
//! - A `Task` has a non-empty description and at least one output field
//! - A `Candidate`'s fields validate against its task's output schema
//! - Both are immutable once built

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::signature::{FieldSpec, Fields, Signature, SignatureError};

/// Input field name carrying the task description in every prompt.
pub const TASK_FIELD: &str = "task";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("Task description is empty")]
    EmptyDescription,

    #[error("Invalid output schema: {0}")]
    Schema(#[from] SignatureError),
}

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a fresh random ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire shape of a task, validated into [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<TaskId>,
    pub description: String,
    pub outputs: Vec<FieldSpec>,
}

/// A unit of work for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TaskSpec", into = "TaskSpec")]
pub struct Task {
    id: TaskId,
    description: String,
    schema: Signature,
}

impl Task {
    /// Create a task.
    ///
    /// # Errors
    /// `EmptyDescription` for a blank description, `Schema` when `outputs`
    /// is empty or repeats a name.
    pub fn new(
        id: impl Into<TaskId>,
        description: impl Into<String>,
        outputs: Vec<FieldSpec>,
    ) -> Result<Self, TaskError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(TaskError::EmptyDescription);
        }
        let schema = Signature::new(vec![FieldSpec::named(TASK_FIELD)], outputs)?;
        Ok(Self {
            id: id.into(),
            description,
            schema,
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Declared output schema.
    pub fn schema(&self) -> &Signature {
        &self.schema
    }

    /// Prompt inputs for this task.
    pub fn inputs(&self) -> Fields {
        let mut inputs = Fields::new();
        inputs.insert(TASK_FIELD.to_string(), self.description.clone());
        inputs
    }
}

impl TryFrom<TaskSpec> for Task {
    type Error = TaskError;

    fn try_from(spec: TaskSpec) -> Result<Self, Self::Error> {
        Task::new(spec.id.unwrap_or_default(), spec.description, spec.outputs)
    }
}

impl From<Task> for TaskSpec {
    fn from(task: Task) -> Self {
        TaskSpec {
            outputs: task.schema.outputs().to_vec(),
            id: Some(task.id),
            description: task.description,
        }
    }
}

/// Where a candidate's fields came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Produced by the generator with this many demonstrations attached
    Generator { demonstrations: usize },
    /// Replacement proposed by the verifier
    Correction,
}

/// A generated (or corrected) artifact for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    task_id: TaskId,
    fields: Fields,
    provenance: Provenance,
}

impl Candidate {
    /// Validate `fields` against the task schema and build a candidate.
    ///
    /// Undeclared fields are dropped.
    pub fn for_task(
        task: &Task,
        fields: &Fields,
        provenance: Provenance,
    ) -> Result<Self, SignatureError> {
        Ok(Self {
            task_id: task.id.clone(),
            fields: task.schema.project(fields)?,
            provenance,
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Fields as a JSON object string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_default()
    }
}

/// The verifier's categorical judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Consistent,
    Inconsistent,
    /// Evidence absent or unusable; never treated as `Consistent`
    Unverifiable,
}

impl Verdict {
    /// Parse one of the three legal verdict words, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_matches(|c| c == '"' || c == '.').to_lowercase().as_str() {
            "consistent" => Some(Verdict::Consistent),
            "inconsistent" => Some(Verdict::Inconsistent),
            "unverifiable" => Some(Verdict::Unverifiable),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Consistent => write!(f, "Consistent"),
            Verdict::Inconsistent => write!(f, "Inconsistent"),
            Verdict::Unverifiable => write!(f, "Unverifiable"),
        }
    }
}
