//! Named-field schemas for everything that crosses the oracle boundary.
//!
//! Every task declares the fields it expects back. Oracle output is checked
//! against that declaration before it is allowed to become a candidate or a
//! correction.
//!
//! # Invariants
//! - A `Signature` always has at least one output field
//! - Field names within a signature are unique

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field values keyed by field name.
///
/// Ordered map so prompts, hashes and serialized programs are deterministic.
pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Signature declares no output fields")]
    NoOutputs,

    #[error("Duplicate field name: {0}")]
    DuplicateField(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Field is blank: {0}")]
    BlankField(String),
}

/// One named slot in a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    /// Field with no description.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }
}

/// Input and output fields of one oracle call shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    inputs: Vec<FieldSpec>,
    outputs: Vec<FieldSpec>,
}

impl Signature {
    /// Build a signature.
    ///
    /// # Errors
    /// `NoOutputs` if `outputs` is empty, `DuplicateField` if any name repeats.
    pub fn new(inputs: Vec<FieldSpec>, outputs: Vec<FieldSpec>) -> Result<Self, SignatureError> {
        if outputs.is_empty() {
            return Err(SignatureError::NoOutputs);
        }
        let mut seen = std::collections::HashSet::new();
        for field in inputs.iter().chain(outputs.iter()) {
            if !seen.insert(field.name.as_str()) {
                return Err(SignatureError::DuplicateField(field.name.clone()));
            }
        }
        Ok(Self { inputs, outputs })
    }

    pub fn outputs(&self) -> &[FieldSpec] {
        &self.outputs
    }

    /// Check that every declared output is present and non-blank.
    pub fn validate_outputs(&self, fields: &Fields) -> Result<(), SignatureError> {
        for spec in &self.outputs {
            match fields.get(&spec.name) {
                None => return Err(SignatureError::MissingField(spec.name.clone())),
                Some(v) if v.trim().is_empty() => {
                    return Err(SignatureError::BlankField(spec.name.clone()))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Validate and keep only the declared output fields.
    pub fn project(&self, fields: &Fields) -> Result<Fields, SignatureError> {
        self.validate_outputs(fields)?;
        Ok(self
            .outputs
            .iter()
            .filter_map(|spec| {
                fields
                    .get(&spec.name)
                    .map(|v| (spec.name.clone(), v.trim().to_string()))
            })
            .collect())
    }
}
