//! Evidence-annotated extraction results.
//!
//! Every extracted value travels with the quote that supports it and a
//! confidence score in `[0, 1]`. [`ExtractionResult`] is the untyped form
//! produced from any schema; callers with a fixed schema can turn it into
//! their own struct of [`WithEvidence`] fields via
//! [`ExtractionResult::deserialize_into`].

use crate::error::PipelineError;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

/// A value with its supporting quote and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithEvidence<T> {
    pub value: Option<T>,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub confidence: f64,
}

impl<T> WithEvidence<T> {
    /// A field the document did not contain.
    pub fn missing() -> Self {
        Self {
            value: None,
            evidence: String::new(),
            confidence: 0.0,
        }
    }

    pub fn is_populated(&self) -> bool {
        self.value.is_some()
    }
}

impl<T> Default for WithEvidence<T> {
    fn default() -> Self {
        Self::missing()
    }
}

pub type StringWithEvidence = WithEvidence<String>;
pub type IntWithEvidence = WithEvidence<i64>;
pub type FloatWithEvidence = WithEvidence<f64>;
pub type DateWithEvidence = WithEvidence<NaiveDate>;
pub type EnumWithEvidence = WithEvidence<String>;

/// One field of an extraction result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub name: String,
    /// Normalised value, or `None` when the model found nothing.
    pub value: Option<Value>,
    /// Supporting quote. Always present for populated fields in evidence mode.
    pub evidence: Option<String>,
    pub confidence: Option<f64>,
}

impl ExtractedField {
    pub fn is_populated(&self) -> bool {
        self.value.is_some()
    }
}

/// Validated answer to one extraction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub schema_name: String,
    /// Every schema field, in schema order.
    pub fields: Vec<ExtractedField>,
    /// Whether fields carry evidence and confidence.
    pub evidence_mode: bool,
    /// Markdown files the text came from, in prompt order. Empty for raw text.
    pub sources: Vec<PathBuf>,
    /// Where the JSON was written, if it was.
    pub json_path: Option<PathBuf>,
    /// Model calls made, including re-asks.
    pub attempts: u32,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub duration_ms: u64,
}

impl ExtractionResult {
    pub fn field(&self, name: &str) -> Option<&ExtractedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.field(name).and_then(|f| f.value.as_ref())
    }

    pub fn populated(&self) -> impl Iterator<Item = &ExtractedField> {
        self.fields.iter().filter(|f| f.is_populated())
    }

    /// The persisted shape: populated fields only, in schema order.
    ///
    /// Evidence mode writes `{value, evidence, confidence}` per field,
    /// plain mode writes the bare value.
    pub fn to_json(&self) -> Value {
        self.render(self.populated())
    }

    /// Every field, unpopulated ones as `{value: null, ...}` (or `null`).
    fn to_full_json(&self) -> Value {
        self.render(self.fields.iter())
    }

    fn render<'a>(&self, fields: impl Iterator<Item = &'a ExtractedField>) -> Value {
        let mut out = Map::new();
        for field in fields {
            let value = field.value.clone().unwrap_or(Value::Null);
            let entry = if self.evidence_mode {
                json!({
                    "value": value,
                    "evidence": field.evidence.clone().unwrap_or_default(),
                    "confidence": field.confidence.unwrap_or(0.0),
                })
            } else {
                value
            };
            out.insert(field.name.clone(), entry);
        }
        Value::Object(out)
    }

    /// Deserialize into a caller-defined struct.
    ///
    /// In evidence mode the struct's fields are typically [`WithEvidence`]
    /// aliases; in plain mode, `Option<T>`.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        serde_json::from_value(self.to_full_json()).map_err(|e| PipelineError::InvalidSchema {
            name: self.schema_name.clone(),
            detail: format!("result does not fit the target type: {e}"),
        })
    }

    /// Whether `json` has the shape [`to_json`](Self::to_json) writes.
    ///
    /// Every entry must be a scalar (plain mode) or an object holding
    /// `value` and nothing besides `evidence` and `confidence`.
    pub fn is_saved_shape(json: &Value) -> bool {
        let Value::Object(entries) = json else {
            return false;
        };
        entries.values().all(|entry| match entry {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => true,
            Value::Object(m) => {
                m.contains_key("value")
                    && m
                        .keys()
                        .all(|k| matches!(k.as_str(), "value" | "evidence" | "confidence"))
            }
            Value::Null | Value::Array(_) => false,
        })
    }
}
