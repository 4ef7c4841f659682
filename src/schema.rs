//! Extraction schemas: which fields to pull out of a document, and how to
//! check a model's answer for each.
//!
//! A schema is loaded from a JSON object keyed by field name. Each entry is
//! either a bare description (a string field) or an object:
//!
//! ```json
//! {
//!   "project_id": "Applicant ID in format 'ORD2000111'. Location: top right",
//!   "funding_requested": {"description": "Total amount requested", "type": "float"},
//!   "call": {"description": "Funding call", "type": "enum", "values": ["ORD", "ETH"]}
//! }
//! ```
//!
//! Field order in the file is preserved in prompts and in the written JSON.

use crate::error::PipelineError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::Path;

/// Value type of one schema field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Float,
    /// ISO-8601 calendar date (`YYYY-MM-DD`).
    Date,
    /// One of a fixed set of strings.
    Enum(Vec<String>),
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Integer => f.write_str("integer"),
            Self::Float => f.write_str("float"),
            Self::Date => f.write_str("date"),
            Self::Enum(values) => write!(f, "enum [{}]", values.join(", ")),
        }
    }
}

impl FieldKind {
    /// JSON Schema for the bare value, always nullable.
    fn value_schema(&self) -> Value {
        match self {
            Self::String => json!({"type": ["string", "null"]}),
            Self::Integer => json!({"type": ["integer", "null"]}),
            Self::Float => json!({"type": ["number", "null"]}),
            Self::Date => json!({"type": ["string", "null"], "format": "date"}),
            Self::Enum(values) => {
                let mut allowed: Vec<Value> = values.iter().map(|v| json!(v)).collect();
                allowed.push(Value::Null);
                json!({"type": ["string", "null"], "enum": allowed})
            }
        }
    }

    /// Check a non-null model value against this kind and normalise it.
    ///
    /// Lenient where models commonly drift: numeric strings are accepted for
    /// numbers, whole floats for integers, and enum values match without
    /// regard to case.
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        match self {
            Self::String => match value {
                Value::String(s) => Ok(Value::String(s.clone())),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(format!("expected a string, got {}", type_name(other))),
            },
            Self::Integer => {
                let n = match value {
                    Value::Number(n) => n
                        .as_i64()
                        .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                    Value::String(s) => clean_number(s).parse::<i64>().ok(),
                    _ => None,
                };
                n.map(Value::from)
                    .ok_or_else(|| format!("expected an integer, got {value}"))
            }
            Self::Float => {
                let n = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => clean_number(s).parse::<f64>().ok(),
                    _ => None,
                };
                n.filter(|f| f.is_finite())
                    .map(Value::from)
                    .ok_or_else(|| format!("expected a number, got {value}"))
            }
            Self::Date => {
                let s = value
                    .as_str()
                    .ok_or_else(|| format!("expected a YYYY-MM-DD date string, got {value}"))?;
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                    .map_err(|_| format!("expected a YYYY-MM-DD date, got \"{s}\""))
            }
            Self::Enum(values) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| format!("expected one of [{}], got {value}", values.join(", ")))?;
                values
                    .iter()
                    .find(|v| v.eq_ignore_ascii_case(s.trim()))
                    .map(|v| Value::String(v.clone()))
                    .ok_or_else(|| format!("\"{s}\" is not one of [{}]", values.join(", ")))
            }
        }
    }
}

fn clean_number(s: &str) -> String {
    s.trim().chars().filter(|c| *c != ',' && *c != '_' && *c != ' ').collect()
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One named field the model is asked to fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub description: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
        }
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, FieldKind::String)
    }
}

/// Named, ordered list of fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    name: String,
    fields: Vec<FieldSpec>,
}

impl ExtractionSchema {
    /// Build a schema, rejecting empty, blank or duplicate fields.
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Result<Self, PipelineError> {
        let name = name.into();
        let invalid = |detail: String| PipelineError::InvalidSchema {
            name: name.clone(),
            detail,
        };

        if fields.is_empty() {
            return Err(invalid("schema has no fields".into()));
        }
        for (i, field) in fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(invalid(format!("field #{} has an empty name", i + 1)));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(invalid(format!("field '{}' is defined twice", field.name)));
            }
            if let FieldKind::Enum(values) = &field.kind {
                if values.is_empty() {
                    return Err(invalid(format!("enum field '{}' lists no values", field.name)));
                }
            }
        }

        Ok(Self { name, fields })
    }

    /// Parse a schema from JSON text.
    pub fn from_json_str(name: impl Into<String>, text: &str) -> Result<Self, PipelineError> {
        let name = name.into();
        let invalid = |detail: String| PipelineError::InvalidSchema {
            name: name.clone(),
            detail,
        };

        let root: Value =
            serde_json::from_str(text).map_err(|e| invalid(format!("not valid JSON: {e}")))?;
        let Value::Object(entries) = root else {
            return Err(invalid(
                "expected an object mapping field names to descriptions".into(),
            ));
        };

        let fields = entries
            .into_iter()
            .map(|(field, def)| parse_field(field, def).map_err(&invalid))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(name, fields)
    }

    /// Load a schema file. The schema is named after the file stem.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => PipelineError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "schema".into());
        Self::from_json_str(name, &text)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// JSON Schema describing the reply the model must produce.
    ///
    /// With `evidence`, every field is an object
    /// `{value, evidence, confidence}`; without it, the bare value.
    pub fn to_json_schema(&self, evidence: bool) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let prop = if evidence {
                json!({
                    "type": "object",
                    "description": field.description,
                    "properties": {
                        "value": field.kind.value_schema(),
                        "evidence": {
                            "type": "string",
                            "description": "Exact quote from the document supporting the value"
                        },
                        "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                    },
                    "required": ["value", "evidence", "confidence"]
                })
            } else {
                let mut schema = field.kind.value_schema();
                if let Value::Object(m) = &mut schema {
                    m.insert("description".into(), json!(field.description));
                }
                schema
            };
            properties.insert(field.name.clone(), prop);
        }

        let required: Vec<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required
        })
    }
}

fn parse_field(name: String, def: Value) -> Result<FieldSpec, String> {
    match def {
        Value::String(description) => Ok(FieldSpec::string(name, description)),
        Value::Object(obj) => {
            let description = match obj.get("description") {
                Some(Value::String(s)) => s.clone(),
                None => String::new(),
                Some(other) => {
                    return Err(format!(
                        "field '{name}': description must be a string, got {other}"
                    ))
                }
            };
            let type_tag = obj
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("string")
                .to_ascii_lowercase();
            let kind = match type_tag.as_str() {
                "string" | "str" | "text" => FieldKind::String,
                "integer" | "int" => FieldKind::Integer,
                "float" | "number" => FieldKind::Float,
                "date" => FieldKind::Date,
                "enum" => {
                    let values = obj
                        .get("values")
                        .and_then(Value::as_array)
                        .ok_or_else(|| format!("enum field '{name}' needs a \"values\" array"))?;
                    let values = values
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| format!("enum field '{name}': values must be strings"))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    FieldKind::Enum(values)
                }
                other => return Err(format!("field '{name}': unknown type '{other}'")),
            };
            Ok(FieldSpec::new(name, description, kind))
        }
        other => Err(format!(
            "field '{name}' must be a description string or an object, got {}",
            type_name(&other)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIXED: &str = r#"{
        "project_id": "Applicant ID in format 'ORD2000111'",
        "funding_requested": {"description": "Total funding", "type": "float"},
        "start_date": {"description": "Project start", "type": "date"},
        "call": {"description": "Call", "type": "enum", "values": ["ORD", "ETH"]}
    }"#;

    #[test]
    fn parses_simple_and_extended_fields_in_order() {
        let s = ExtractionSchema::from_json_str("ethord", MIXED).unwrap();
        let names: Vec<_> = s.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["project_id", "funding_requested", "start_date", "call"]);
        assert_eq!(s.field("project_id").unwrap().kind, FieldKind::String);
        assert_eq!(s.field("funding_requested").unwrap().kind, FieldKind::Float);
        assert_eq!(
            s.field("call").unwrap().kind,
            FieldKind::Enum(vec!["ORD".into(), "ETH".into()])
        );
    }

    #[test]
    fn rejects_non_object_and_empty() {
        assert!(matches!(
            ExtractionSchema::from_json_str("x", "[1, 2]"),
            Err(PipelineError::InvalidSchema { .. })
        ));
        assert!(matches!(
            ExtractionSchema::from_json_str("x", "{}"),
            Err(PipelineError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = ExtractionSchema::from_json_str("x", r#"{"a": {"type": "blob"}}"#).unwrap_err();
        assert!(err.to_string().contains("unknown type 'blob'"), "got {err}");
    }

    #[test]
    fn file_name_becomes_schema_name() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("grant_fields.json");
        std::fs::write(&p, r#"{"title": "Project title"}"#).unwrap();
        let s = ExtractionSchema::from_json_file(&p).unwrap();
        assert_eq!(s.name(), "grant_fields");
    }

    #[test]
    fn missing_schema_file() {
        let err = ExtractionSchema::from_json_file("/no/such/schema.json").unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }

    #[test]
    fn evidence_json_schema_wraps_each_field() {
        let s = ExtractionSchema::from_json_str("ethord", MIXED).unwrap();
        let js = s.to_json_schema(true);
        let field = &js["properties"]["funding_requested"];
        assert_eq!(field["type"], "object");
        assert_eq!(field["properties"]["value"]["type"], json!(["number", "null"]));
        assert_eq!(field["properties"]["confidence"]["maximum"], 1.0);
        assert_eq!(js["required"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn plain_json_schema_uses_bare_values() {
        let s = ExtractionSchema::from_json_str("ethord", MIXED).unwrap();
        let js = s.to_json_schema(false);
        assert_eq!(js["properties"]["start_date"]["format"], "date");
        assert_eq!(js["properties"]["start_date"]["description"], "Project start");
        assert!(js["properties"]["call"]["enum"].as_array().unwrap().contains(&Value::Null));
    }

    #[test]
    fn coerce_numbers_leniently() {
        assert_eq!(FieldKind::Integer.coerce(&json!("1,250")), Ok(json!(1250)));
        assert_eq!(FieldKind::Integer.coerce(&json!(12.0)), Ok(json!(12)));
        assert!(FieldKind::Integer.coerce(&json!(12.5)).is_err());
        assert_eq!(FieldKind::Float.coerce(&json!("250 000.50")), Ok(json!(250000.5)));
        assert!(FieldKind::Float.coerce(&json!("lots")).is_err());
    }

    #[test]
    fn coerce_dates_and_enums() {
        assert_eq!(FieldKind::Date.coerce(&json!("2024-03-01")), Ok(json!("2024-03-01")));
        assert!(FieldKind::Date.coerce(&json!("01/03/2024")).is_err());
        let kind = FieldKind::Enum(vec!["ORD".into(), "ETH".into()]);
        assert_eq!(kind.coerce(&json!("ord")), Ok(json!("ORD")));
        assert!(kind.coerce(&json!("EPFL")).is_err());
    }

    #[test]
    fn coerce_string_rejects_structures() {
        assert_eq!(FieldKind::String.coerce(&json!(42)), Ok(json!("42")));
        assert!(FieldKind::String.coerce(&json!({"a": 1})).is_err());
    }
}
