//! Structured extraction: one schema-guided chat exchange with validation.
//!
//! The model is asked for a single JSON object. Its reply is located, parsed
//! and checked field by field against the schema. A reply that fails the check
//! is sent back with the error so the model can correct itself, up to
//! `max_retries` times. Provider errors are not retried.

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use crate::evidence::ExtractedField;
use crate::pipeline::llm::{ChatClient, PromptMessage};
use crate::prompts;
use crate::schema::{ExtractionSchema, FieldSpec};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Validated fields plus call accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutcome {
    pub fields: Vec<ExtractedField>,
    pub attempts: u32,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Run the extraction exchange for `text`.
pub async fn extract_structured(
    client: &dyn ChatClient,
    schema: &ExtractionSchema,
    text: &str,
    config: &ExtractionConfig,
) -> Result<StructuredOutcome, PipelineError> {
    let mut messages = vec![
        PromptMessage::system(prompts::system_prompt(
            schema,
            config.evidence,
            config.system_prompt.as_deref(),
        )),
        PromptMessage::user(prompts::user_message(
            schema,
            config.evidence,
            config.custom_prompt.as_deref(),
            text,
        )),
    ];

    let max_attempts = config.max_retries.saturating_add(1);
    let mut prompt_tokens = 0;
    let mut completion_tokens = 0;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let reply = client.chat(&messages).await?;
        prompt_tokens += reply.prompt_tokens;
        completion_tokens += reply.completion_tokens;

        match parse_reply(&reply.content, schema, config.evidence) {
            Ok(fields) => {
                debug!(
                    "{}: reply accepted on attempt {}/{}",
                    client.name(),
                    attempt,
                    max_attempts
                );
                return Ok(StructuredOutcome {
                    fields,
                    attempts: attempt,
                    prompt_tokens,
                    completion_tokens,
                });
            }
            Err(detail) => {
                warn!(
                    "{}: attempt {}/{} rejected: {}",
                    client.name(),
                    attempt,
                    max_attempts,
                    detail
                );
                messages.push(PromptMessage::assistant(reply.content));
                messages.push(PromptMessage::user(prompts::reask_message(&detail)));
                last_error = detail;
            }
        }
    }

    Err(PipelineError::MalformedResponse {
        attempts: max_attempts,
        detail: last_error,
    })
}

// ── Reply parsing ────────────────────────────────────────────────────────────

/// Byte index of the `}` closing the object that opens at `start`.
///
/// Braces inside JSON strings are skipped, so quoted Markdown (including
/// code fences) cannot end the object early.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Find the JSON object in a model reply.
///
/// Returns the first balanced `{...}` span that parses as a JSON object,
/// wherever it sits (bare, fenced or wrapped in prose). When none parses,
/// the span from the first `{` to the last `}` is returned so the caller
/// reports the JSON error.
fn locate_json_object(content: &str) -> Option<&str> {
    for (start, _) in content.match_indices('{') {
        let Some(end) = balanced_end(content, start) else {
            continue;
        };
        let candidate = &content[start..=end];
        if matches!(serde_json::from_str::<Value>(candidate), Ok(Value::Object(_))) {
            return Some(candidate);
        }
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

/// Parse and validate a reply against `schema`.
///
/// Unknown keys are ignored; missing or null fields are unpopulated. The
/// returned list has one entry per schema field, in schema order.
pub fn parse_reply(
    content: &str,
    schema: &ExtractionSchema,
    evidence: bool,
) -> Result<Vec<ExtractedField>, String> {
    let json = locate_json_object(content).ok_or("reply contains no JSON object")?;
    let root: Value = serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;
    let Value::Object(obj) = root else {
        return Err("reply is not a JSON object".into());
    };
    validate_object(&obj, schema, evidence)
}

/// Validate an already-parsed object against `schema`, with the same rules
/// as [`parse_reply`].
pub fn validate_object(
    obj: &Map<String, Value>,
    schema: &ExtractionSchema,
    evidence: bool,
) -> Result<Vec<ExtractedField>, String> {
    let mut errors = Vec::new();
    let mut fields = Vec::with_capacity(schema.fields().len());
    for spec in schema.fields() {
        let raw = obj.get(&spec.name);
        let parsed = if evidence {
            validate_evidence_entry(spec, raw)
        } else {
            validate_plain_entry(spec, raw)
        };
        match parsed {
            Ok(f) => fields.push(f),
            Err(e) => errors.push(format!("field '{}': {}", spec.name, e)),
        }
    }

    if errors.is_empty() {
        Ok(fields)
    } else {
        Err(errors.join("; "))
    }
}

fn unpopulated(spec: &FieldSpec) -> ExtractedField {
    ExtractedField {
        name: spec.name.clone(),
        value: None,
        evidence: None,
        confidence: None,
    }
}

fn validate_plain_entry(spec: &FieldSpec, raw: Option<&Value>) -> Result<ExtractedField, String> {
    match raw {
        None | Some(Value::Null) => Ok(unpopulated(spec)),
        Some(v) => Ok(ExtractedField {
            name: spec.name.clone(),
            value: Some(spec.kind.coerce(v)?),
            evidence: None,
            confidence: None,
        }),
    }
}

fn validate_evidence_entry(spec: &FieldSpec, raw: Option<&Value>) -> Result<ExtractedField, String> {
    let entry: &Map<String, Value> = match raw {
        None | Some(Value::Null) => return Ok(unpopulated(spec)),
        Some(Value::Object(m)) => m,
        Some(_) => return Err("expected an object with value, evidence and confidence".into()),
    };

    let value = match entry.get("value") {
        None | Some(Value::Null) => return Ok(unpopulated(spec)),
        Some(v) => spec.kind.coerce(v)?,
    };

    let evidence = match entry.get("evidence") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err("a value was given without an evidence quote".into()),
    };

    let confidence = match entry.get("confidence") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or("confidence must be a number")?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence {confidence} is outside [0, 1]"));
    }

    Ok(ExtractedField {
        name: spec.name.clone(),
        value: Some(value),
        evidence: Some(evidence),
        confidence: Some(confidence),
    })
}
