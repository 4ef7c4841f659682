//! Prompts for structured extraction.
//!
//! Callers can override the system prompt via
//! [`crate::config::ExtractionConfig::system_prompt`] and the field
//! instructions via [`crate::config::ExtractionConfig::custom_prompt`]; the
//! text here is used only when no override is provided.

use crate::schema::ExtractionSchema;
use serde_json::Value;

/// Default system prompt for extraction calls.
///
/// The JSON Schema of the expected reply is appended by [`system_prompt`].
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a meticulous data extraction assistant. You read documents converted to Markdown and return the requested fields as a single JSON object.

Follow these rules precisely:

1. SOURCE FIDELITY
   - Extract ONLY information that appears in the document
   - Do not infer, estimate, or add anything that is not explicitly stated
   - When a field is not present, set its value to null

2. OUTPUT FORMAT
   - Reply with ONE JSON object and nothing else
   - Do NOT wrap the JSON in code fences
   - Do NOT add commentary before or after the JSON
   - Use exactly the field names given in the schema"#;

const EVIDENCE_RULES: &str = r#"

3. EVIDENCE
   - For every field return {"value": ..., "evidence": "...", "confidence": ...}
   - "evidence" is an exact quote from the document supporting the value
   - "confidence" is a number between 0.0 and 1.0
   - When the value is null, use an empty evidence string and confidence 0.0"#;

/// Build the full system prompt: rules plus the reply schema.
pub fn system_prompt(schema: &ExtractionSchema, evidence: bool, override_prompt: Option<&str>) -> String {
    let mut prompt = match override_prompt {
        Some(p) => p.to_string(),
        None if evidence => format!("{DEFAULT_SYSTEM_PROMPT}{EVIDENCE_RULES}"),
        None => DEFAULT_SYSTEM_PROMPT.to_string(),
    };
    let schema_json = serde_json::to_string_pretty(&schema.to_json_schema(evidence))
        .unwrap_or_else(|_| Value::Null.to_string());
    prompt.push_str("\n\nThe reply must validate against this JSON Schema:\n");
    prompt.push_str(&schema_json);
    prompt
}

/// Field-by-field extraction instructions generated from the schema.
pub fn extraction_instructions(schema: &ExtractionSchema, evidence: bool) -> String {
    let fields: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| format!("- {} ({}): {}", f.name, f.kind, f.description))
        .collect();

    let mut prompt = format!(
        "Extract the following information from this document:\n\n{}\n\n\
         CRITICAL REQUIREMENTS:\n\
         - Extract ONLY text that appears verbatim in the document\n\
         - Do not infer, estimate, or add any information not explicitly stated",
        fields.join("\n")
    );
    if evidence {
        prompt.push_str(
            "\n- Provide exact quotes as evidence for each field\
             \n- Include confidence score between 0.0 and 1.0\
             \n- Use confidence 0.0 if information is not found",
        );
    } else {
        prompt.push_str("\n- Return null for fields not found in the document");
    }
    prompt
}

/// The user message: instructions (generated or custom) followed by the text.
pub fn user_message(
    schema: &ExtractionSchema,
    evidence: bool,
    custom_prompt: Option<&str>,
    document_text: &str,
) -> String {
    let instructions = match custom_prompt {
        Some(p) => p.to_string(),
        None => extraction_instructions(schema, evidence),
    };
    format!("{instructions}\n\n{document_text}")
}

/// Follow-up sent after a reply fails validation.
pub fn reask_message(error: &str) -> String {
    format!(
        "Your previous reply could not be used: {error}\n\
         Reply again with a single JSON object that follows the schema exactly."
    )
}

/// Header placed before each file in a multi-file call (`index` is 1-based).
pub fn document_header(index: usize, file_name: &str) -> String {
    format!("=== DOCUMENT {index}: {file_name} ===")
}
