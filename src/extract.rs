//! Structured-extraction entry points.
//!
//! Each call sends the Markdown to the model once (plus re-asks on invalid
//! replies), validates the answer against the schema and, unless disabled,
//! writes it as `name.json` beside the first input file.
//!
//! The `*_with_client` variants take any [`ChatClient`], which is how the
//! batch driver shares one client across calls and how tests run offline.

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use crate::evidence::ExtractionResult;
use crate::pipeline::document::{json_path_for, write_atomic};
use crate::pipeline::llm::{ChatClient, LlmClient};
use crate::pipeline::structured::extract_structured;
use crate::prompts::document_header;
use crate::schema::ExtractionSchema;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Extract from raw text. Nothing is written to disk.
pub async fn extract_from_text(
    text: &str,
    schema: &ExtractionSchema,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, PipelineError> {
    let client = LlmClient::from_config(config)?;
    extract_from_text_with_client(&client, text, schema, config).await
}

pub async fn extract_from_text_with_client(
    client: &dyn ChatClient,
    text: &str,
    schema: &ExtractionSchema,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, PipelineError> {
    let start = Instant::now();
    info!(
        "Extracting '{}' ({} fields) with {}",
        schema.name(),
        schema.fields().len(),
        client.name()
    );

    let outcome = extract_structured(client, schema, text, config).await?;
    let result = ExtractionResult {
        schema_name: schema.name().to_string(),
        fields: outcome.fields,
        evidence_mode: config.evidence,
        sources: Vec::new(),
        json_path: None,
        attempts: outcome.attempts,
        prompt_tokens: outcome.prompt_tokens,
        completion_tokens: outcome.completion_tokens,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    debug!(
        "'{}': {}/{} fields populated, {} + {} tokens",
        result.schema_name,
        result.populated().count(),
        result.fields.len(),
        result.prompt_tokens,
        result.completion_tokens
    );
    Ok(result)
}

/// Extract from one Markdown file; writes `name.json` beside it when
/// `save_json` is set.
pub async fn extract_from_file(
    path: impl AsRef<Path>,
    schema: &ExtractionSchema,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, PipelineError> {
    let text = read_markdown(path.as_ref())?;
    let client = LlmClient::from_config(config)?;
    finish(&client, &text, vec![path.as_ref().to_path_buf()], schema, config).await
}

pub async fn extract_from_file_with_client(
    client: &dyn ChatClient,
    path: impl AsRef<Path>,
    schema: &ExtractionSchema,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, PipelineError> {
    let text = read_markdown(path.as_ref())?;
    finish(client, &text, vec![path.as_ref().to_path_buf()], schema, config).await
}

/// Extract from several Markdown files in a single call.
///
/// Files are concatenated in order, each under a
/// `=== DOCUMENT n: name ===` header. Missing files are skipped; the JSON is
/// written beside the first file that could be read.
pub async fn extract_from_files<P: AsRef<Path>>(
    paths: &[P],
    schema: &ExtractionSchema,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, PipelineError> {
    let (text, sources) = combine_files(paths)?;
    let client = LlmClient::from_config(config)?;
    finish(&client, &text, sources, schema, config).await
}

pub async fn extract_from_files_with_client<P: AsRef<Path>>(
    client: &dyn ChatClient,
    paths: &[P],
    schema: &ExtractionSchema,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, PipelineError> {
    let (text, sources) = combine_files(paths)?;
    finish(client, &text, sources, schema, config).await
}

/// Write the populated fields of `result` to `json_path`.
pub fn save_result(result: &ExtractionResult, json_path: &Path) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(&result.to_json())
        .map_err(|e| PipelineError::Internal(format!("serialising result: {e}")))?;
    write_atomic(json_path, format!("{json}\n").as_bytes())?;
    info!("Wrote {}", json_path.display());
    Ok(())
}

// ── Internal helpers ─────────────────────────────────────────────────────────

async fn finish(
    client: &dyn ChatClient,
    text: &str,
    sources: Vec<PathBuf>,
    schema: &ExtractionSchema,
    config: &ExtractionConfig,
) -> Result<ExtractionResult, PipelineError> {
    let mut result = extract_from_text_with_client(client, text, schema, config).await?;
    if config.save_json {
        if let Some(first) = sources.first() {
            let json_path = json_path_for(first);
            save_result(&result, &json_path)?;
            result.json_path = Some(json_path);
        }
    }
    result.sources = sources;
    Ok(result)
}

fn read_markdown(path: &Path) -> Result<String, PipelineError> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipelineError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => PipelineError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => PipelineError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        },
    })
}

fn combine_files<P: AsRef<Path>>(paths: &[P]) -> Result<(String, Vec<PathBuf>), PipelineError> {
    if paths.is_empty() {
        return Err(PipelineError::NoInputFiles {
            detail: "no files provided".into(),
        });
    }

    let mut parts = Vec::with_capacity(paths.len());
    let mut sources = Vec::with_capacity(paths.len());
    for (i, path) in paths.iter().enumerate() {
        let path = path.as_ref();
        match read_markdown(path) {
            Ok(text) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                parts.push(format!("{}\n{}", document_header(i + 1, &name), text));
                sources.push(path.to_path_buf());
            }
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }

    if sources.is_empty() {
        return Err(PipelineError::NoInputFiles {
            detail: format!("none of the {} file(s) could be read", paths.len()),
        });
    }
    Ok((parts.join("\n\n"), sources))
}
