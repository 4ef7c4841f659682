//! # dataset-extract
//!
//! Turn a folder of documents into a structured dataset.
//!
//! Each document is converted to Markdown by an external tool (Pandoc,
//! Marker, Docling or the LlamaParse cloud API). The Markdown is then sent to
//! an LLM in a single call that returns the fields of a caller-defined schema,
//! each with the supporting quote from the text and a confidence score.
//!
//! ## Pipeline Overview
//!
//! ```text
//! report.pdf
//!  │
//!  ├─ 1. Convert  pandoc / marker_single / docling / LlamaParse, with fallback
//!  ├─ 2. Polish   normalise the Markdown, write report.md atomically
//!  ├─ 3. Extract  one chat call: system rules + JSON Schema + document text
//!  ├─ 4. Validate type-check every field, re-ask the model on bad replies
//!  └─ 5. Output   report.json with {value, evidence, confidence} per field
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dataset_extract::{convert_to_file, extract_from_file, ConversionConfig, ExtractionConfig, ExtractionSchema};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let converted = convert_to_file("invoice.docx", &ConversionConfig::default()).await?;
//!
//!     let schema = ExtractionSchema::from_json_file("invoice_schema.json")?;
//!     // Provider from DATASET_EXTRACT_PROVIDER, else OpenAI when OPENAI_API_KEY is set, else Ollama
//!     let config = ExtractionConfig::default();
//!     let md = converted.markdown_path.expect("written beside the source");
//!     let result = extract_from_file(&md, &schema, &config).await?;
//!     for field in result.populated() {
//!         println!("{} = {:?} ({:?})", field.name, field.value, field.evidence);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `dataset-extract` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! dataset-extract = { version = "0.3", default-features = false }
//! ```
//!
//! ## Choosing a Backend
//!
//! | Backend | Reads | Notes |
//! |---------|-------|-------|
//! | `pandoc`  | docx, odt, rtf, html, epub, txt | Fast, text-based, no PDFs |
//! | `marker`  | pdf, images, office, html, epub | Layout-aware, optional `--use_llm` |
//! | `docling` | pdf, images, office, html, txt  | Multi-format |
//! | `llamaparse` | everything but plain text | Cloud, needs `LLAMA_CLOUD_API_KEY`, opt-in only |
//!
//! [`LlamaExtractClient`] skips conversion altogether and extracts the schema
//! from the original documents with the same cloud account (no evidence
//! quotes).

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod batch;
pub mod config;
pub mod convert;
pub mod error;
pub mod evidence;
pub mod extract;
pub mod llamaextract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schema;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{BackendKind, ConversionBackend};
pub use batch::{clean_dir, convert_dir, extract_dir, find_files, process_dir, status_dir};
pub use config::{
    BatchConfig, BatchConfigBuilder, ConversionConfig, ConversionConfigBuilder, ExtractionConfig,
    ExtractionConfigBuilder, ExtractionGrouping, LlamaExtractOptions, LlamaParseOptions,
    LlamaParsePreset, MarkerOptions,
};
pub use convert::{convert, convert_sync, convert_to_file, Converter};
pub use error::{BackendError, ItemError, PipelineError};
pub use evidence::{
    DateWithEvidence, EnumWithEvidence, ExtractedField, ExtractionResult, FloatWithEvidence,
    IntWithEvidence, StringWithEvidence, WithEvidence,
};
pub use extract::{
    extract_from_file, extract_from_file_with_client, extract_from_files,
    extract_from_files_with_client, extract_from_text, extract_from_text_with_client, save_result,
};
pub use llamaextract::LlamaExtractClient;
pub use output::{
    BatchReport, BatchStage, ConversionOutput, DocumentStatus, FailedAttempt, ItemOutcome,
    ItemStatus,
};
pub use pipeline::document::{Document, DocumentFormat};
pub use pipeline::llm::{ChatClient, ChatReply, LlmClient, PromptMessage, ProviderSpec, Role};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use schema::{ExtractionSchema, FieldKind, FieldSpec};
