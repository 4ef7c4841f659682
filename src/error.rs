//! Error types for the dataset-extract library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`PipelineError`]: **Fatal** for one operation: the document could not be
//!   converted, the extraction call failed, the output could not be written.
//!   Returned as `Err(PipelineError)` from every top-level function.
//!
//! * [`BackendError`]: a single conversion backend failed. The converter
//!   swallows it while another backend is left to try, and reports every
//!   attempt inside [`PipelineError::AllBackendsFailed`] once none succeed.
//!
//! * [`ItemError`]: **Non-fatal** for a batch: one document or Markdown group
//!   failed, its siblings carry on. Stored inside
//!   [`crate::output::ItemOutcome`] so callers can report partial success.

use std::path::PathBuf;
use thiserror::Error;

use crate::backend::BackendKind;

/// All fatal errors returned by the dataset-extract library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// Batch root does not exist or is not a directory.
    #[error("Directory not found: '{path}'")]
    DirectoryNotFound { path: PathBuf },

    /// No backend (or no known format) handles this file extension.
    #[error("Unsupported document format for '{path}': {detail}")]
    UnsupportedFormat { path: PathBuf, detail: String },

    /// The file claims a format its content does not match.
    #[error("Document '{path}' is corrupt: {detail}")]
    CorruptDocument { path: PathBuf, detail: String },

    // ── Conversion errors ─────────────────────────────────────────────────
    /// The explicitly requested backend failed; no fallback is attempted.
    #[error("{backend} failed to convert '{path}': {source}")]
    BackendFailed {
        path: PathBuf,
        backend: BackendKind,
        #[source]
        source: BackendError,
    },

    /// Every backend in the fallback chain failed.
    #[error("All backends failed to convert '{path}':\n{}", format_attempts(.attempts))]
    AllBackendsFailed {
        path: PathBuf,
        attempts: Vec<(BackendKind, BackendError)>,
    },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// The provider family needs an API key that is not set.
    #[error("Missing credentials for provider '{provider}'.\nSet {env_var} before running extraction.")]
    MissingCredentials { provider: String, env_var: String },

    /// The provider identifier names an unknown family or is malformed.
    #[error("Unknown LLM provider '{provider}'.\nSupported: {supported}")]
    UnknownProvider { provider: String, supported: String },

    /// The provider client could not be constructed.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The LLM API returned a non-retryable error.
    #[error("LLM API error from '{provider}': {message}")]
    LlmApiError { provider: String, message: String },

    /// LLM API returned HTTP 429.
    #[error("Rate limit exceeded for provider '{provider}': {message}")]
    RateLimitExceeded { provider: String, message: String },

    /// LLM API rejected the credentials (401/403).
    #[error("Authentication error from provider '{provider}': {detail}")]
    AuthError { provider: String, detail: String },

    /// The model never produced a reply matching the schema.
    #[error("Malformed model output after {attempts} attempt(s): {detail}")]
    MalformedResponse { attempts: u32, detail: String },

    /// Extraction was asked to run over no readable Markdown.
    #[error("No valid input files: {detail}")]
    NoInputFiles { detail: String },

    /// The schema definition itself is unusable.
    #[error("Invalid schema '{name}': {detail}")]
    InvalidSchema { name: String, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not read an input file.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_attempts(attempts: &[(BackendKind, BackendError)]) -> String {
    attempts
        .iter()
        .map(|(kind, err)| format!("  - {kind}: {err}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Failure of a single backend invocation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The tool is not installed or cannot be spawned.
    #[error("{tool} is not available: {detail}")]
    Unavailable { tool: String, detail: String },

    /// The backend does not read this format.
    #[error("format '{format}' is not supported")]
    Unsupported { format: String },

    /// The tool ran and exited unsuccessfully.
    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    /// The tool did not finish within the configured timeout.
    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    /// The tool reported success but produced no Markdown.
    #[error("{tool} produced no Markdown output")]
    EmptyOutput { tool: String },

    /// Remote conversion service error.
    #[error("remote service error: {0}")]
    Remote(String),

    /// Missing API key for a cloud backend.
    #[error("missing credentials: set {env_var}")]
    MissingCredentials { env_var: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A non-fatal error for a single batch item.
///
/// Stored alongside [`crate::output::ItemOutcome`] when an item fails.
/// Carries the message rather than the source error so reports serialise.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
#[error("{path}: {message}")]
pub struct ItemError {
    pub path: String,
    pub message: String,
}

impl ItemError {
    pub fn new(path: impl Into<PathBuf>, err: &PipelineError) -> Self {
        Self {
            path: path.into().display().to_string(),
            message: err.to_string(),
        }
    }
}
