//! Conversion backends: external tools that turn a document into Markdown.
//!
//! Each backend is a thin adapter around one tool. The converter never
//! branches on a concrete tool; it walks an ordered list of
//! [`ConversionBackend`] trait objects, asks each whether it reads the
//! document's format, and stops at the first success.
//!
//! | Backend | Kind | Reads |
//! |---------|------|-------|
//! | [`pandoc::PandocBackend`] | fast, text-based | docx, odt, rtf, html, epub, text |
//! | [`marker::MarkerBackend`] | layout-aware | pdf, images, docx, pptx, xlsx, html, epub |
//! | [`docling::DoclingBackend`] | multi-format | pdf, images, docx, pptx, xlsx, html, text |
//! | [`llamaparse::LlamaParseBackend`] | cloud, opt-in | everything but plain text |
//!
//! None of the local tools reads legacy Word `.doc` files. With the default
//! chain they fail as unsupported; convert them to `.docx` first or select
//! LlamaParse.

pub mod docling;
pub mod llamaparse;
pub mod marker;
pub mod pandoc;

use crate::config::ConversionConfig;
use crate::error::BackendError;
use crate::pipeline::document::{Document, DocumentFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use docling::DoclingBackend;
pub use llamaparse::LlamaParseBackend;
pub use marker::MarkerBackend;
pub use pandoc::PandocBackend;

/// Identifies a conversion backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Pandoc,
    Marker,
    Docling,
    LlamaParse,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Pandoc,
        BackendKind::Marker,
        BackendKind::Docling,
        BackendKind::LlamaParse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pandoc => "pandoc",
            Self::Marker => "marker",
            Self::Docling => "docling",
            Self::LlamaParse => "llamaparse",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pandoc" => Ok(Self::Pandoc),
            "marker" => Ok(Self::Marker),
            "docling" => Ok(Self::Docling),
            "llamaparse" | "llama-parse" | "llama_parse" => Ok(Self::LlamaParse),
            other => Err(format!(
                "unknown backend '{other}' (expected pandoc, marker, docling or llamaparse)"
            )),
        }
    }
}

/// A document-to-Markdown converter.
///
/// Implementations return the raw Markdown text; normalisation and
/// persistence are the converter's job.
#[async_trait]
pub trait ConversionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Display name used in logs.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Whether this backend can read `format` at all.
    fn supports(&self, format: DocumentFormat) -> bool;

    async fn convert(&self, document: &Document) -> Result<String, BackendError>;
}

/// Instantiate the backend for `kind` from the conversion config.
pub fn build_backend(kind: BackendKind, config: &ConversionConfig) -> Arc<dyn ConversionBackend> {
    let timeout = config.backend_timeout_secs;
    match kind {
        BackendKind::Pandoc => Arc::new(
            PandocBackend::new(config.pandoc_path.as_deref()).timeout_secs(timeout),
        ),
        BackendKind::Marker => Arc::new(
            MarkerBackend::new(config.marker_path.as_deref(), config.marker.clone())
                .timeout_secs(timeout),
        ),
        BackendKind::Docling => Arc::new(
            DoclingBackend::new(config.docling_path.as_deref()).timeout_secs(timeout),
        ),
        BackendKind::LlamaParse => Arc::new(LlamaParseBackend::from_options(&config.llamaparse)),
    }
}

// ── Tool invocation helpers ──────────────────────────────────────────────────

/// Resolve a tool binary: explicit path, then `env_var`, then `default` on PATH.
pub(crate) fn resolve_binary(explicit: Option<&Path>, env_var: &str, default: &str) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    match std::env::var(env_var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => PathBuf::from(default),
    }
}

/// Maximum stderr bytes kept in a [`BackendError::ToolFailed`].
const STDERR_TAIL: usize = 2000;

/// Run an external tool to completion and return its stdout.
///
/// A binary that cannot be spawned is reported as unavailable so the converter
/// can move on to the next backend. With a timeout, the child is killed when
/// the deadline passes.
pub(crate) async fn run_tool(
    tool: &str,
    program: &Path,
    args: &[OsString],
    timeout_secs: Option<u64>,
) -> Result<Vec<u8>, BackendError> {
    debug!("Running {}: {:?} {:?}", tool, program, args);

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| BackendError::Unavailable {
        tool: tool.to_string(),
        detail: format!("cannot run {}: {}", program.display(), e),
    })?;

    let output = match timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
            .await
            .map_err(|_| BackendError::Timeout {
                tool: tool.to_string(),
                secs,
            })??,
        None => child.wait_with_output().await?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail = match stderr.char_indices().rev().nth(STDERR_TAIL) {
            Some((idx, _)) => &stderr[idx..],
            None => stderr,
        };
        return Err(BackendError::ToolFailed {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: tail.to_string(),
        });
    }

    Ok(output.stdout)
}

/// Find the Markdown a tool wrote under `dir`.
///
/// Checks `preferred` first, then falls back to the first `.md` file found
/// (sorted, depth-first) since tools nest their output differently across
/// versions.
pub(crate) fn find_markdown_output(dir: &Path, preferred: &[PathBuf]) -> Option<PathBuf> {
    if let Some(p) = preferred.iter().find(|p| p.is_file()) {
        return Some(p.clone());
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in &entries {
        if path.is_file() && path.extension().is_some_and(|e| e == "md") {
            return Some(path.clone());
        }
    }
    entries
        .iter()
        .filter(|p| p.is_dir())
        .find_map(|sub| find_markdown_output(sub, &[]))
}
