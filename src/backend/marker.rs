//! Marker: layout-aware conversion for PDFs, scans and office files.
//!
//! `marker_single` writes `<out>/<stem>/<stem>.md` plus extracted figures.
//! Output goes to a scratch directory removed once the Markdown is read.

use super::{find_markdown_output, resolve_binary, run_tool, BackendKind, ConversionBackend};
use crate::config::MarkerOptions;
use crate::error::BackendError;
use crate::pipeline::document::{Document, DocumentFormat};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MARKER_ENV: &str = "MARKER_PATH";

#[derive(Debug, Clone)]
pub struct MarkerBackend {
    binary: PathBuf,
    options: MarkerOptions,
    timeout_secs: Option<u64>,
}

impl MarkerBackend {
    pub fn new(binary: Option<&Path>, options: MarkerOptions) -> Self {
        Self {
            binary: resolve_binary(binary, MARKER_ENV, "marker_single"),
            options,
            timeout_secs: None,
        }
    }

    pub fn timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn args(&self, document: &Document, out_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            document.path().into(),
            "--output_dir".into(),
            out_dir.into(),
            "--output_format".into(),
            "markdown".into(),
        ];
        if self.options.use_llm {
            args.push("--use_llm".into());
        }
        if let Some(svc) = &self.options.llm_service {
            args.extend(["--llm_service".into(), svc.into()]);
        }
        args.extend(self.options.extra_args.iter().map(OsString::from));
        args
    }
}

#[async_trait]
impl ConversionBackend for MarkerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Marker
    }

    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(
            format,
            DocumentFormat::Pdf
                | DocumentFormat::Image
                | DocumentFormat::Docx
                | DocumentFormat::Pptx
                | DocumentFormat::Xlsx
                | DocumentFormat::Html
                | DocumentFormat::Epub
        )
    }

    async fn convert(&self, document: &Document) -> Result<String, BackendError> {
        let scratch = tempfile::tempdir()?;
        run_tool(
            "marker_single",
            &self.binary,
            &self.args(document, scratch.path()),
            self.timeout_secs,
        )
        .await?;

        let stem = document.stem();
        let expected = scratch.path().join(&stem).join(format!("{stem}.md"));
        let md_path = find_markdown_output(scratch.path(), &[expected]).ok_or_else(|| {
            BackendError::EmptyOutput {
                tool: "marker_single".into(),
            }
        })?;
        debug!("marker output: {}", md_path.display());
        Ok(tokio::fs::read_to_string(&md_path).await?)
    }
}
