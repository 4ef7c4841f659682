//! Docling: multi-format conversion with table structure recovery.

use super::{find_markdown_output, resolve_binary, run_tool, BackendKind, ConversionBackend};
use crate::error::BackendError;
use crate::pipeline::document::{Document, DocumentFormat};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const DOCLING_ENV: &str = "DOCLING_PATH";

#[derive(Debug, Clone)]
pub struct DoclingBackend {
    binary: PathBuf,
    timeout_secs: Option<u64>,
}

impl DoclingBackend {
    pub fn new(binary: Option<&Path>) -> Self {
        Self {
            binary: resolve_binary(binary, DOCLING_ENV, "docling"),
            timeout_secs: None,
        }
    }

    pub fn timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn args(document: &Document, out_dir: &Path) -> Vec<OsString> {
        vec![
            document.path().into(),
            "--to".into(),
            "md".into(),
            "--output".into(),
            out_dir.into(),
        ]
    }
}

impl Default for DoclingBackend {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ConversionBackend for DoclingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docling
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
                | DocumentFormat::Text
        )
    }

    async fn convert(&self, document: &Document) -> Result<String, BackendError> {
        let scratch = tempfile::tempdir()?;
        run_tool(
            "docling",
            &self.binary,
            &Self::args(document, scratch.path()),
            self.timeout_secs,
        )
        .await?;

        let expected = scratch.path().join(format!("{}.md", document.stem()));
        let md_path = find_markdown_output(scratch.path(), &[expected]).ok_or_else(|| {
            BackendError::EmptyOutput {
                tool: "docling".into(),
            }
        })?;
        Ok(tokio::fs::read_to_string(&md_path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_target_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("slides.pptx");
        std::fs::write(&p, b"PK").unwrap();
        let doc = Document::open(&p).unwrap();
        let args = DoclingBackend::args(&doc, Path::new("/tmp/d"));
        assert_eq!(args[1], OsString::from("--to"));
        assert_eq!(args[2], OsString::from("md"));
        assert_eq!(args[4], OsString::from("/tmp/d"));
    }

    #[test]
    fn supports_office_and_layout_formats() {
        let b = DoclingBackend::default();
        assert!(b.supports(DocumentFormat::Pptx));
        assert!(b.supports(DocumentFormat::Pdf));
        assert!(!b.supports(DocumentFormat::Epub));
        assert!(!b.supports(DocumentFormat::Doc));
    }
}
