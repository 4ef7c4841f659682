//! Pandoc: fast text-based conversion for office and markup formats.

use super::{resolve_binary, run_tool, BackendKind, ConversionBackend};
use crate::error::BackendError;
use crate::pipeline::document::{Document, DocumentFormat};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const PANDOC_ENV: &str = "PANDOC_PATH";

#[derive(Debug, Clone)]
pub struct PandocBackend {
    binary: PathBuf,
    timeout_secs: Option<u64>,
}

impl PandocBackend {
    /// `binary` wins over `PANDOC_PATH`, which wins over `pandoc` on `PATH`.
    pub fn new(binary: Option<&Path>) -> Self {
        Self {
            binary: resolve_binary(binary, PANDOC_ENV, "pandoc"),
            timeout_secs: None,
        }
    }

    pub fn timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args(document: &Document) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![document.path().into()];
        if document.format() == DocumentFormat::Text {
            args.extend(["-f".into(), "markdown".into()]);
        }
        args.extend([
            "-t".into(),
            "gfm".into(),
            "--wrap=none".into(),
            "--markdown-headings=atx".into(),
        ]);
        args
    }
}

impl Default for PandocBackend {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ConversionBackend for PandocBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pandoc
    }

    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(
            format,
            DocumentFormat::Docx
                | DocumentFormat::Odt
                | DocumentFormat::Rtf
                | DocumentFormat::Html
                | DocumentFormat::Epub
                | DocumentFormat::Text
        )
    }

    async fn convert(&self, document: &Document) -> Result<String, BackendError> {
        let stdout = run_tool(
            "pandoc",
            &self.binary,
            &Self::args(document),
            self.timeout_secs,
        )
        .await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_reads_layout_formats() {
        let b = PandocBackend::new(Some(Path::new("pandoc")));
        assert!(!b.supports(DocumentFormat::Pdf));
        assert!(!b.supports(DocumentFormat::Image));
        assert!(!b.supports(DocumentFormat::Doc));
        assert!(b.supports(DocumentFormat::Docx));
        assert!(b.supports(DocumentFormat::Text));
    }

    #[test]
    fn text_input_is_read_as_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("notes.txt");
        std::fs::write(&p, "hello").unwrap();
        let doc = Document::open(&p).unwrap();
        let args = PandocBackend::args(&doc);
        assert_eq!(args[1], OsString::from("-f"));
        assert_eq!(args[2], OsString::from("markdown"));
        assert!(args.contains(&OsString::from("gfm")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout() {
        // echo prints its arguments, which include the input path
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("memo.html");
        std::fs::write(&p, "<p>x</p>").unwrap();
        let doc = Document::open(&p).unwrap();

        let b = PandocBackend::new(Some(Path::new("echo")));
        let out = b.convert(&doc).await.unwrap();
        assert!(out.contains("memo.html"));
        assert!(out.contains("--wrap=none"));
    }
}
