//! Document-to-Markdown entry points.
//!
//! [`Converter`] owns an ordered list of backends. Without a forced backend it
//! tries every backend that reads the document's format, in order, and keeps
//! the first non-empty Markdown. A forced backend runs alone and its failure is
//! returned as-is.

use crate::backend::{build_backend, BackendKind, ConversionBackend};
use crate::config::ConversionConfig;
use crate::error::{BackendError, PipelineError};
use crate::output::{ConversionOutput, FailedAttempt};
use crate::pipeline::document::{write_atomic, Document, DocumentFormat};
use crate::pipeline::postprocess;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Backend dispatcher with fallback.
#[derive(Clone)]
pub struct Converter {
    backends: Vec<Arc<dyn ConversionBackend>>,
    forced: bool,
    postprocess: bool,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("backends", &self.kinds())
            .field("forced", &self.forced)
            .field("postprocess", &self.postprocess)
            .finish()
    }
}

impl Converter {
    /// Build the backends named by `config`.
    pub fn from_config(config: &ConversionConfig) -> Self {
        let backends = config
            .effective_order()
            .into_iter()
            .map(|k| build_backend(k, config))
            .collect();
        let converter = Self {
            backends,
            forced: config.backend.is_some(),
            postprocess: true,
        };
        converter.postprocess(config.postprocess)
    }

    /// Try `backends` in order.
    pub fn new(backends: Vec<Arc<dyn ConversionBackend>>) -> Self {
        Self {
            backends,
            forced: false,
            postprocess: true,
        }
    }

    /// Use `backend` alone, with no fallback.
    pub fn forced(backend: Arc<dyn ConversionBackend>) -> Self {
        Self {
            backends: vec![backend],
            forced: true,
            postprocess: true,
        }
    }

    /// Toggle Markdown normalisation (on by default).
    pub fn postprocess(mut self, v: bool) -> Self {
        self.postprocess = v;
        self
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Whether any configured backend reads `format`.
    pub fn supports(&self, format: DocumentFormat) -> bool {
        self.backends.iter().any(|b| b.supports(format))
    }

    /// Extensions (without dots) of every format some backend reads.
    pub fn supported_extensions(&self) -> Vec<&'static str> {
        DocumentFormat::ALL
            .into_iter()
            .filter(|f| self.supports(*f))
            .flat_map(|f| f.extensions().iter().copied())
            .collect()
    }

    /// Convert `path` and return the Markdown without writing it.
    pub async fn convert(&self, path: impl AsRef<Path>) -> Result<ConversionOutput, PipelineError> {
        let start = Instant::now();
        let document = Document::open(path.as_ref())?;
        let format = document.format();

        let candidates: Vec<&Arc<dyn ConversionBackend>> = if self.forced {
            self.backends.iter().collect()
        } else {
            self.backends.iter().filter(|b| b.supports(format)).collect()
        };
        if candidates.is_empty() {
            let mut detail = format!(
                "no configured backend reads {format} files (configured: {})",
                self.kinds()
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            if format == DocumentFormat::Doc {
                detail.push_str(
                    "; legacy .doc is only read by llamaparse, save it as .docx or use that backend",
                );
            }
            return Err(PipelineError::UnsupportedFormat {
                path: document.path().to_path_buf(),
                detail,
            });
        }

        let mut attempts: Vec<(BackendKind, BackendError)> = Vec::new();
        for backend in candidates {
            info!("Converting {} with {}", document.path().display(), backend.name());

            match self.run_backend(backend.as_ref(), &document).await {
                Ok(markdown) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    debug!(
                        "{} produced {} bytes in {}ms",
                        backend.name(),
                        markdown.len(),
                        duration_ms
                    );
                    return Ok(ConversionOutput {
                        source: document.path().to_path_buf(),
                        markdown,
                        backend: backend.kind(),
                        fallbacks: attempts
                            .iter()
                            .map(|(kind, err)| FailedAttempt {
                                backend: *kind,
                                error: err.to_string(),
                            })
                            .collect(),
                        markdown_path: None,
                        duration_ms,
                    });
                }
                Err(err) if self.forced => {
                    return Err(PipelineError::BackendFailed {
                        path: document.path().to_path_buf(),
                        backend: backend.kind(),
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(
                        "{} failed on {}: {}",
                        backend.name(),
                        document.path().display(),
                        err
                    );
                    attempts.push((backend.kind(), err));
                }
            }
        }

        Err(PipelineError::AllBackendsFailed {
            path: document.path().to_path_buf(),
            attempts,
        })
    }

    /// Convert `path` and write the Markdown beside it as `name.md`.
    ///
    /// An existing `.md` is replaced atomically, and only after a backend
    /// succeeds.
    pub async fn convert_to_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<ConversionOutput, PipelineError> {
        let mut output = self.convert(path).await?;
        let md_path = crate::pipeline::document::markdown_path_for(&output.source);
        write_atomic(&md_path, output.markdown.as_bytes())?;
        info!("Wrote {}", md_path.display());
        output.markdown_path = Some(md_path);
        Ok(output)
    }

    async fn run_backend(
        &self,
        backend: &dyn ConversionBackend,
        document: &Document,
    ) -> Result<String, BackendError> {
        if !backend.supports(document.format()) {
            return Err(BackendError::Unsupported {
                format: document.format().to_string(),
            });
        }
        let raw = backend.convert(document).await?;
        let markdown = if self.postprocess {
            postprocess::clean_markdown(&raw)
        } else {
            raw
        };
        if postprocess::is_blank(&markdown) {
            return Err(BackendError::EmptyOutput {
                tool: backend.name().to_string(),
            });
        }
        Ok(markdown)
    }
}

/// Convert a document to Markdown without writing it.
///
/// # Example
/// ```rust,no_run
/// use dataset_extract::{convert, ConversionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let output = convert("report.docx", &ConversionConfig::default()).await?;
/// println!("{} via {}", output.markdown, output.backend);
/// # Ok(())
/// # }
/// ```
pub async fn convert(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, PipelineError> {
    Converter::from_config(config).convert(path).await
}

/// Convert a document and write the sibling `.md`, replacing any previous one.
pub async fn convert_to_file(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, PipelineError> {
    Converter::from_config(config).convert_to_file(path).await
}

/// Synchronous wrapper around [`convert_to_file`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert_to_file(path, config))
}
