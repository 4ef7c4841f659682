//! Input resolution: validate a source document and derive its sibling outputs.
//!
//! Every document maps to two siblings in the same directory: `name.md` for the
//! conversion stage and `name.json` for the extraction stage. Validation happens
//! here, before any backend runs, so a missing or mislabelled file fails with a
//! meaningful error rather than a tool crash.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Format tag derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    /// Legacy binary Word format.
    Doc,
    Odt,
    Rtf,
    Html,
    Epub,
    Pptx,
    Xlsx,
    /// Plain text (read as Markdown by text converters).
    Text,
    Image,
}

impl DocumentFormat {
    /// All known formats, in a stable order.
    pub const ALL: [DocumentFormat; 11] = [
        DocumentFormat::Pdf,
        DocumentFormat::Docx,
        DocumentFormat::Doc,
        DocumentFormat::Odt,
        DocumentFormat::Rtf,
        DocumentFormat::Html,
        DocumentFormat::Epub,
        DocumentFormat::Pptx,
        DocumentFormat::Xlsx,
        DocumentFormat::Text,
        DocumentFormat::Image,
    ];

    /// Map a lowercase extension (without the dot) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let format = match ext.to_ascii_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "doc" => Self::Doc,
            "odt" => Self::Odt,
            "rtf" => Self::Rtf,
            "html" | "htm" | "xhtml" => Self::Html,
            "epub" => Self::Epub,
            "pptx" => Self::Pptx,
            "xlsx" => Self::Xlsx,
            "txt" | "text" => Self::Text,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "tif" | "tiff" | "webp" => Self::Image,
            _ => return None,
        };
        Some(format)
    }

    /// Detect the format of a path from its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// Extensions (without dots) that map to this format.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Pdf => &["pdf"],
            Self::Docx => &["docx"],
            Self::Doc => &["doc"],
            Self::Odt => &["odt"],
            Self::Rtf => &["rtf"],
            Self::Html => &["html", "htm", "xhtml"],
            Self::Epub => &["epub"],
            Self::Pptx => &["pptx"],
            Self::Xlsx => &["xlsx"],
            Self::Text => &["txt", "text"],
            Self::Image => &["png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp"],
        }
    }

    /// Layout-bound formats that text converters cannot read.
    pub fn is_layout_bound(self) -> bool {
        matches!(self, Self::Pdf | Self::Image)
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Doc => "doc",
            Self::Odt => "odt",
            Self::Rtf => "rtf",
            Self::Html => "html",
            Self::Epub => "epub",
            Self::Pptx => "pptx",
            Self::Xlsx => "xlsx",
            Self::Text => "text",
            Self::Image => "image",
        };
        f.write_str(s)
    }
}

/// A validated, read-only source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    path: PathBuf,
    format: DocumentFormat,
}

impl Document {
    /// Validate `path` and detect its format.
    ///
    /// Checks existence, read permission, a known extension, and for PDFs the
    /// `%PDF` magic bytes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();

        if !path.is_file() {
            return Err(PipelineError::FileNotFound { path });
        }

        let format =
            DocumentFormat::from_path(&path).ok_or_else(|| PipelineError::UnsupportedFormat {
                path: path.clone(),
                detail: format!(
                    "unknown extension {:?}",
                    path.extension().map(|e| e.to_string_lossy().to_string())
                ),
            })?;

        match std::fs::File::open(&path) {
            Ok(mut f) => {
                if format == DocumentFormat::Pdf {
                    let mut magic = [0u8; 4];
                    match f.read_exact(&mut magic) {
                        Ok(()) if &magic == b"%PDF" => {}
                        Ok(()) => {
                            return Err(PipelineError::CorruptDocument {
                                path,
                                detail: format!("not a PDF, first bytes: {magic:?}"),
                            })
                        }
                        Err(_) => {
                            return Err(PipelineError::CorruptDocument {
                                path,
                                detail: "file is shorter than a PDF header".into(),
                            })
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(PipelineError::PermissionDenied { path });
            }
            Err(e) => return Err(PipelineError::ReadFailed { path, source: e }),
        }

        debug!("Resolved {} document: {}", format, path.display());
        Ok(Self { path, format })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    /// File stem used for backend output names.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string())
    }

    /// Sibling Markdown path (`name.ext` → `name.md`).
    pub fn markdown_path(&self) -> PathBuf {
        markdown_path_for(&self.path)
    }
}

/// Sibling Markdown path for any file.
pub fn markdown_path_for(path: &Path) -> PathBuf {
    path.with_extension("md")
}

/// Sibling JSON path for any file.
pub fn json_path_for(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Write `contents` to `path` atomically.
///
/// The temp file lives in the destination directory so the final rename never
/// crosses filesystems; an existing file is replaced only once the new contents
/// are fully written. A replaced file keeps its mode. A new file gets the same
/// mode `std::fs::write` would give it (0o666 less the umask on Unix).
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PipelineError> {
    use std::io::Write;

    let write_err = |source| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(write_err)?;

    let existing = std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.permissions());

    let mut builder = tempfile::Builder::new();
    builder.prefix(".dataset-extract");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Passed to open(2), so the process umask applies.
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    let mut tmp = builder.tempfile_in(&dir).map_err(write_err)?;
    if let Some(perms) = existing {
        tmp.as_file().set_permissions(perms).map_err(write_err)?;
    }
    tmp.write_all(contents).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
