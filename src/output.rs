//! Result types returned by conversion and batch operations.

use crate::backend::BackendKind;
use crate::error::ItemError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A backend that was tried and failed before the one that succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub backend: BackendKind,
    pub error: String,
}

/// Markdown produced for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionOutput {
    pub source: PathBuf,
    pub markdown: String,
    /// Backend that produced `markdown`.
    pub backend: BackendKind,
    /// Backends that failed first, in the order tried.
    pub fallbacks: Vec<FailedAttempt>,
    /// Sibling file written, when the output was persisted.
    pub markdown_path: Option<PathBuf>,
    pub duration_ms: u64,
}

/// What happened to one batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum ItemStatus {
    Converted,
    Extracted,
    /// Output already existed.
    Skipped,
    Failed(ItemError),
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converted => f.write_str("converted"),
            Self::Extracted => f.write_str("extracted"),
            Self::Skipped => f.write_str("skipped"),
            Self::Failed(e) => write!(f, "error: {}", e.message),
        }
    }
}

/// Outcome for one document (conversion) or one Markdown group (extraction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Source document, or the first Markdown file of the group.
    pub path: PathBuf,
    /// Every Markdown file in an extraction group. Empty for conversion items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<PathBuf>,
    #[serde(flatten)]
    pub status: ItemStatus,
    /// The `.md` or `.json` written or found.
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    pub duration_ms: u64,
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, ItemStatus::Failed(_))
    }
}

/// Which half of the pipeline a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStage {
    Conversion,
    Extraction,
}

impl fmt::Display for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Conversion => "conversion",
            Self::Extraction => "extraction",
        })
    }
}

/// Per-item outcomes of a directory run, sorted by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub stage: BatchStage,
    pub root: PathBuf,
    pub items: Vec<ItemOutcome>,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn new(stage: BatchStage, root: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            root: root.into(),
            items: Vec::new(),
            duration_ms: 0,
        }
    }

    fn count(&self, pred: impl Fn(&ItemStatus) -> bool) -> usize {
        self.items.iter().filter(|i| pred(&i.status)).count()
    }

    pub fn converted(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Converted))
    }

    pub fn extracted(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Extracted))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Failed(_)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemError> {
        self.items.iter().filter_map(|i| match &i.status {
            ItemStatus::Failed(e) => Some(e),
            _ => None,
        })
    }

    pub fn outcome(&self, path: &std::path::Path) -> Option<&ItemOutcome> {
        self.items.iter().find(|i| i.path == path)
    }

    /// True when no item failed.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// One-line summary, e.g. `conversion: 4 converted, 1 skipped, 0 failed`.
    pub fn summary(&self) -> String {
        let done = match self.stage {
            BatchStage::Conversion => format!("{} converted", self.converted()),
            BatchStage::Extraction => format!("{} extracted", self.extracted()),
        };
        format!(
            "{}: {}, {} skipped, {} failed ({} ms)",
            self.stage,
            done,
            self.skipped(),
            self.failed(),
            self.duration_ms
        )
    }
}

/// Pipeline state of one document on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub path: PathBuf,
    pub has_markdown: bool,
    pub has_json: bool,
}
