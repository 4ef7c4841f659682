//! Directory runs: convert every document, then extract from the Markdown.
//!
//! Items are processed one after another. A failing item is recorded in the
//! report and the run moves on; only problems with the directory itself
//! (missing root) are returned as errors.

use crate::config::{BatchConfig, ExtractionConfig, ExtractionGrouping};
use crate::convert::Converter;
use crate::error::{ItemError, PipelineError};
use crate::evidence::ExtractionResult;
use crate::extract::extract_from_files_with_client;
use crate::output::{BatchReport, BatchStage, DocumentStatus, ItemOutcome, ItemStatus};
use crate::pipeline::document::{json_path_for, markdown_path_for, DocumentFormat};
use crate::pipeline::llm::ChatClient;
use crate::progress::{BatchProgressCallback, NoopProgressCallback};
use crate::schema::ExtractionSchema;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// Files under `dir` whose extension is in `extensions`, sorted.
///
/// Extensions are compared case-insensitively and given without dots.
/// Hidden files and directories are skipped.
pub fn find_files(
    dir: impl AsRef<Path>,
    extensions: &[&str],
    recursive: bool,
) -> Result<Vec<PathBuf>, PipelineError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(PipelineError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }

    let wanted: HashSet<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    let mut files: Vec<PathBuf> = ignore::WalkBuilder::new(dir)
        .standard_filters(false)
        .hidden(true)
        .max_depth(if recursive { None } else { Some(1) })
        .build()
        .flatten()
        .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| wanted.contains(&e.to_ascii_lowercase()))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Convert every eligible document under `dir` to a sibling `.md`.
pub async fn convert_dir(
    dir: impl AsRef<Path>,
    converter: &Converter,
    batch: &BatchConfig,
    progress: Option<&dyn BatchProgressCallback>,
) -> Result<BatchReport, PipelineError> {
    let dir = dir.as_ref();
    let start = Instant::now();
    let progress = progress.unwrap_or(&NoopProgressCallback);

    let extensions: Vec<String> = match &batch.extensions {
        Some(exts) => exts.clone(),
        None => converter
            .supported_extensions()
            .into_iter()
            .map(str::to_string)
            .collect(),
    };
    let ext_refs: Vec<&str> = extensions.iter().map(String::as_str).collect();
    let files = find_files(dir, &ext_refs, batch.recursive)?;
    info!("Found {} document(s) under {}", files.len(), dir.display());

    let total = files.len();
    let mut report = BatchReport::new(BatchStage::Conversion, dir);
    let mut written: HashSet<PathBuf> = HashSet::new();
    progress.on_batch_start(BatchStage::Conversion, total);

    for (i, path) in files.into_iter().enumerate() {
        progress.on_item_start(BatchStage::Conversion, i + 1, total, &path);
        let item_start = Instant::now();
        let md_path = markdown_path_for(&path);

        let (status, backend, output) = if written.contains(&md_path) {
            warn!(
                "{} maps to {}, already written in this run",
                path.display(),
                md_path.display()
            );
            (ItemStatus::Skipped, None, Some(md_path))
        } else if batch.skip_existing && md_path.exists() {
            (ItemStatus::Skipped, None, Some(md_path))
        } else {
            match converter.convert_to_file(&path).await {
                Ok(out) => {
                    written.insert(md_path.clone());
                    (ItemStatus::Converted, Some(out.backend), Some(md_path))
                }
                Err(e) => {
                    error!("Conversion failed: {}", e);
                    (ItemStatus::Failed(ItemError::new(&path, &e)), None, None)
                }
            }
        };

        progress.on_item_complete(BatchStage::Conversion, i + 1, total, &path, &status.to_string());
        report.items.push(ItemOutcome {
            path,
            members: Vec::new(),
            status,
            output,
            backend,
            duration_ms: item_start.elapsed().as_millis() as u64,
        });
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    progress.on_batch_complete(
        BatchStage::Conversion,
        report.converted() + report.skipped(),
        report.failed(),
    );
    info!("{}", report.summary());
    Ok(report)
}

/// Extract from every `.md` under `dir`, grouped per `batch.grouping`.
pub async fn extract_dir(
    dir: impl AsRef<Path>,
    schema: &ExtractionSchema,
    client: &dyn ChatClient,
    config: &ExtractionConfig,
    batch: &BatchConfig,
    progress: Option<&dyn BatchProgressCallback>,
) -> Result<BatchReport, PipelineError> {
    let dir = dir.as_ref();
    let markdown = find_files(dir, &["md"], batch.recursive)?;
    info!("Found {} Markdown file(s) under {}", markdown.len(), dir.display());
    extract_groups(
        dir,
        group_markdown(markdown, batch.grouping),
        schema,
        client,
        config,
        batch,
        progress,
    )
    .await
}

/// Convert, then extract from the Markdown of every converted or skipped
/// document. Returns the conversion and extraction reports.
pub async fn process_dir(
    dir: impl AsRef<Path>,
    converter: &Converter,
    schema: &ExtractionSchema,
    client: &dyn ChatClient,
    config: &ExtractionConfig,
    batch: &BatchConfig,
    progress: Option<&dyn BatchProgressCallback>,
) -> Result<(BatchReport, BatchReport), PipelineError> {
    let dir = dir.as_ref();
    let conversion = convert_dir(dir, converter, batch, progress).await?;

    let mut markdown: Vec<PathBuf> = conversion
        .items
        .iter()
        .filter(|i| matches!(i.status, ItemStatus::Converted | ItemStatus::Skipped))
        .filter_map(|i| i.output.clone())
        .filter(|p| p.is_file())
        .collect();
    markdown.sort();
    markdown.dedup();

    let extraction = extract_groups(
        dir,
        group_markdown(markdown, batch.grouping),
        schema,
        client,
        config,
        batch,
        progress,
    )
    .await?;
    Ok((conversion, extraction))
}

/// Which documents under `dir` already have Markdown and JSON siblings.
pub fn status_dir(
    dir: impl AsRef<Path>,
    batch: &BatchConfig,
) -> Result<Vec<DocumentStatus>, PipelineError> {
    let documents = find_documents(dir.as_ref(), batch)?;
    Ok(documents
        .into_iter()
        .map(|path| DocumentStatus {
            has_markdown: markdown_path_for(&path).is_file(),
            has_json: json_path_for(&path).is_file(),
            path,
        })
        .collect())
}

/// Delete the generated `.md` and `.json` siblings of documents under `dir`.
///
/// Documents themselves and files that are not a document's sibling are
/// never touched. A `.json` sibling is removed only when it has the shape of
/// a saved extraction result. Returns the removed paths, sorted.
pub fn clean_dir(dir: impl AsRef<Path>, batch: &BatchConfig) -> Result<Vec<PathBuf>, PipelineError> {
    let mut removed = Vec::new();
    for doc in find_documents(dir.as_ref(), batch)? {
        let json_path = json_path_for(&doc);
        for sibling in [markdown_path_for(&doc), json_path.clone()] {
            if sibling == doc || !sibling.is_file() || removed.contains(&sibling) {
                continue;
            }
            if sibling == json_path && !is_saved_result(&sibling) {
                warn!("Keeping {}: not an extraction result", sibling.display());
                continue;
            }
            std::fs::remove_file(&sibling).map_err(|e| PipelineError::OutputWriteFailed {
                path: sibling.clone(),
                source: e,
            })?;
            info!("Removed {}", sibling.display());
            removed.push(sibling);
        }
    }
    removed.sort();
    Ok(removed)
}

// ── Internal helpers ─────────────────────────────────────────────────────────

fn is_saved_result(path: &Path) -> bool {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
        .is_some_and(|json| ExtractionResult::is_saved_shape(&json))
}

fn find_documents(dir: &Path, batch: &BatchConfig) -> Result<Vec<PathBuf>, PipelineError> {
    let extensions: Vec<&str> = match &batch.extensions {
        Some(exts) => exts.iter().map(String::as_str).collect(),
        None => DocumentFormat::ALL
            .iter()
            .flat_map(|f| f.extensions().iter().copied())
            .collect(),
    };
    find_files(dir, &extensions, batch.recursive)
}

/// Split sorted Markdown paths into extraction groups.
fn group_markdown(files: Vec<PathBuf>, grouping: ExtractionGrouping) -> Vec<Vec<PathBuf>> {
    match grouping {
        ExtractionGrouping::PerFile => files.into_iter().map(|f| vec![f]).collect(),
        ExtractionGrouping::PerDirectory => {
            let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
            for f in files {
                let parent = f.parent().map(Path::to_path_buf).unwrap_or_default();
                by_dir.entry(parent).or_default().push(f);
            }
            by_dir
                .into_values()
                .map(|mut group| {
                    group.sort();
                    group
                })
                .collect()
        }
    }
}

async fn extract_groups(
    root: &Path,
    groups: Vec<Vec<PathBuf>>,
    schema: &ExtractionSchema,
    client: &dyn ChatClient,
    config: &ExtractionConfig,
    batch: &BatchConfig,
    progress: Option<&dyn BatchProgressCallback>,
) -> Result<BatchReport, PipelineError> {
    let start = Instant::now();
    let progress = progress.unwrap_or(&NoopProgressCallback);
    let total = groups.len();
    let mut report = BatchReport::new(BatchStage::Extraction, root);
    progress.on_batch_start(BatchStage::Extraction, total);

    for (i, group) in groups.into_iter().enumerate() {
        let Some(first) = group.first().cloned() else {
            continue;
        };
        progress.on_item_start(BatchStage::Extraction, i + 1, total, &first);
        let item_start = Instant::now();
        let json_path = json_path_for(&first);

        let (status, output) = if batch.skip_existing && json_path.exists() {
            (ItemStatus::Skipped, Some(json_path))
        } else {
            match extract_from_files_with_client(client, &group, schema, config).await {
                Ok(result) => (ItemStatus::Extracted, result.json_path),
                Err(e) => {
                    error!("Extraction failed for {}: {}", first.display(), e);
                    (ItemStatus::Failed(ItemError::new(&first, &e)), None)
                }
            }
        };

        progress.on_item_complete(BatchStage::Extraction, i + 1, total, &first, &status.to_string());
        report.items.push(ItemOutcome {
            path: first,
            members: if group.len() > 1 { group } else { Vec::new() },
            status,
            output,
            backend: None,
            duration_ms: item_start.elapsed().as_millis() as u64,
        });
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    progress.on_batch_complete(
        BatchStage::Extraction,
        report.extracted() + report.skipped(),
        report.failed(),
    );
    info!("{}", report.summary());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn find_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("b.PDF"));
        touch(&root.join("a.docx"));
        touch(&root.join("notes.md"));
        touch(&root.join("sub/c.pdf"));
        touch(&root.join(".hidden/d.pdf"));

        let all = find_files(root, &["pdf", ".docx"], true).unwrap();
        assert_eq!(
            all,
            vec![root.join("a.docx"), root.join("b.PDF"), root.join("sub/c.pdf")]
        );

        let top = find_files(root, &["pdf"], false).unwrap();
        assert_eq!(top, vec![root.join("b.PDF")]);
    }

    #[test]
    fn find_files_missing_dir() {
        let err = find_files("/no/such/dir", &["pdf"], true).unwrap_err();
        assert!(matches!(err, PipelineError::DirectoryNotFound { .. }));
    }

    #[test]
    fn grouping_per_directory() {
        let files = vec![
            PathBuf::from("/d/a/2.md"),
            PathBuf::from("/d/a/1.md"),
            PathBuf::from("/d/b/3.md"),
        ];
        let groups = group_markdown(files.clone(), ExtractionGrouping::PerDirectory);
        assert_eq!(
            groups,
            vec![
                vec![PathBuf::from("/d/a/1.md"), PathBuf::from("/d/a/2.md")],
                vec![PathBuf::from("/d/b/3.md")],
            ]
        );
        assert_eq!(group_markdown(files, ExtractionGrouping::PerFile).len(), 3);
    }

    #[test]
    fn status_and_clean_only_touch_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("report.pdf"));
        touch(&root.join("report.md"));
        std::fs::write(
            root.join("report.json"),
            r##"{"title": {"value": "Q3", "evidence": "# Q3", "confidence": 0.9}}"##,
        )
        .unwrap();
        touch(&root.join("letter.docx"));
        touch(&root.join("README.md"));
        touch(&root.join("schema.json"));

        let status = status_dir(root, &BatchConfig::default()).unwrap();
        assert_eq!(status.len(), 2);
        let report = status.iter().find(|s| s.path.ends_with("report.pdf")).unwrap();
        assert!(report.has_markdown && report.has_json);
        let letter = status.iter().find(|s| s.path.ends_with("letter.docx")).unwrap();
        assert!(!letter.has_markdown && !letter.has_json);

        let removed = clean_dir(root, &BatchConfig::default()).unwrap();
        assert_eq!(removed, vec![root.join("report.json"), root.join("report.md")]);
        assert!(root.join("report.pdf").exists());
        assert!(root.join("README.md").exists());
        assert!(root.join("schema.json").exists());
    }

    #[test]
    fn clean_keeps_hand_written_json() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("letter.docx"));
        touch(&root.join("letter.md"));
        std::fs::write(root.join("letter.json"), r#"{"author": {"name": "Ada"}}"#).unwrap();
        touch(&root.join("memo.docx"));
        std::fs::write(root.join("memo.json"), "not json").unwrap();
        touch(&root.join("plan.docx"));
        std::fs::write(root.join("plan.json"), r#"{"title": "Plan", "pages": 4}"#).unwrap();

        let removed = clean_dir(root, &BatchConfig::default()).unwrap();
        assert_eq!(removed, vec![root.join("letter.md"), root.join("plan.json")]);
        assert!(root.join("letter.json").exists());
        assert!(root.join("memo.json").exists());
    }
}
