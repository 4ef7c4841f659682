//! Integration tests for dataset-extract.
//!
//! Conversion tools and LLM providers are replaced by in-test fakes, so these
//! run offline. On unix, `/bin/echo` and `/bin/false` stand in for real
//! conversion binaries to exercise process spawning.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use dataset_extract::backend::PandocBackend;
use dataset_extract::pipeline::llm::LlmClient;
use dataset_extract::{
    clean_dir, convert_dir, extract_dir, extract_from_file_with_client,
    extract_from_files_with_client, process_dir, status_dir, BackendError, BackendKind,
    BatchConfig, ChatClient, ChatReply, ConversionBackend, Converter, Document, DocumentFormat,
    ExtractionConfig, ExtractionGrouping, ExtractionSchema, IntWithEvidence, ItemStatus,
    PipelineError, PromptMessage, StringWithEvidence,
};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Test helpers ─────────────────────────────────────────────────────────────

const OFFICE: &[DocumentFormat] = &[
    DocumentFormat::Docx,
    DocumentFormat::Pdf,
    DocumentFormat::Html,
    DocumentFormat::Text,
];

/// Backend returning canned Markdown, or failing every call.
struct FakeBackend {
    kind: BackendKind,
    markdown: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl FakeBackend {
    fn ok(kind: BackendKind, markdown: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            markdown: Mutex::new(Some(markdown.to_string())),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            markdown: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    fn set_markdown(&self, markdown: &str) {
        *self.markdown.lock().unwrap() = Some(markdown.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn supports(&self, format: DocumentFormat) -> bool {
        OFFICE.contains(&format)
    }

    async fn convert(&self, document: &Document) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.markdown.lock().unwrap().clone() {
            Some(md) => Ok(format!("# {}\n\n{md}", document.stem())),
            None => Err(BackendError::ToolFailed {
                tool: self.kind.to_string(),
                status: "exit status: 1".into(),
                stderr: "simulated crash".into(),
            }),
        }
    }
}

/// Chat client that pops scripted replies, then repeats the last one.
struct ScriptedClient {
    replies: Mutex<Vec<String>>,
    last: Mutex<String>,
    requests: Mutex<Vec<Vec<PromptMessage>>>,
}

impl ScriptedClient {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
            last: Mutex::new(String::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Text of the user message of the n-th request.
    fn user_text(&self, n: usize) -> String {
        self.requests.lock().unwrap()[n]
            .iter()
            .filter(|m| m.role == dataset_extract::Role::User)
            .map(|m| m.content.clone())
            .next()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, messages: &[PromptMessage]) -> Result<ChatReply, PipelineError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let content = match self.replies.lock().unwrap().pop() {
            Some(reply) => {
                *self.last.lock().unwrap() = reply.clone();
                reply
            }
            None => self.last.lock().unwrap().clone(),
        };
        Ok(ChatReply {
            content,
            prompt_tokens: 120,
            completion_tokens: 40,
        })
    }
}

fn report_schema() -> ExtractionSchema {
    ExtractionSchema::from_json_str(
        "report",
        r#"{
            "title": "Title of the report",
            "year": {"description": "Publication year", "type": "integer"},
            "status": {"description": "Review status", "type": "enum", "values": ["draft", "final"]}
        }"#,
    )
    .unwrap()
}

const GOOD_REPLY: &str = r##"{
    "title": {"value": "Annual Report", "evidence": "# Annual Report", "confidence": 0.95},
    "year": {"value": "2024", "evidence": "published in 2024", "confidence": 0.8},
    "status": {"value": null, "evidence": "", "confidence": 0.0}
}"##;

fn write(path: &Path, contents: &[u8]) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
    path.to_path_buf()
}

fn extraction_config() -> ExtractionConfig {
    ExtractionConfig::default()
}

// ── Conversion ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn conversion_leaves_non_empty_sibling_markdown() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write(&dir.path().join("memo.docx"), b"PK\x03\x04");
    let conv = Converter::new(vec![FakeBackend::ok(BackendKind::Pandoc, "Body text.")]);

    let out = conv.convert_to_file(&doc).await.unwrap();
    let md_path = dir.path().join("memo.md");
    assert_eq!(out.markdown_path.as_deref(), Some(md_path.as_path()));

    let written = std::fs::read_to_string(&md_path).unwrap();
    assert!(!written.trim().is_empty());
    assert_eq!(written, "# memo\n\nBody text.\n");
}

#[tokio::test]
async fn failing_primary_falls_back_and_only_total_failure_errors() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write(&dir.path().join("memo.docx"), b"PK\x03\x04");

    let primary = FakeBackend::failing(BackendKind::Pandoc);
    let secondary = FakeBackend::ok(BackendKind::Docling, "Recovered.");
    let conv = Converter::new(vec![primary.clone(), secondary.clone()]);
    let out = conv.convert_to_file(&doc).await.unwrap();
    assert_eq!(out.backend, BackendKind::Docling);
    assert_eq!(out.fallbacks.len(), 1);
    assert_eq!(out.fallbacks[0].backend, BackendKind::Pandoc);
    assert_eq!((primary.calls(), secondary.calls()), (1, 1));

    let conv = Converter::new(vec![
        FakeBackend::failing(BackendKind::Pandoc),
        FakeBackend::failing(BackendKind::Docling),
    ]);
    match conv.convert(&doc).await {
        Err(PipelineError::AllBackendsFailed { attempts, .. }) => {
            let kinds: Vec<_> = attempts.iter().map(|(k, _)| *k).collect();
            assert_eq!(kinds, vec![BackendKind::Pandoc, BackendKind::Docling]);
        }
        other => panic!("expected AllBackendsFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn reconversion_overwrites_instead_of_appending() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write(&dir.path().join("memo.docx"), b"PK\x03\x04");
    let backend = FakeBackend::ok(BackendKind::Pandoc, "First version.");
    let conv = Converter::new(vec![backend.clone()]);

    conv.convert_to_file(&doc).await.unwrap();
    backend.set_markdown("Second version.");
    conv.convert_to_file(&doc).await.unwrap();

    let written = std::fs::read_to_string(dir.path().join("memo.md")).unwrap();
    assert_eq!(written, "# memo\n\nSecond version.\n");
    assert!(!written.contains("First"));
}

#[cfg(unix)]
#[tokio::test]
async fn written_outputs_are_readable_like_plain_writes() {
    use std::os::unix::fs::PermissionsExt;
    let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;

    let dir = tempfile::tempdir().unwrap();
    let doc = write(&dir.path().join("memo.docx"), b"PK\x03\x04");
    let reference = write(&dir.path().join("reference.txt"), b"x");

    let conv = Converter::new(vec![FakeBackend::ok(BackendKind::Pandoc, "Body text.")]);
    let out = conv.convert_to_file(&doc).await.unwrap();
    let md_path = out.markdown_path.unwrap();
    assert_eq!(mode(&md_path), mode(&reference));

    let client = ScriptedClient::new(&[GOOD_REPLY]);
    let result =
        extract_from_file_with_client(&client, &md_path, &report_schema(), &extraction_config())
            .await
            .unwrap();
    let json_path = result.json_path.unwrap();
    assert_eq!(mode(&json_path), mode(&reference));
}

#[cfg(unix)]
#[tokio::test]
async fn real_process_backends_fall_back() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write(&dir.path().join("page.html"), b"<h1>Hi</h1>");

    // /bin/false exits 1; /bin/echo prints its arguments, which is non-empty Markdown.
    let broken = Arc::new(PandocBackend::new(Some(Path::new("/bin/false"))));
    let echo = Arc::new(PandocBackend::new(Some(Path::new("/bin/echo"))));
    let conv = Converter::new(vec![broken, echo]);

    let out = conv.convert_to_file(&doc).await.unwrap();
    assert!(out.markdown.contains("page.html"));
    assert_eq!(out.fallbacks.len(), 1);
    assert!(dir.path().join("page.md").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn forced_backend_failure_is_returned_without_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let doc = write(&dir.path().join("page.html"), b"<h1>Hi</h1>");
    let conv = Converter::forced(Arc::new(PandocBackend::new(Some(Path::new("/bin/false")))));

    let err = conv.convert_to_file(&doc).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::BackendFailed {
            backend: BackendKind::Pandoc,
            ..
        }
    ));
    assert!(!dir.path().join("page.md").exists());
}

// ── Extraction ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn populated_fields_always_carry_evidence() {
    let dir = tempfile::tempdir().unwrap();
    let md = write(
        &dir.path().join("report.md"),
        b"# Annual Report\n\nThis report was published in 2024.\n",
    );

    // First reply has a value without evidence and is re-asked.
    let client = ScriptedClient::new(&[
        r#"{"title": {"value": "Annual Report", "evidence": "", "confidence": 0.9}}"#,
        GOOD_REPLY,
    ]);
    let result = extract_from_file_with_client(&client, &md, &report_schema(), &extraction_config())
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(client.request_count(), 2);
    assert_eq!(result.prompt_tokens, 240);
    for field in result.populated() {
        assert!(
            field.evidence.as_deref().is_some_and(|e| !e.is_empty()),
            "{} has no evidence",
            field.name
        );
    }
    assert_eq!(result.value("year"), Some(&json!(2024)));
    assert!(!result.field("status").unwrap().is_populated());

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap())
            .unwrap();
    assert_eq!(saved["title"]["evidence"], "# Annual Report");
    assert!(saved.get("status").is_none());
    for (_, entry) in saved.as_object().unwrap() {
        assert!(entry["evidence"].as_str().is_some_and(|e| !e.is_empty()));
    }
}

#[tokio::test]
async fn result_deserializes_into_evidence_struct() {
    #[derive(Deserialize)]
    struct Report {
        title: StringWithEvidence,
        year: IntWithEvidence,
        status: StringWithEvidence,
    }

    let client = ScriptedClient::new(&[GOOD_REPLY]);
    let mut config = extraction_config();
    config.save_json = false;
    let result = dataset_extract::extract_from_text_with_client(
        &client,
        "# Annual Report\n\npublished in 2024",
        &report_schema(),
        &config,
    )
    .await
    .unwrap();

    let report: Report = result.deserialize_into().unwrap();
    assert_eq!(report.title.value.as_deref(), Some("Annual Report"));
    assert_eq!(report.year.value, Some(2024));
    assert!(report.status.value.is_none());
}

#[tokio::test]
async fn multi_file_call_sends_headers_and_saves_beside_first() {
    let dir = tempfile::tempdir().unwrap();
    let a = write(&dir.path().join("a.md"), b"alpha");
    let b = write(&dir.path().join("b.md"), b"beta");
    let client = ScriptedClient::new(&[GOOD_REPLY]);

    let result =
        extract_from_files_with_client(&client, &[&a, &b], &report_schema(), &extraction_config())
            .await
            .unwrap();

    let text = client.user_text(0);
    assert!(text.contains("=== DOCUMENT 1: a.md ===\nalpha"));
    assert!(text.contains("=== DOCUMENT 2: b.md ===\nbeta"));
    assert_eq!(result.sources, vec![a, b]);
    assert_eq!(result.json_path, Some(dir.path().join("a.json")));
    assert!(!dir.path().join("b.json").exists());
}

#[tokio::test]
async fn malformed_replies_exhaust_retries() {
    let client = ScriptedClient::new(&["not json at all"]);
    let config = ExtractionConfig::builder()
        .max_retries(1)
        .save_json(false)
        .build()
        .unwrap();

    let err = dataset_extract::extract_from_text_with_client(&client, "text", &report_schema(), &config)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::MalformedResponse { attempts: 2, .. }));
    assert_eq!(client.request_count(), 2);
}

#[test]
fn missing_credentials_fail_before_any_client_is_built() {
    let config = ExtractionConfig::builder()
        .provider_name("anthropic/claude-sonnet-4-20250514")
        .build()
        .unwrap();

    let err = LlmClient::from_config_with_env(&config, &|_| None).unwrap_err();
    match err {
        PipelineError::MissingCredentials { provider, env_var } => {
            assert_eq!(provider, "anthropic");
            assert_eq!(env_var, "ANTHROPIC_API_KEY");
        }
        other => panic!("expected MissingCredentials, got {other:?}"),
    }

    let blank = LlmClient::from_config_with_env(&config, &|_| Some("  ".into())).unwrap_err();
    assert!(matches!(blank, PipelineError::MissingCredentials { .. }));
}

// ── Batch ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn corrupt_document_does_not_block_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("a.docx"), b"PK\x03\x04");
    write(&root.join("broken.pdf"), b"this is not a pdf");
    write(&root.join("nested/c.html"), b"<p>c</p>");

    let conv = Converter::new(vec![FakeBackend::ok(BackendKind::Pandoc, "Text.")]);
    let report = convert_dir(root, &conv, &BatchConfig::default(), None)
        .await
        .unwrap();

    assert_eq!(report.items.len(), 3);
    assert_eq!(report.converted(), 2);
    assert_eq!(report.failed(), 1);
    let broken = report.outcome(&root.join("broken.pdf")).unwrap();
    assert!(broken.is_failure());
    assert!(broken.status.to_string().starts_with("error: "));

    assert!(root.join("a.md").exists());
    assert!(root.join("nested/c.md").exists());
    assert!(!root.join("broken.md").exists());
}

#[tokio::test]
async fn existing_outputs_are_skipped_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("a.docx"), b"PK\x03\x04");
    write(&root.join("a.md"), b"kept\n");

    let backend = FakeBackend::ok(BackendKind::Pandoc, "New.");
    let conv = Converter::new(vec![backend.clone()]);

    let report = convert_dir(root, &conv, &BatchConfig::default(), None)
        .await
        .unwrap();
    assert_eq!(report.skipped(), 1);
    assert_eq!(backend.calls(), 0);
    assert_eq!(std::fs::read_to_string(root.join("a.md")).unwrap(), "kept\n");

    let force = BatchConfig::builder().skip_existing(false).build().unwrap();
    let report = convert_dir(root, &conv, &force, None).await.unwrap();
    assert_eq!(report.converted(), 1);
    assert_eq!(std::fs::read_to_string(root.join("a.md")).unwrap(), "# a\n\nNew.\n");
}

#[tokio::test]
async fn extract_dir_groups_per_directory() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("case1/b.md"), b"second");
    write(&root.join("case1/a.md"), b"first");
    write(&root.join("case2/x.md"), b"only");

    let client = ScriptedClient::new(&[GOOD_REPLY]);
    let batch = BatchConfig::builder()
        .grouping(ExtractionGrouping::PerDirectory)
        .build()
        .unwrap();
    let report = extract_dir(root, &report_schema(), &client, &extraction_config(), &batch, None)
        .await
        .unwrap();

    assert_eq!(report.extracted(), 2);
    assert_eq!(client.request_count(), 2);
    assert!(root.join("case1/a.json").exists());
    assert!(!root.join("case1/b.json").exists());
    assert!(root.join("case2/x.json").exists());

    let group = report.outcome(&root.join("case1/a.md")).unwrap();
    assert_eq!(group.members, vec![root.join("case1/a.md"), root.join("case1/b.md")]);
}

#[tokio::test]
async fn full_run_then_status_and_clean() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("report.docx"), b"PK\x03\x04");
    write(&root.join("broken.pdf"), b"garbage");
    write(&root.join("notes.txt"), b"plain notes");

    let conv = Converter::new(vec![FakeBackend::ok(BackendKind::Pandoc, "published in 2024")]);
    let client = ScriptedClient::new(&[GOOD_REPLY]);
    let (conversion, extraction) = process_dir(
        root,
        &conv,
        &report_schema(),
        &client,
        &extraction_config(),
        &BatchConfig::default(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(conversion.converted(), 2);
    assert_eq!(conversion.failed(), 1);
    assert_eq!(extraction.extracted(), 2);
    assert!(matches!(
        extraction.outcome(&root.join("report.md")).unwrap().status,
        ItemStatus::Extracted
    ));

    let statuses = status_dir(root, &BatchConfig::default()).unwrap();
    let done: Vec<_> = statuses
        .iter()
        .filter(|s| s.has_markdown && s.has_json)
        .map(|s| s.path.clone())
        .collect();
    assert_eq!(done, vec![root.join("notes.txt"), root.join("report.docx")]);

    // A second run has nothing left to do.
    let (conversion, extraction) = process_dir(
        root,
        &conv,
        &report_schema(),
        &client,
        &extraction_config(),
        &BatchConfig::default(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(conversion.skipped(), 2);
    assert_eq!(extraction.skipped(), 2);
    assert_eq!(client.request_count(), 2);

    let removed = clean_dir(root, &BatchConfig::default()).unwrap();
    assert_eq!(removed.len(), 4);
    assert!(root.join("report.docx").exists());
    assert!(root.join("broken.pdf").exists());
    assert!(!root.join("report.md").exists());
    assert!(!root.join("notes.json").exists());
}
