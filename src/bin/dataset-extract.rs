//! CLI binary for dataset-extract.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig` / `ExtractionConfig` / `BatchConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dataset_extract::{
    clean_dir, convert_dir, extract_dir, extract_from_files_with_client, process_dir, status_dir,
    BackendKind, BatchConfig, BatchProgressCallback, BatchReport, BatchStage, ConversionConfig,
    Converter, ExtractionConfig, ExtractionGrouping, ExtractionSchema, LlamaExtractClient,
    LlamaExtractOptions, LlamaParseOptions, LlamaParsePreset, LlmClient, MarkerOptions,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar per stage plus a log line per item.
struct CliProgressCallback {
    bar: Mutex<Option<ProgressBar>>,
    item_start: Mutex<Option<Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
            item_start: Mutex::new(None),
            errors: AtomicUsize::new(0),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }

    fn elapsed_secs(&self) -> f64 {
        self.item_start
            .lock()
            .ok()
            .and_then(|mut t| t.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, stage: BatchStage, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} items  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        let bar = ProgressBar::new(total as u64);
        bar.set_style(style);
        bar.set_prefix(match stage {
            BatchStage::Conversion => "Converting",
            BatchStage::Extraction => "Extracting",
        });
        bar.enable_steady_tick(Duration::from_millis(80));
        bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Starting {stage} of {total} item(s)…"))
        ));
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(bar);
        }
    }

    fn on_item_start(&self, _stage: BatchStage, _index: usize, _total: usize, path: &Path) {
        if let Ok(mut t) = self.item_start.lock() {
            *t = Some(Instant::now());
        }
        let name = file_label(path);
        self.with_bar(|bar| bar.set_message(name));
    }

    fn on_item_complete(&self, _stage: BatchStage, index: usize, total: usize, path: &Path, status: &str) {
        let secs = self.elapsed_secs();
        let mark = if let Some(err) = status.strip_prefix("error: ") {
            self.errors.fetch_add(1, Ordering::SeqCst);
            let msg = if err.chars().count() > 80 {
                format!("{}\u{2026}", err.chars().take(79).collect::<String>())
            } else {
                err.to_string()
            };
            format!("{}  {}", red("✗"), red(&msg))
        } else if status == "skipped" {
            format!("{}  {}", dim("–"), dim(status))
        } else {
            format!("{}  {}", green("✓"), status)
        };
        self.with_bar(|bar| {
            bar.println(format!(
                "  {:>3}/{:<3} {}  {}  {}",
                index,
                total,
                file_label(path),
                mark,
                dim(&format!("{secs:.1}s")),
            ));
            bar.inc(1);
        });
    }

    fn on_batch_complete(&self, stage: BatchStage, succeeded: usize, failed: usize) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
        if failed == 0 {
            eprintln!("{} {stage}: {} item(s) done", green("✔"), bold(&succeeded.to_string()));
        } else {
            eprintln!(
                "{} {stage}: {} done  ({} failed)",
                if succeeded == 0 { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                red(&failed.to_string()),
            );
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one document (writes report.md beside it)
  dataset-extract convert report.docx

  # Convert a whole folder with Marker only
  dataset-extract --backend marker convert ./papers

  # Extract fields from Markdown
  dataset-extract extract report.md --schema invoice.json

  # One extraction per sub-directory
  dataset-extract extract-dir ./cases --schema case.json --group-by dir

  # Full pipeline with a specific model
  dataset-extract --provider openai/gpt-4.1 run ./papers --schema paper.json

  # Extract straight from the documents with LlamaExtract
  dataset-extract cloud-extract report.pdf memo.docx --schema invoice.json

  # What has been done so far
  dataset-extract status ./papers

SCHEMA FILES:
  Simple:    {"title": "Title of the paper", "year": "Publication year"}
  Extended:  {"year": {"description": "Publication year", "type": "integer"},
              "status": {"description": "Case status", "type": "enum",
                         "values": ["open", "closed"]}}
  Types: string (default), integer, float, date (YYYY-MM-DD), enum

PROVIDERS:
  Family       Key variable            Default model
  ─────────    ────────────────────    ─────────────────────────
  openai       OPENAI_API_KEY          gpt-4.1-mini
  anthropic    ANTHROPIC_API_KEY       claude-sonnet-4-20250514
  gemini       GEMINI_API_KEY          gemini-2.0-flash
  mistral      MISTRAL_API_KEY         mistral-small-latest
  openrouter   OPENROUTER_API_KEY      openai/gpt-4.1-mini
  xai          XAI_API_KEY             grok-3-mini
  azure        AZURE_OPENAI_API_KEY    gpt-4.1-mini
  ollama       (none)                  llama3.2 (default provider)
  lmstudio     (none)                  local-model

ENVIRONMENT VARIABLES:
  DATASET_EXTRACT_PROVIDER  Provider id, e.g. anthropic/claude-sonnet-4-20250514
  DATASET_EXTRACT_MODEL     Override the model of the provider
  PANDOC_PATH               pandoc binary
  MARKER_PATH               marker_single binary
  DOCLING_PATH              docling binary
  LLAMA_CLOUD_API_KEY       LlamaParse / LlamaExtract key (--backend llamaparse, cloud-extract)
  LLAMA_CLOUD_BASE_URL      LlamaCloud endpoint override
  DATASET_EXTRACT_AGENT     LlamaExtract agent name for cloud-extract
  RUST_LOG                  Log filter, overrides -v / -q
"#;

/// Convert documents to Markdown and extract evidence-backed structured data.
#[derive(Parser, Debug)]
#[command(
    name = "dataset-extract",
    version,
    about = "Convert documents to Markdown and extract structured data with LLMs",
    long_about = "Convert PDFs, office files, HTML and images to Markdown with Pandoc, Marker, \
Docling or LlamaParse, then extract the fields of a JSON schema with an LLM. Every extracted \
value carries the quote it came from and a confidence score.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    conversion: ConversionArgs,

    #[command(flatten)]
    extraction: ExtractionArgs,

    /// Only process files with these extensions (comma separated).
    #[arg(long, global = true, value_delimiter = ',', env = "DATASET_EXTRACT_EXTENSIONS")]
    extensions: Option<Vec<String>>,

    /// Do not descend into sub-directories.
    #[arg(long, global = true)]
    no_recursive: bool,

    /// Redo items whose output already exists.
    #[arg(long, global = true)]
    force: bool,

    /// Print reports and results as JSON on stdout.
    #[arg(long, global = true, env = "DATASET_EXTRACT_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "DATASET_EXTRACT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DATASET_EXTRACT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DATASET_EXTRACT_QUIET")]
    quiet: bool,
}

#[derive(Args, Debug)]
struct ConversionArgs {
    /// Use only this backend: pandoc, marker, docling, llamaparse.
    #[arg(short, long, global = true, env = "DATASET_EXTRACT_BACKEND")]
    backend: Option<BackendKind>,

    /// Let Marker call an LLM to improve tables and forms.
    #[arg(long, global = true)]
    marker_use_llm: bool,

    /// Marker LLM service class.
    #[arg(long, global = true)]
    marker_llm_service: Option<String>,

    /// Extra argument passed to marker_single (repeatable).
    #[arg(long = "marker-arg", global = true, allow_hyphen_values = true)]
    marker_args: Vec<String>,

    /// LlamaParse preset: cost_effective, agentic, agentic_plus.
    #[arg(long, global = true, default_value = "agentic")]
    llamaparse_preset: LlamaParsePreset,

    /// Kill a conversion tool after this many seconds.
    #[arg(long, global = true, env = "DATASET_EXTRACT_BACKEND_TIMEOUT")]
    backend_timeout: Option<u64>,

    /// Keep backend Markdown exactly as produced.
    #[arg(long, global = true)]
    no_postprocess: bool,
}

#[derive(Args, Debug)]
struct ExtractionArgs {
    /// LLM provider id: family or family/model.
    #[arg(
        long,
        global = true,
        env = "DATASET_EXTRACT_PROVIDER",
        long_help = "LLM provider as family or family/model, e.g. openai/gpt-4.1-mini.\n\
          Default: openai/gpt-4.1-mini when OPENAI_API_KEY is set, otherwise ollama/llama3.2."
    )]
    provider: Option<String>,

    /// Model ID, overriding the provider's model.
    #[arg(long, global = true, env = "DATASET_EXTRACT_MODEL")]
    model: Option<String>,

    /// Re-asks when the model's reply does not match the schema.
    #[arg(long, global = true, env = "DATASET_EXTRACT_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// LLM temperature.
    #[arg(long, global = true, default_value_t = 0.0)]
    temperature: f32,

    /// Max LLM output tokens.
    #[arg(long, global = true, default_value_t = 4096)]
    max_tokens: usize,

    /// LLM call timeout in seconds.
    #[arg(long, global = true, env = "DATASET_EXTRACT_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// Return bare values without evidence and confidence.
    #[arg(long, global = true)]
    no_evidence: bool,

    /// Path to a text file replacing the default system prompt.
    #[arg(long, global = true)]
    system_prompt: Option<PathBuf>,

    /// Path to a text file replacing the generated field instructions.
    #[arg(long, global = true)]
    prompt: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a document, or every document under a directory, to Markdown.
    Convert {
        /// Document or directory.
        path: PathBuf,

        /// Print the Markdown of a single document instead of writing it.
        #[arg(long)]
        stdout: bool,
    },

    /// Extract from one or more Markdown files in a single call.
    Extract {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long)]
        schema: PathBuf,

        /// Do not write the JSON beside the first file.
        #[arg(long)]
        no_save: bool,
    },

    /// Extract straight from documents with LlamaExtract (cloud, no evidence).
    CloudExtract {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long)]
        schema: PathBuf,

        /// LlamaExtract agent to reuse or create.
        #[arg(long, env = "DATASET_EXTRACT_AGENT")]
        agent: Option<String>,

        /// Do not write the JSON beside each document.
        #[arg(long)]
        no_save: bool,
    },

    /// Extract from every Markdown file under a directory.
    ExtractDir {
        dir: PathBuf,

        #[arg(short, long)]
        schema: PathBuf,

        /// One call per file or per directory.
        #[arg(long, default_value = "file")]
        group_by: ExtractionGrouping,
    },

    /// Convert a directory, then extract from the results.
    Run {
        dir: PathBuf,

        #[arg(short, long)]
        schema: PathBuf,

        #[arg(long, default_value = "file")]
        group_by: ExtractionGrouping,
    },

    /// Show which documents have Markdown and JSON.
    Status { dir: PathBuf },

    /// Delete generated Markdown and JSON next to documents.
    ///
    /// A JSON file is only deleted when it has the shape of an extraction
    /// result; other JSON next to a document is kept.
    Clean { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO logs are hidden behind the progress bar unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress = show_progress.then(CliProgressCallback::new);
    let progress: Option<&dyn BatchProgressCallback> =
        progress.as_ref().map(|p| p as &dyn BatchProgressCallback);

    match &cli.command {
        Command::Convert { path, stdout } => {
            let converter = Converter::from_config(&build_conversion_config(&cli)?);
            if path.is_dir() {
                let report = convert_dir(path, &converter, &build_batch_config(&cli, None)?, progress)
                    .await
                    .context("Conversion failed")?;
                finish_reports(&cli, &[&report])
            } else if *stdout {
                let output = converter.convert(path).await.context("Conversion failed")?;
                let mut handle = io::stdout().lock();
                handle
                    .write_all(output.markdown.as_bytes())
                    .context("Failed to write to stdout")?;
                Ok(())
            } else {
                let output = converter
                    .convert_to_file(path)
                    .await
                    .context("Conversion failed")?;
                if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&output).context("Failed to serialise output")?
                    );
                } else if !cli.quiet {
                    let written = output
                        .markdown_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    eprintln!(
                        "{}  {}  {}ms  →  {}",
                        green("✔"),
                        output.backend,
                        output.duration_ms,
                        bold(&written),
                    );
                    for attempt in &output.fallbacks {
                        eprintln!("   {} {}: {}", dim("↳"), attempt.backend, dim(&attempt.error));
                    }
                }
                Ok(())
            }
        }

        Command::Extract {
            files,
            schema,
            no_save,
        } => {
            let schema = load_schema(schema)?;
            let mut config = build_extraction_config(&cli).await?;
            config.save_json = !no_save;
            let client = LlmClient::from_config(&config).context("Failed to set up LLM provider")?;
            let result = extract_from_files_with_client(&client, files, &schema, &config)
                .await
                .context("Extraction failed")?;

            println!(
                "{}",
                serde_json::to_string_pretty(&result.to_json()).context("Failed to serialise result")?
            );
            if !cli.quiet {
                eprintln!(
                    "{}  {}/{} fields  {} attempt(s)  {}ms{}",
                    green("✔"),
                    result.populated().count(),
                    result.fields.len(),
                    result.attempts,
                    result.duration_ms,
                    result
                        .json_path
                        .as_deref()
                        .map(|p| format!("  →  {}", bold(&p.display().to_string())))
                        .unwrap_or_default(),
                );
                eprintln!(
                    "   {} tokens in  /  {} tokens out",
                    dim(&result.prompt_tokens.to_string()),
                    dim(&result.completion_tokens.to_string()),
                );
            }
            Ok(())
        }

        Command::CloudExtract {
            files,
            schema,
            agent,
            no_save,
        } => {
            let schema = load_schema(schema)?;
            let client = LlamaExtractClient::from_options(&LlamaExtractOptions {
                agent_name: agent.clone(),
                save_json: !no_save,
                ..LlamaExtractOptions::default()
            });
            let results = client
                .extract_files(files, &schema)
                .await
                .context("LlamaExtract failed")?;

            let mut failed = 0;
            for (path, outcome) in &results {
                match outcome {
                    Ok(result) => {
                        if cli.json {
                            println!(
                                "{}",
                                serde_json::to_string_pretty(&result.to_json())
                                    .context("Failed to serialise result")?
                            );
                        } else if !cli.quiet {
                            eprintln!(
                                "{}  {}  {}/{} fields",
                                green("✔"),
                                path.display(),
                                result.populated().count(),
                                result.fields.len()
                            );
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("  {} {}: {}", red("✗"), path.display(), e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} document(s) failed");
            }
            Ok(())
        }

        Command::ExtractDir {
            dir,
            schema,
            group_by,
        } => {
            let schema = load_schema(schema)?;
            let config = build_extraction_config(&cli).await?;
            let client = LlmClient::from_config(&config).context("Failed to set up LLM provider")?;
            let batch = build_batch_config(&cli, Some(*group_by))?;
            let report = extract_dir(dir, &schema, &client, &config, &batch, progress)
                .await
                .context("Extraction failed")?;
            finish_reports(&cli, &[&report])
        }

        Command::Run {
            dir,
            schema,
            group_by,
        } => {
            let schema = load_schema(schema)?;
            let converter = Converter::from_config(&build_conversion_config(&cli)?);
            let config = build_extraction_config(&cli).await?;
            let client = LlmClient::from_config(&config).context("Failed to set up LLM provider")?;
            let batch = build_batch_config(&cli, Some(*group_by))?;
            let (conversion, extraction) =
                process_dir(dir, &converter, &schema, &client, &config, &batch, progress)
                    .await
                    .context("Pipeline failed")?;
            finish_reports(&cli, &[&conversion, &extraction])
        }

        Command::Status { dir } => {
            let statuses = status_dir(dir, &build_batch_config(&cli, None)?)
                .context("Failed to read directory")?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&statuses).context("Failed to serialise status")?
                );
                return Ok(());
            }
            let mark = |b: bool| if b { green("✓") } else { dim("·") };
            println!("{}  {}  {}", bold("md"), bold("json"), bold("document"));
            for s in &statuses {
                let shown = s.path.strip_prefix(dir).unwrap_or(&s.path);
                println!("{}   {}     {}", mark(s.has_markdown), mark(s.has_json), shown.display());
            }
            let md = statuses.iter().filter(|s| s.has_markdown).count();
            let json = statuses.iter().filter(|s| s.has_json).count();
            println!(
                "{}",
                dim(&format!("{} document(s), {md} converted, {json} extracted", statuses.len()))
            );
            Ok(())
        }

        Command::Clean { dir } => {
            let removed =
                clean_dir(dir, &build_batch_config(&cli, None)?).context("Failed to clean directory")?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&removed).context("Failed to serialise paths")?
                );
            } else if !cli.quiet {
                for p in &removed {
                    eprintln!("  {} {}", red("−"), p.display());
                }
                eprintln!("{} removed {} file(s)", green("✔"), bold(&removed.len().to_string()));
            }
            Ok(())
        }
    }
}

/// Print reports and fail the process when any item failed.
fn finish_reports(cli: &Cli, reports: &[&BatchReport]) -> Result<()> {
    if cli.json {
        let json = match reports {
            [single] => serde_json::to_value(single),
            many => serde_json::to_value(many),
        }
        .context("Failed to serialise report")?;
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        for report in reports {
            eprintln!("{}", report.summary());
            for failure in report.failures() {
                eprintln!("  {} {}: {}", red("✗"), failure.path, failure.message);
            }
        }
    }

    let failed: usize = reports.iter().map(|r| r.failed()).sum();
    if failed > 0 {
        anyhow::bail!("{failed} item(s) failed");
    }
    Ok(())
}

fn load_schema(path: &Path) -> Result<ExtractionSchema> {
    ExtractionSchema::from_json_file(path)
        .with_context(|| format!("Failed to load schema from {:?}", path))
}

/// Map CLI args to `ConversionConfig`.
fn build_conversion_config(cli: &Cli) -> Result<ConversionConfig> {
    let args = &cli.conversion;
    let mut builder = ConversionConfig::builder()
        .marker(MarkerOptions {
            use_llm: args.marker_use_llm,
            llm_service: args.marker_llm_service.clone(),
            extra_args: args.marker_args.clone(),
        })
        .llamaparse(LlamaParseOptions {
            preset: args.llamaparse_preset,
            ..Default::default()
        })
        .postprocess(!args.no_postprocess);

    if let Some(kind) = args.backend {
        builder = builder.backend(kind);
    }
    if let Some(secs) = args.backend_timeout {
        builder = builder.backend_timeout_secs(secs);
    }
    builder.build().context("Invalid conversion configuration")
}

/// Map CLI args to `ExtractionConfig`.
async fn build_extraction_config(cli: &Cli) -> Result<ExtractionConfig> {
    let args = &cli.extraction;
    let mut builder = ExtractionConfig::builder()
        .max_retries(args.max_retries)
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .api_timeout_secs(args.api_timeout)
        .evidence(!args.no_evidence);

    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref path) = args.system_prompt {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(text);
    }
    if let Some(ref path) = args.prompt {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read prompt from {:?}", path))?;
        builder = builder.custom_prompt(text);
    }
    builder.build().context("Invalid extraction configuration")
}

/// Map CLI args to `BatchConfig`.
fn build_batch_config(cli: &Cli, grouping: Option<ExtractionGrouping>) -> Result<BatchConfig> {
    let mut builder = BatchConfig::builder()
        .recursive(!cli.no_recursive)
        .skip_existing(!cli.force)
        .grouping(grouping.unwrap_or_default());
    if let Some(ref exts) = cli.extensions {
        builder = builder.extensions(exts);
    }
    builder.build().context("Invalid batch configuration")
}
