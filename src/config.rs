//! Configuration types for conversion, extraction and batch runs.
//!
//! Each stage has its own struct built through a builder:
//! [`ConversionConfig`] picks and tunes conversion backends,
//! [`ExtractionConfig`] controls the LLM call, and [`BatchConfig`] decides
//! which files a directory run touches.

use crate::backend::BackendKind;
use crate::error::PipelineError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

// ── Conversion ───────────────────────────────────────────────────────────────

/// Configuration for document-to-Markdown conversion.
///
/// # Example
/// ```rust
/// use dataset_extract::{BackendKind, ConversionConfig};
///
/// let config = ConversionConfig::builder()
///     .fallback_order(vec![BackendKind::Pandoc, BackendKind::Docling])
///     .backend_timeout_secs(300)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionConfig {
    /// Force a single backend. No fallback is attempted when set.
    pub backend: Option<BackendKind>,

    /// Order in which backends are tried when none is forced.
    /// Default: Pandoc, Marker, Docling.
    pub fallback_order: Vec<BackendKind>,

    /// Explicit `pandoc` binary. Falls back to `PANDOC_PATH`, then `PATH`.
    pub pandoc_path: Option<PathBuf>,

    /// Explicit `marker_single` binary. Falls back to `MARKER_PATH`, then `PATH`.
    pub marker_path: Option<PathBuf>,

    /// Explicit `docling` binary. Falls back to `DOCLING_PATH`, then `PATH`.
    pub docling_path: Option<PathBuf>,

    pub marker: MarkerOptions,

    pub llamaparse: LlamaParseOptions,

    /// Kill a backend process that runs longer than this. Default: no limit.
    pub backend_timeout_secs: Option<u64>,

    /// Normalise backend Markdown before writing it. Default: true.
    pub postprocess: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            backend: None,
            fallback_order: vec![BackendKind::Pandoc, BackendKind::Marker, BackendKind::Docling],
            pandoc_path: None,
            marker_path: None,
            docling_path: None,
            marker: MarkerOptions::default(),
            llamaparse: LlamaParseOptions::default(),
            backend_timeout_secs: None,
            postprocess: true,
        }
    }
}

impl ConversionConfig {
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Backends that will actually be consulted, in order.
    pub fn effective_order(&self) -> Vec<BackendKind> {
        match self.backend {
            Some(kind) => vec![kind],
            None => self.fallback_order.clone(),
        }
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = Some(kind);
        self
    }

    pub fn fallback_order(mut self, order: Vec<BackendKind>) -> Self {
        self.config.fallback_order = order;
        self
    }

    pub fn pandoc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pandoc_path = Some(path.into());
        self
    }

    pub fn marker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.marker_path = Some(path.into());
        self
    }

    pub fn docling_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.docling_path = Some(path.into());
        self
    }

    pub fn marker(mut self, options: MarkerOptions) -> Self {
        self.config.marker = options;
        self
    }

    pub fn llamaparse(mut self, options: LlamaParseOptions) -> Self {
        self.config.llamaparse = options;
        self
    }

    pub fn backend_timeout_secs(mut self, secs: u64) -> Self {
        self.config.backend_timeout_secs = Some(secs.max(1));
        self
    }

    pub fn postprocess(mut self, v: bool) -> Self {
        self.config.postprocess = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, PipelineError> {
        let c = &self.config;
        if c.backend.is_none() && c.fallback_order.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "fallback order must name at least one backend".into(),
            ));
        }
        for (i, kind) in c.fallback_order.iter().enumerate() {
            if c.fallback_order[..i].contains(kind) {
                return Err(PipelineError::InvalidConfig(format!(
                    "backend '{kind}' appears twice in the fallback order"
                )));
            }
        }
        if c.llamaparse.poll_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "LlamaParse poll interval must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Options passed through to `marker_single`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerOptions {
    /// Let Marker call an LLM to improve tables and forms.
    pub use_llm: bool,

    /// Marker LLM service class, e.g. `marker.services.openai.OpenAIService`.
    pub llm_service: Option<String>,

    /// Extra raw arguments appended to the command line.
    pub extra_args: Vec<String>,
}

/// LlamaParse parsing presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlamaParsePreset {
    /// Fast mode, text only. Cheapest.
    CostEffective,
    #[default]
    Agentic,
    /// Premium mode. Best for complex tables and scans.
    AgenticPlus,
}

impl fmt::Display for LlamaParsePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CostEffective => "cost_effective",
            Self::Agentic => "agentic",
            Self::AgenticPlus => "agentic_plus",
        })
    }
}

impl FromStr for LlamaParsePreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cost_effective" | "fast" => Ok(Self::CostEffective),
            "agentic" => Ok(Self::Agentic),
            "agentic_plus" | "premium" => Ok(Self::AgenticPlus),
            other => Err(format!(
                "unknown LlamaParse preset '{other}' (expected cost_effective, agentic or agentic_plus)"
            )),
        }
    }
}

/// Settings for the LlamaParse cloud backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlamaParseOptions {
    pub preset: LlamaParsePreset,

    /// API base URL. Default: `LLAMA_CLOUD_BASE_URL` or the public endpoint.
    pub base_url: Option<String>,

    /// API key. Default: `LLAMA_CLOUD_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,

    /// Delay between job status polls. Default: 2000 ms.
    pub poll_interval_ms: u64,

    /// Give up on a job after this long. Default: 600 s.
    pub max_wait_secs: u64,
}

impl Default for LlamaParseOptions {
    fn default() -> Self {
        Self {
            preset: LlamaParsePreset::default(),
            base_url: None,
            api_key: None,
            poll_interval_ms: 2000,
            max_wait_secs: 600,
        }
    }
}

/// Settings for LlamaExtract, the cloud extraction service.
///
/// Used instead of an LLM provider when fields are extracted straight from
/// the original documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlamaExtractOptions {
    /// API base URL. Default: `LLAMA_CLOUD_BASE_URL` or the public endpoint.
    pub base_url: Option<String>,

    /// API key. Default: `LLAMA_CLOUD_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,

    /// Agent to reuse or create. Default: `<schema name>-extractor`.
    pub agent_name: Option<String>,

    /// Write the result beside each document. Default: true.
    pub save_json: bool,

    /// Delay between job status polls. Default: 2000 ms.
    pub poll_interval_ms: u64,

    /// Give up on a job after this long. Default: 600 s.
    pub max_wait_secs: u64,
}

impl Default for LlamaExtractOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            agent_name: None,
            save_json: true,
            poll_interval_ms: 2000,
            max_wait_secs: 600,
        }
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// Configuration for one structured-extraction call.
///
/// The provider is resolved in this order: [`provider`](Self::provider),
/// [`provider_name`](Self::provider_name), `DATASET_EXTRACT_PROVIDER`,
/// `openai/gpt-4.1-mini` when `OPENAI_API_KEY` is set, then `ollama/llama3.2`.
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Provider identifier, `family` or `family/model`.
    pub provider_name: Option<String>,

    /// Model override. Wins over a model embedded in `provider_name`.
    pub model: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the model may generate. Default: 4096.
    pub max_tokens: usize,

    /// Re-asks after a reply fails schema validation. Default: 2.
    /// At most [`MAX_RETRIES_LIMIT`].
    pub max_retries: u32,

    /// Replaces the built-in system prompt.
    pub system_prompt: Option<String>,

    /// Replaces the generated field instructions in the user message.
    pub custom_prompt: Option<String>,

    /// Ask for `{value, evidence, confidence}` per field. Default: true.
    pub evidence: bool,

    /// Write the result beside the first input. Default: true.
    pub save_json: bool,

    /// Per-call timeout in seconds. Default: 300.
    pub api_timeout_secs: u64,
}

/// Upper bound accepted for [`ExtractionConfig::max_retries`].
pub const MAX_RETRIES_LIMIT: u32 = 100;

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider_name: None,
            model: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            max_retries: 2,
            system_prompt: None,
            custom_prompt: None,
            evidence: true,
            save_json: true,
            api_timeout_secs: 300,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("custom_prompt", &self.custom_prompt.is_some())
            .field("evidence", &self.evidence)
            .field("save_json", &self.save_json)
            .finish()
    }
}

impl ExtractionConfig {
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.custom_prompt = Some(prompt.into());
        self
    }

    pub fn evidence(mut self, v: bool) -> Self {
        self.config.evidence = v;
        self
    }

    pub fn save_json(mut self, v: bool) -> Self {
        self.config.save_json = v;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn build(self) -> Result<ExtractionConfig, PipelineError> {
        let c = &self.config;
        if c.max_tokens == 0 {
            return Err(PipelineError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.max_retries > MAX_RETRIES_LIMIT {
            return Err(PipelineError::InvalidConfig(format!(
                "max_retries must be ≤ {MAX_RETRIES_LIMIT} (got {})",
                c.max_retries
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if let Some(name) = &c.provider_name {
            if name.trim().is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "provider name must not be empty".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

// ── Batch ────────────────────────────────────────────────────────────────────

/// How Markdown files are grouped into extraction calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionGrouping {
    /// One call per Markdown file. (default)
    #[default]
    PerFile,
    /// One call per directory, covering every Markdown file in it.
    PerDirectory,
}

impl FromStr for ExtractionGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "per_file" | "per-file" => Ok(Self::PerFile),
            "dir" | "directory" | "per_directory" | "per-directory" => Ok(Self::PerDirectory),
            other => Err(format!("unknown grouping '{other}' (expected file or dir)")),
        }
    }
}

/// Settings for directory runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Document extensions (without dots) to convert. `None` means every
    /// format the configured backends can read.
    pub extensions: Option<Vec<String>>,

    /// Descend into sub-directories. Default: true.
    pub recursive: bool,

    /// Leave items whose output already exists. Default: true.
    pub skip_existing: bool,

    pub grouping: ExtractionGrouping,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            extensions: None,
            recursive: true,
            skip_existing: true,
            grouping: ExtractionGrouping::default(),
        }
    }
}

impl BatchConfig {
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    /// Restrict conversion to these extensions. Leading dots are ignored.
    pub fn extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.extensions = Some(
            exts.into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        );
        self
    }

    pub fn recursive(mut self, v: bool) -> Self {
        self.config.recursive = v;
        self
    }

    pub fn skip_existing(mut self, v: bool) -> Self {
        self.config.skip_existing = v;
        self
    }

    pub fn grouping(mut self, grouping: ExtractionGrouping) -> Self {
        self.config.grouping = grouping;
        self
    }

    pub fn build(self) -> Result<BatchConfig, PipelineError> {
        if let Some(exts) = &self.config.extensions {
            if exts.is_empty() || exts.iter().any(|e| e.is_empty()) {
                return Err(PipelineError::InvalidConfig(
                    "extension list must be non-empty and contain no blank entries".into(),
                ));
            }
            if exts.iter().any(|e| e == "md" || e == "json") {
                return Err(PipelineError::InvalidConfig(
                    "md and json are pipeline outputs, not convertible documents".into(),
                ));
            }
        }
        Ok(self.config)
    }
}
