//! LLM interaction: resolve a provider and send chat requests.
//!
//! Everything above this module talks to a [`ChatClient`], never to a
//! concrete provider. [`LlmClient`] is the production implementation over an
//! `edgequake_llm` provider; tests substitute a scripted client.
//!
//! ## Provider Resolution
//!
//! 1. Pre-built provider in [`ExtractionConfig::provider`]
//! 2. Explicit provider id (`family` or `family/model`)
//! 3. `DATASET_EXTRACT_PROVIDER`
//! 4. `openai/gpt-4.1-mini` when `OPENAI_API_KEY` is set
//! 5. `ollama/llama3.2`
//!
//! Credentials are checked before the client is built so a missing key fails
//! without touching the network.

use crate::config::ExtractionConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const PROVIDER_ENV: &str = "DATASET_EXTRACT_PROVIDER";
pub const DEFAULT_PROVIDER: &str = "ollama/llama3.2";
const OPENAI_DEFAULT: &str = "openai/gpt-4.1-mini";

/// A provider family: credential variable and default model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderFamily {
    pub name: &'static str,
    /// `None` for local servers that need no key.
    pub env_var: Option<&'static str>,
    pub default_model: &'static str,
}

pub const PROVIDER_FAMILIES: &[ProviderFamily] = &[
    ProviderFamily { name: "openai", env_var: Some("OPENAI_API_KEY"), default_model: "gpt-4.1-mini" },
    ProviderFamily { name: "anthropic", env_var: Some("ANTHROPIC_API_KEY"), default_model: "claude-sonnet-4-20250514" },
    ProviderFamily { name: "gemini", env_var: Some("GEMINI_API_KEY"), default_model: "gemini-2.0-flash" },
    ProviderFamily { name: "mistral", env_var: Some("MISTRAL_API_KEY"), default_model: "mistral-small-latest" },
    ProviderFamily { name: "openrouter", env_var: Some("OPENROUTER_API_KEY"), default_model: "openai/gpt-4.1-mini" },
    ProviderFamily { name: "xai", env_var: Some("XAI_API_KEY"), default_model: "grok-3-mini" },
    ProviderFamily { name: "azure", env_var: Some("AZURE_OPENAI_API_KEY"), default_model: "gpt-4.1-mini" },
    ProviderFamily { name: "ollama", env_var: None, default_model: "llama3.2" },
    ProviderFamily { name: "lmstudio", env_var: None, default_model: "local-model" },
];

fn family(name: &str) -> Option<&'static ProviderFamily> {
    PROVIDER_FAMILIES.iter().find(|f| f.name == name)
}

fn supported_families() -> String {
    PROVIDER_FAMILIES
        .iter()
        .map(|f| f.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parsed provider identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub family: String,
    pub model: String,
}

impl ProviderSpec {
    /// Parse `family` or `family/model`. The model may itself contain `/`.
    pub fn parse(id: &str) -> Result<Self, PipelineError> {
        let id = id.trim();
        let (fam, model) = match id.split_once('/') {
            Some((f, m)) => (f.trim().to_ascii_lowercase(), Some(m.trim())),
            None => (id.to_ascii_lowercase(), None),
        };
        let known = family(&fam).ok_or_else(|| PipelineError::UnknownProvider {
            provider: id.to_string(),
            supported: supported_families(),
        })?;
        let model = match model {
            Some("") => {
                return Err(PipelineError::UnknownProvider {
                    provider: id.to_string(),
                    supported: supported_families(),
                })
            }
            Some(m) => m.to_string(),
            None => known.default_model.to_string(),
        };
        Ok(Self { family: fam, model })
    }

    /// Variable holding this family's API key, if it needs one.
    pub fn credential_env(&self) -> Option<&'static str> {
        family(&self.family).and_then(|f| f.env_var)
    }

    /// Fail when the family needs a key that `lookup` cannot supply.
    pub fn check_credentials(
        &self,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<(), PipelineError> {
        match self.credential_env() {
            Some(var) if lookup(var).is_none_or(|v| v.trim().is_empty()) => {
                Err(PipelineError::MissingCredentials {
                    provider: self.family.clone(),
                    env_var: var.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ProviderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.model)
    }
}

/// Pick the provider id for `config` (steps 2 to 5 of the resolution order).
pub fn resolve_spec(
    config: &ExtractionConfig,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ProviderSpec, PipelineError> {
    let non_empty = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

    let id = if let Some(name) = &config.provider_name {
        name.clone()
    } else if let Some(env_id) = non_empty(PROVIDER_ENV) {
        env_id
    } else if non_empty("OPENAI_API_KEY").is_some() {
        OPENAI_DEFAULT.to_string()
    } else {
        DEFAULT_PROVIDER.to_string()
    };

    let mut spec = ProviderSpec::parse(&id)?;
    if let Some(model) = config.model.as_deref().filter(|m| !m.trim().is_empty()) {
        spec.model = model.to_string();
    }
    Ok(spec)
}

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Provider-independent chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatReply {
    pub content: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// A chat-completion endpoint.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Provider id used in logs and errors.
    fn name(&self) -> &str;

    async fn chat(&self, messages: &[PromptMessage]) -> Result<ChatReply, PipelineError>;
}

// ── edgequake-llm client ─────────────────────────────────────────────────────

/// [`ChatClient`] over an `edgequake_llm` provider.
pub struct LlmClient {
    provider: Arc<dyn LLMProvider>,
    name: String,
    options: CompletionOptions,
    timeout: Duration,
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LlmClient {
    /// Wrap an existing provider.
    pub fn new(provider: Arc<dyn LLMProvider>, name: impl Into<String>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            name: name.into(),
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Resolve and build the provider for `config`, reading the environment.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, PipelineError> {
        Self::from_config_with_env(config, &|var| std::env::var(var).ok())
    }

    /// As [`from_config`](Self::from_config) with an explicit variable lookup.
    pub fn from_config_with_env(
        config: &ExtractionConfig,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, PipelineError> {
        if let Some(provider) = &config.provider {
            return Ok(Self::new(Arc::clone(provider), "custom", config));
        }

        let spec = resolve_spec(config, lookup)?;
        spec.check_credentials(lookup)?;

        let provider = ProviderFactory::create_llm_provider(&spec.family, &spec.model).map_err(
            |e| PipelineError::ProviderNotConfigured {
                provider: spec.to_string(),
                hint: format!("{e}"),
            },
        )?;
        info!("Using LLM provider {}", spec);
        Ok(Self::new(provider, spec.to_string(), config))
    }
}

#[async_trait]
impl ChatClient for LlmClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, messages: &[PromptMessage]) -> Result<ChatReply, PipelineError> {
        let messages: Vec<ChatMessage> = messages
            .iter()
            .map(|m| match m.role {
                Role::System => ChatMessage::system(m.content.as_str()),
                Role::User => ChatMessage::user(m.content.as_str()),
                Role::Assistant => ChatMessage::assistant(m.content.as_str()),
            })
            .collect();

        let start = Instant::now();
        let response = tokio::time::timeout(
            self.timeout,
            self.provider.chat(&messages, Some(&self.options)),
        )
        .await
        .map_err(|_| PipelineError::LlmApiError {
            provider: self.name.clone(),
            message: format!("no reply within {}s", self.timeout.as_secs()),
        })?
        .map_err(|e| classify_provider_error(&self.name, e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            self.name,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(ChatReply {
            content: response.content,
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
        })
    }
}

/// Map a provider error message onto the matching fatal error.
pub(crate) fn classify_provider_error(provider: &str, message: String) -> PipelineError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        PipelineError::RateLimitExceeded {
            provider: provider.to_string(),
            message,
        }
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        PipelineError::AuthError {
            provider: provider.to_string(),
            detail: message,
        }
    } else {
        PipelineError::LlmApiError {
            provider: provider.to_string(),
            message,
        }
    }
}
