//! LlamaParse: cloud parsing over HTTP. Never part of the default chain.
//!
//! Flow: upload the file, poll the job until it settles, then fetch the
//! Markdown result. The API key is checked before the first request.

use super::{BackendKind, ConversionBackend};
use crate::config::{LlamaParseOptions, LlamaParsePreset};
use crate::error::BackendError;
use crate::pipeline::document::{Document, DocumentFormat};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const API_KEY_ENV: &str = "LLAMA_CLOUD_API_KEY";
pub const BASE_URL_ENV: &str = "LLAMA_CLOUD_BASE_URL";
pub const DEFAULT_BASE_URL: &str = "https://api.cloud.llamaindex.ai";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct MarkdownResult {
    markdown: String,
}

#[derive(Debug, Clone)]
pub struct LlamaParseBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    preset: LlamaParsePreset,
    poll_interval: Duration,
    max_wait: Duration,
}

impl LlamaParseBackend {
    /// Build from options, filling the key and base URL from the environment.
    pub fn from_options(options: &LlamaParseOptions) -> Self {
        let api_key = options
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok());
        let base_url = options
            .base_url
            .clone()
            .or_else(|| std::env::var(BASE_URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            preset: options.preset,
            poll_interval: Duration::from_millis(options.poll_interval_ms),
            max_wait: Duration::from_secs(options.max_wait_secs),
        }
    }

    fn remote(context: &str, e: impl std::fmt::Display) -> BackendError {
        BackendError::Remote(format!("{context}: {e}"))
    }

    async fn check(resp: reqwest::Response, context: &str) -> Result<reqwest::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::Remote(format!(
            "{context} returned HTTP {status}: {}",
            body.trim()
        )))
    }

    async fn upload(&self, document: &Document, key: &str) -> Result<String, BackendError> {
        let bytes = tokio::fs::read(document.path()).await?;
        let file_name = document
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".into());

        let mut form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name));
        match self.preset {
            LlamaParsePreset::CostEffective => form = form.text("fast_mode", "true"),
            LlamaParsePreset::Agentic => {}
            LlamaParsePreset::AgenticPlus => form = form.text("premium_mode", "true"),
        }

        let resp = self
            .client
            .post(format!("{}/api/v1/parsing/upload", self.base_url))
            .bearer_auth(key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Self::remote("upload", e))?;
        let job: UploadResponse = Self::check(resp, "upload")
            .await?
            .json()
            .await
            .map_err(|e| Self::remote("upload response", e))?;
        Ok(job.id)
    }

    async fn wait_for(&self, job_id: &str, key: &str) -> Result<(), BackendError> {
        let started = Instant::now();
        loop {
            let resp = self
                .client
                .get(format!("{}/api/v1/parsing/job/{job_id}", self.base_url))
                .bearer_auth(key)
                .send()
                .await
                .map_err(|e| Self::remote("job status", e))?;
            let job: JobStatus = Self::check(resp, "job status")
                .await?
                .json()
                .await
                .map_err(|e| Self::remote("job status response", e))?;

            match job.status.to_ascii_uppercase().as_str() {
                "SUCCESS" => return Ok(()),
                "ERROR" | "CANCELED" | "CANCELLED" => {
                    return Err(BackendError::Remote(format!(
                        "job {job_id} finished with status {}",
                        job.status
                    )))
                }
                other => debug!("LlamaParse job {} is {}", job_id, other),
            }

            if started.elapsed() >= self.max_wait {
                return Err(BackendError::Timeout {
                    tool: "llamaparse".into(),
                    secs: self.max_wait.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ConversionBackend for LlamaParseBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LlamaParse
    }

    fn supports(&self, format: DocumentFormat) -> bool {
        format != DocumentFormat::Text
    }

    async fn convert(&self, document: &Document) -> Result<String, BackendError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| BackendError::MissingCredentials {
                env_var: API_KEY_ENV.into(),
            })?;

        let job_id = self.upload(document, key).await?;
        info!("LlamaParse job {} ({}) for {}", job_id, self.preset, document.path().display());
        self.wait_for(&job_id, key).await?;

        let resp = self
            .client
            .get(format!(
                "{}/api/v1/parsing/job/{job_id}/result/markdown",
                self.base_url
            ))
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| Self::remote("result", e))?;
        let result: MarkdownResult = Self::check(resp, "result")
            .await?
            .json()
            .await
            .map_err(|e| Self::remote("result response", e))?;
        Ok(result.markdown)
    }
}
