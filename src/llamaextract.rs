//! LlamaExtract: schema-driven extraction in the cloud, straight from the
//! original documents. An alternative to converting and prompting locally.
//!
//! Flow per document: look up the extraction agent for the schema (created on
//! first use), upload the file, queue a job, poll it until it settles, then
//! fetch its data. Batches queue every job before polling any of them.
//!
//! The service returns bare values, so results are plain-mode
//! [`ExtractionResult`]s: validated and coerced against the schema, without
//! evidence quotes.

use crate::backend::llamaparse::{API_KEY_ENV, BASE_URL_ENV, DEFAULT_BASE_URL};
use crate::config::LlamaExtractOptions;
use crate::error::PipelineError;
use crate::evidence::ExtractionResult;
use crate::extract::save_result;
use crate::pipeline::document::json_path_for;
use crate::pipeline::structured::validate_object;
use crate::schema::ExtractionSchema;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROVIDER: &str = "llamaextract";

#[derive(Debug, Deserialize)]
struct Agent {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Job {
    id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct JobResult {
    #[serde(default)]
    data: Value,
}

/// Agent name used when none is configured: `<schema name>-extractor`,
/// lowercased, with anything but letters and digits turned into `-`.
pub fn default_agent_name(schema: &ExtractionSchema) -> String {
    let stem: String = schema
        .name()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-extractor", stem.trim_matches('-'))
}

#[derive(Debug, Clone)]
pub struct LlamaExtractClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    agent_name: Option<String>,
    save_json: bool,
    poll_interval: Duration,
    max_wait: Duration,
}

impl LlamaExtractClient {
    /// Build from options, filling the key and base URL from the environment.
    pub fn from_options(options: &LlamaExtractOptions) -> Self {
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
            agent_name: options.agent_name.clone(),
            save_json: options.save_json,
            poll_interval: Duration::from_millis(options.poll_interval_ms),
            max_wait: Duration::from_secs(options.max_wait_secs),
        }
    }

    /// Id of the agent for `schema`, creating it when the name is unknown.
    pub async fn ensure_agent(&self, schema: &ExtractionSchema) -> Result<String, PipelineError> {
        let key = self.key()?;
        let name = self
            .agent_name
            .clone()
            .unwrap_or_else(|| default_agent_name(schema));

        let resp = self
            .client
            .get(format!(
                "{}/api/v1/extraction/extraction-agents/by-name/{name}",
                self.base_url
            ))
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| api_error("agent lookup", e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            info!("Creating LlamaExtract agent '{}'", name);
            let body = json!({
                "name": name,
                "data_schema": schema.to_json_schema(false),
            });
            let agent: Agent = self
                .send(
                    self.client
                        .post(format!("{}/api/v1/extraction/extraction-agents", self.base_url))
                        .json(&body),
                    "agent creation",
                    key,
                )
                .await?;
            return Ok(agent.id);
        }

        let agent: Agent = check(resp, "agent lookup")
            .await?
            .json()
            .await
            .map_err(|e| api_error("agent lookup response", e))?;
        debug!("Reusing LlamaExtract agent '{}' ({})", name, agent.id);
        Ok(agent.id)
    }

    /// Extract `schema` from one document.
    ///
    /// Writes `name.json` beside the document when `save_json` is set.
    pub async fn extract_file(
        &self,
        path: impl AsRef<Path>,
        schema: &ExtractionSchema,
    ) -> Result<ExtractionResult, PipelineError> {
        let path = path.as_ref();
        let key = self.key()?;
        if !path.is_file() {
            return Err(PipelineError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let start = Instant::now();
        let agent_id = self.ensure_agent(schema).await?;
        let job_id = self.queue(&agent_id, path, key).await?;
        let data = self.collect(&job_id, key).await?;
        self.finish(path, schema, &data, start)
    }

    /// Extract `schema` from several documents, one result per readable path.
    ///
    /// Every job is queued before any is polled. Missing paths are skipped;
    /// a document whose job fails gets an `Err` entry and does not stop the
    /// others.
    pub async fn extract_files<P: AsRef<Path>>(
        &self,
        paths: &[P],
        schema: &ExtractionSchema,
    ) -> Result<Vec<(PathBuf, Result<ExtractionResult, PipelineError>)>, PipelineError> {
        let key = self.key()?;
        let valid: Vec<PathBuf> = paths
            .iter()
            .map(|p| p.as_ref().to_path_buf())
            .filter(|p| {
                let ok = p.is_file();
                if !ok {
                    warn!("Skipping {}: file not found", p.display());
                }
                ok
            })
            .collect();
        if valid.is_empty() {
            return Err(PipelineError::NoInputFiles {
                detail: format!("none of the {} file(s) exist", paths.len()),
            });
        }

        let start = Instant::now();
        let agent_id = self.ensure_agent(schema).await?;

        let mut queued = Vec::with_capacity(valid.len());
        for path in valid {
            let job = self.queue(&agent_id, &path, key).await;
            queued.push((path, job));
        }

        let mut results = Vec::with_capacity(queued.len());
        for (path, job) in queued {
            let outcome = match job {
                Ok(job_id) => match self.collect(&job_id, key).await {
                    Ok(data) => self.finish(&path, schema, &data, start),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                warn!("LlamaExtract failed for {}: {}", path.display(), e);
            }
            results.push((path, outcome));
        }
        Ok(results)
    }

    fn key(&self) -> Result<&str, PipelineError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| PipelineError::MissingCredentials {
                provider: PROVIDER.into(),
                env_var: API_KEY_ENV.into(),
            })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
        key: &str,
    ) -> Result<T, PipelineError> {
        let resp = request
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| api_error(context, e))?;
        check(resp, context)
            .await?
            .json()
            .await
            .map_err(|e| api_error(&format!("{context} response"), e))
    }

    /// Upload `path` and queue a job for it. Returns the job id.
    async fn queue(&self, agent_id: &str, path: &Path, key: &str) -> Result<String, PipelineError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".into());
        let form = reqwest::multipart::Form::new().part(
            "upload_file",
            reqwest::multipart::Part::bytes(bytes).file_name(file_name),
        );
        let file: UploadedFile = self
            .send(
                self.client
                    .post(format!("{}/api/v1/files", self.base_url))
                    .multipart(form),
                "upload",
                key,
            )
            .await?;

        let job: Job = self
            .send(
                self.client
                    .post(format!("{}/api/v1/extraction/jobs", self.base_url))
                    .json(&json!({"extraction_agent_id": agent_id, "file_id": file.id})),
                "job creation",
                key,
            )
            .await?;
        info!("LlamaExtract job {} for {}", job.id, path.display());
        Ok(job.id)
    }

    /// Poll `job_id` until it settles, then fetch its data.
    async fn collect(&self, job_id: &str, key: &str) -> Result<Value, PipelineError> {
        let started = Instant::now();
        loop {
            let job: JobStatus = self
                .send(
                    self.client
                        .get(format!("{}/api/v1/extraction/jobs/{job_id}", self.base_url)),
                    "job status",
                    key,
                )
                .await?;

            match job.status.to_ascii_uppercase().as_str() {
                "SUCCESS" | "PARTIAL_SUCCESS" => break,
                "ERROR" | "CANCELED" | "CANCELLED" => {
                    return Err(api_error(
                        "job",
                        format!("{job_id} finished with status {}", job.status),
                    ))
                }
                other => debug!("LlamaExtract job {} is {}", job_id, other),
            }

            if started.elapsed() >= self.max_wait {
                return Err(api_error(
                    "job",
                    format!("{job_id} still running after {}s", self.max_wait.as_secs()),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let result: JobResult = self
            .send(
                self.client.get(format!(
                    "{}/api/v1/extraction/jobs/{job_id}/result",
                    self.base_url
                )),
                "job result",
                key,
            )
            .await?;
        Ok(result.data)
    }

    fn finish(
        &self,
        path: &Path,
        schema: &ExtractionSchema,
        data: &Value,
        start: Instant,
    ) -> Result<ExtractionResult, PipelineError> {
        let malformed = |detail: String| PipelineError::MalformedResponse {
            attempts: 1,
            detail,
        };
        let Value::Object(obj) = data else {
            return Err(malformed(format!("job data is not a JSON object: {data}")));
        };
        let fields = validate_object(obj, schema, false).map_err(malformed)?;

        let mut result = ExtractionResult {
            schema_name: schema.name().to_string(),
            fields,
            evidence_mode: false,
            sources: vec![path.to_path_buf()],
            json_path: None,
            attempts: 1,
            prompt_tokens: 0,
            completion_tokens: 0,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        if self.save_json {
            let json_path = json_path_for(path);
            save_result(&result, &json_path)?;
            result.json_path = Some(json_path);
        }
        Ok(result)
    }
}

fn api_error(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::LlmApiError {
        provider: PROVIDER.into(),
        message: format!("{context}: {e}"),
    }
}

async fn check(resp: reqwest::Response, context: &str) -> Result<reqwest::Response, PipelineError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = format!("{context} returned HTTP {status}: {}", body.trim());
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PipelineError::AuthError {
            provider: PROVIDER.into(),
            detail: message,
        },
        StatusCode::TOO_MANY_REQUESTS => PipelineError::RateLimitExceeded {
            provider: PROVIDER.into(),
            message,
        },
        _ => PipelineError::LlmApiError {
            provider: PROVIDER.into(),
            message,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, FieldSpec};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, key: Option<&str>) -> LlamaExtractClient {
        let mut c = LlamaExtractClient::from_options(&LlamaExtractOptions {
            base_url: Some(server.uri()),
            api_key: key.map(str::to_string),
            poll_interval_ms: 10,
            max_wait_secs: 5,
            ..LlamaExtractOptions::default()
        });
        c.api_key = key.map(str::to_string);
        c
    }

    fn schema() -> ExtractionSchema {
        ExtractionSchema::new(
            "Grant",
            vec![
                FieldSpec::string("project_id", "Applicant ID"),
                FieldSpec::new("budget", "Total budget", FieldKind::Float),
            ],
        )
        .unwrap()
    }

    fn write_doc(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, b"%PDF-1.7\nbody").unwrap();
        p
    }

    async fn mount_job_flow(server: &MockServer, data: Value) {
        Mock::given(method("POST"))
            .and(path("/api/v1/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-1"})))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/extraction/jobs"))
            .and(body_partial_json(json!({"extraction_agent_id": "agent-1", "file_id": "file-1"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "job-1", "status": "PENDING"})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/extraction/jobs/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "SUCCESS"})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/extraction/jobs/job-1/result"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": data})))
            .mount(server)
            .await;
    }

    #[test]
    fn agent_name_from_schema() {
        assert_eq!(default_agent_name(&schema()), "grant-extractor");
        let s = ExtractionSchema::new("Annual Report!", vec![FieldSpec::string("t", "Title")]).unwrap();
        assert_eq!(default_agent_name(&s), "annual-report-extractor");
    }

    #[tokio::test]
    async fn existing_agent_is_reused_and_result_saved() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/extraction/extraction-agents/by-name/grant-extractor"))
            .and(header("authorization", "Bearer llx-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "agent-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/extraction/extraction-agents"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        mount_job_flow(&server, json!({"project_id": "ORD1", "budget": "1,200", "extra": true})).await;

        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), "grant.pdf");
        let result = client(&server, Some("llx-test"))
            .extract_file(&doc, &schema())
            .await
            .unwrap();

        assert!(!result.evidence_mode);
        assert_eq!(result.sources, vec![doc.clone()]);
        assert_eq!(result.to_json(), json!({"project_id": "ORD1", "budget": 1200.0}));

        let json_path = dir.path().join("grant.json");
        assert_eq!(result.json_path.as_deref(), Some(json_path.as_path()));
        let saved: Value = serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(saved, json!({"project_id": "ORD1", "budget": 1200.0}));
    }

    #[tokio::test]
    async fn unknown_agent_is_created_from_schema() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/extraction/extraction-agents/by-name/grant-extractor"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/extraction/extraction-agents"))
            .and(body_partial_json(json!({
                "name": "grant-extractor",
                "data_schema": {"type": "object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "agent-new"})))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server, Some("k")).ensure_agent(&schema()).await.unwrap();
        assert_eq!(id, "agent-new");
    }

    #[tokio::test]
    async fn missing_key_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), "grant.pdf");
        let err = client(&server, None)
            .extract_file(&doc, &schema())
            .await
            .unwrap_err();
        assert!(
            matches!(err, PipelineError::MissingCredentials { ref env_var, .. } if env_var == API_KEY_ENV),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn batch_queues_every_file_and_skips_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/extraction/extraction-agents/by-name/grant-extractor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "agent-1"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_job_flow(&server, json!({"project_id": "ORD9"})).await;

        let dir = tempfile::tempdir().unwrap();
        let a = write_doc(dir.path(), "a.pdf");
        let b = write_doc(dir.path(), "b.pdf");
        let missing = dir.path().join("gone.pdf");

        let results = client(&server, Some("k"))
            .extract_files(&[&a, &missing, &b], &schema())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, a);
        assert_eq!(results[1].0, b);
        for (_, r) in &results {
            assert_eq!(r.as_ref().unwrap().to_json(), json!({"project_id": "ORD9"}));
        }
        assert!(dir.path().join("a.json").is_file());
        assert!(dir.path().join("b.json").is_file());
    }

    #[tokio::test]
    async fn failed_job_is_reported_per_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/extraction/extraction-agents/by-name/grant-extractor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "agent-1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/extraction/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "bad"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/extraction/jobs/bad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ERROR"})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), "grant.pdf");
        let results = client(&server, Some("k"))
            .extract_files(&[&doc], &schema())
            .await
            .unwrap();
        let err = results[0].1.as_ref().unwrap_err();
        assert!(err.to_string().contains("ERROR"), "got {err}");
        assert!(!dir.path().join("grant.json").exists());
    }

    #[tokio::test]
    async fn rejected_key_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let err = client(&server, Some("nope"))
            .ensure_agent(&schema())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AuthError { .. }), "got {err:?}");
        assert!(err.to_string().contains("invalid api key"), "got {err}");
    }

    #[tokio::test]
    async fn wrongly_typed_data_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/extraction/extraction-agents/by-name/grant-extractor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "agent-1"})))
            .mount(&server)
            .await;
        mount_job_flow(&server, json!({"budget": "a lot"})).await;

        let dir = tempfile::tempdir().unwrap();
        let doc = write_doc(dir.path(), "grant.pdf");
        let err = client(&server, Some("k"))
            .extract_file(&doc, &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedResponse { attempts: 1, .. }), "got {err:?}");
    }
}
