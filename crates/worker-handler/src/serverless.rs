//! Serverless job loop.
//!
//! Jobs are pulled from a [`JobSource`], run through the [`JobHandler`] one at
//! a time, and their results reported back to the same source. Job failures
//! are results, not errors: only a broken source ends the loop.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::JobHandler;
use crate::storage::ObjectStore;

const PING_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(1);
const IDLE_DELAY: Duration = Duration::from_millis(200);
const LOCAL_JOB_ID: &str = "local_test";

#[derive(Debug, Error)]
pub enum ServerlessError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid test input: {0}")]
    TestInput(#[source] serde_json::Error),

    #[error("malformed job payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job API request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub input: Value,
}

/// Source of jobs and sink for their results.
pub trait JobSource: Send {
    /// Next job to run. `None` ends the loop.
    fn next_job(&mut self) -> impl Future<Output = Result<Option<Job>, ServerlessError>> + Send;

    /// Report the result of `job`: the handler's flat output object.
    fn complete(
        &mut self,
        job: &Job,
        output: Value,
    ) -> impl Future<Output = Result<(), ServerlessError>> + Send;
}

impl<J: JobSource> JobSource for &mut J {
    fn next_job(&mut self) -> impl Future<Output = Result<Option<Job>, ServerlessError>> + Send {
        (**self).next_job()
    }

    fn complete(
        &mut self,
        job: &Job,
        output: Value,
    ) -> impl Future<Output = Result<(), ServerlessError>> + Send {
        (**self).complete(job, output)
    }
}

/// Run jobs until the source is exhausted.
pub async fn run_worker<S, J>(handler: &JobHandler<S>, mut source: J) -> Result<u64, ServerlessError>
where
    S: ObjectStore,
    J: JobSource,
{
    info!("starting serverless loop");
    let mut completed = 0u64;
    while let Some(job) = source.next_job().await? {
        info!(job_id = %job.id, "job received");
        let output = handler.handle_value(&job.input).await;
        let failed = output.get("error").is_some();
        source.complete(&job, output).await?;
        completed += 1;
        info!(job_id = %job.id, failed, "job finished");
    }
    Ok(completed)
}

// ── Platform webhooks ──────────────────────────────────────────────

/// Webhook endpoints and credentials handed to the worker by the platform.
#[derive(Debug, Clone)]
pub struct RunpodEndpoints {
    pub worker_id: String,
    pub api_key: String,
    pub get_job: String,
    pub post_output: String,
    pub ping: Option<String>,
}

impl RunpodEndpoints {
    pub fn from_env() -> Result<Self, ServerlessError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerlessError> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let require = |key: &'static str| get(key).ok_or(ServerlessError::MissingEnv(key));
        Ok(Self {
            worker_id: require("RUNPOD_POD_ID")?,
            api_key: require("RUNPOD_AI_API_KEY")?,
            get_job: require("RUNPOD_WEBHOOK_GET_JOB")?,
            post_output: require("RUNPOD_WEBHOOK_POST_OUTPUT")?,
            ping: get("RUNPOD_WEBHOOK_PING"),
        })
    }

    fn job_url(&self) -> String {
        self.get_job.replace("$ID", &self.worker_id)
    }

    fn result_url(&self, job_id: &str) -> String {
        self.post_output.replace("$ID", job_id)
    }

    fn ping_url(&self) -> Option<String> {
        self.ping.as_ref().map(|url| url.replace("$ID", &self.worker_id))
    }
}

/// Platform body for a finished job. Failures move the `error` message to
/// the top level and keep the remaining fields as `output`.
pub fn result_body(output: Value) -> Value {
    let mut fields = match output {
        Value::Object(fields) => fields,
        other => return json!({ "output": other }),
    };
    match fields.remove("error") {
        Some(error) => json!({ "error": error, "output": Value::Object(fields) }),
        None => json!({ "output": Value::Object(fields) }),
    }
}

/// Long-polls the platform for jobs.
pub struct RunpodJobSource {
    http: reqwest::Client,
    endpoints: RunpodEndpoints,
    in_progress: bool,
    heartbeat: Option<JoinHandle<()>>,
}

impl RunpodJobSource {
    pub fn new(endpoints: RunpodEndpoints) -> Result<Self, ServerlessError> {
        let http = reqwest::Client::builder().build()?;
        let heartbeat = endpoints
            .ping_url()
            .map(|url| tokio::spawn(heartbeat(http.clone(), url, endpoints.api_key.clone())));
        Ok(Self {
            http,
            endpoints,
            in_progress: false,
            heartbeat,
        })
    }

    async fn fetch(&self) -> Result<Option<Job>, ServerlessError> {
        let response = self
            .http
            .get(self.endpoints.job_url())
            .header(reqwest::header::AUTHORIZATION, &self.endpoints.api_key)
            .query(&[("job_in_progress", if self.in_progress { "1" } else { "0" })])
            .send()
            .await?
            .error_for_status()?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&body).map_err(ServerlessError::Payload)?))
    }
}

impl Drop for RunpodJobSource {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

impl JobSource for RunpodJobSource {
    async fn next_job(&mut self) -> Result<Option<Job>, ServerlessError> {
        self.in_progress = false;
        loop {
            match self.fetch().await {
                Ok(Some(job)) => {
                    self.in_progress = true;
                    return Ok(Some(job));
                }
                Ok(None) => {
                    debug!("no job available");
                    tokio::time::sleep(IDLE_DELAY).await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to fetch job, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn complete(&mut self, job: &Job, output: Value) -> Result<(), ServerlessError> {
        let result = self
            .http
            .post(self.endpoints.result_url(&job.id))
            .header(reqwest::header::AUTHORIZATION, &self.endpoints.api_key)
            .query(&[("isStream", "false")])
            .json(&result_body(output))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = result {
            warn!(job_id = %job.id, error = %e, "failed to report job result");
        }
        Ok(())
    }
}

async fn heartbeat(http: reqwest::Client, url: String, api_key: String) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    loop {
        ticker.tick().await;
        let sent = http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, &api_key)
            .timeout(PING_INTERVAL)
            .send()
            .await;
        if let Err(e) = sent {
            debug!(error = %e, "heartbeat failed");
        }
    }
}

// ── Local testing ──────────────────────────────────────────────────

/// A single job from a JSON document; its result is printed to stdout.
pub struct LocalJobSource {
    job: Option<Job>,
    results: Vec<Value>,
    print: bool,
}

impl LocalJobSource {
    /// Parse `{"input": {...}}`. A document without `input` is taken as the
    /// input itself.
    pub fn from_json(text: &str) -> Result<Self, ServerlessError> {
        let mut doc: Map<String, Value> =
            serde_json::from_str(text).map_err(ServerlessError::TestInput)?;
        let input = doc.remove("input").unwrap_or(Value::Object(doc));
        Ok(Self {
            job: Some(Job {
                id: LOCAL_JOB_ID.to_string(),
                input,
            }),
            results: Vec::new(),
            print: true,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ServerlessError> {
        let text = std::fs::read_to_string(path).map_err(|source| ServerlessError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Keep results in memory instead of printing them.
    pub fn quiet(mut self) -> Self {
        self.print = false;
        self
    }

    pub fn results(&self) -> &[Value] {
        &self.results
    }
}

impl JobSource for LocalJobSource {
    async fn next_job(&mut self) -> Result<Option<Job>, ServerlessError> {
        Ok(self.job.take())
    }

    async fn complete(&mut self, job: &Job, output: Value) -> Result<(), ServerlessError> {
        if self.print {
            let text = serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string());
            println!("{text}");
        }
        debug!(job_id = %job.id, "local job complete");
        self.results.push(output);
        Ok(())
    }
}
