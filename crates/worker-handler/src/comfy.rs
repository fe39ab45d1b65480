//! Minimal ComfyUI HTTP client: queue a prompt, poll its history, find the
//! rendered videos on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::workflow::Workflow;

#[derive(Debug, Error)]
pub enum ComfyError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("ComfyUI job timed out waiting for history")]
    Timeout,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    prompt_id: String,
}

/// A video (or animated image) reported by a history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOutput {
    pub filename: String,
    pub subfolder: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ComfyClient {
    http: reqwest::Client,
    base_url: String,
}

impl ComfyClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ComfyError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Queue a workflow. Returns the prompt id ComfyUI assigned.
    pub async fn submit(&self, workflow: &Workflow) -> Result<String, ComfyError> {
        let response = self
            .http
            .post(format!("{}/prompt", self.base_url))
            .json(&json!({ "prompt": workflow }))
            .send()
            .await?
            .error_for_status()?;
        let queued: QueueResponse = response.json().await?;
        Ok(queued.prompt_id)
    }

    /// One history lookup. `None` while the prompt is still queued or running.
    pub async fn history(&self, prompt_id: &str) -> Result<Option<Value>, ComfyError> {
        let mut body: Value = self
            .http
            .get(format!("{}/history/{prompt_id}", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.as_object_mut().and_then(|entries| entries.remove(prompt_id)))
    }

    /// Poll history every `interval` until the prompt shows up or `timeout`
    /// has elapsed. Request errors end the wait immediately.
    pub async fn wait_for_history(
        &self,
        prompt_id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Value, ComfyError> {
        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            if let Some(entry) = self.history(prompt_id).await? {
                debug!(prompt_id, polls, "history entry available");
                return Ok(entry);
            }
            if started.elapsed() > timeout {
                return Err(ComfyError::Timeout);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Videos listed under any node's `videos` or `gifs` outputs, in order.
pub fn video_outputs(history: &Value) -> Vec<VideoOutput> {
    let Some(outputs) = history.get("outputs").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for output in outputs.values() {
        for key in ["videos", "gifs"] {
            let Some(items) = output.get(key).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let Some(filename) = item
                    .get("filename")
                    .and_then(Value::as_str)
                    .filter(|f| !f.is_empty())
                else {
                    continue;
                };
                let subfolder = item
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                found.push(VideoOutput {
                    filename: filename.to_string(),
                    subfolder,
                });
            }
        }
    }
    found
}

/// Locate a reported output file on disk.
///
/// Candidates, first existing wins: the filename itself when absolute;
/// `<output_dir>/<filename>`; `<output_dir>/<subfolder>/<filename>`;
/// `<output_dir>/video/<filename>`; `<output_dir>/videos/<filename>`.
pub fn resolve_output_path(output_dir: &Path, video: &VideoOutput) -> Option<PathBuf> {
    let filename = Path::new(&video.filename);
    let mut candidates = Vec::with_capacity(5);
    if filename.is_absolute() {
        candidates.push(filename.to_path_buf());
    }
    candidates.push(output_dir.join(filename));
    if let Some(subfolder) = &video.subfolder {
        candidates.push(output_dir.join(subfolder).join(filename));
    }
    candidates.push(output_dir.join("video").join(filename));
    candidates.push(output_dir.join("videos").join(filename));

    candidates.into_iter().find(|p| p.exists())
}
