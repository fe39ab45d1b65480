//! The per-job pipeline: image in, video URL out.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::comfy::{self, ComfyClient, ComfyError};
use crate::error::HandlerError;
use crate::settings::HandlerSettings;
use crate::storage::{self, ObjectStore, R2Store, VIDEO_CONTENT_TYPE};
use crate::workflow;

/// Caller-supplied job input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobInput {
    pub prompt: String,
    pub image_url: Option<String>,
}

impl JobInput {
    /// Lenient extraction: a missing or non-object input counts as empty.
    ///
    /// Empty-ish values (`null`, `false`, `0`, `""`, `[]`, `{}`) count as
    /// absent. Other non-string values are kept as their JSON text, so a
    /// bogus `image_url` fails at download rather than as missing.
    pub fn from_value(input: &Value) -> Self {
        let field = |key: &str| input.get(key).filter(|v| !is_empty_value(v)).map(value_text);
        Self {
            prompt: field("prompt").unwrap_or_default(),
            image_url: field("image_url"),
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutput {
    pub prompt_id: String,
    pub video_url: String,
    pub debug: JobDebug,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDebug {
    pub prompt_node: String,
    pub image_node: String,
    pub saved_filename: String,
}

/// Runs jobs against a ComfyUI server, uploading results to `S`.
///
/// Without storage credentials the worker still starts; the store slot then
/// holds the missing variable names and every job fails with `env_error`.
pub struct JobHandler<S> {
    settings: HandlerSettings,
    comfy: ComfyClient,
    http: reqwest::Client,
    store: Result<S, Vec<&'static str>>,
}

impl JobHandler<R2Store> {
    /// Build a handler whose store is connected from `settings.storage`.
    pub async fn connect(settings: HandlerSettings) -> Result<Self, ComfyError> {
        let store = match settings.storage.require() {
            Ok(r2) => Ok(R2Store::connect(r2).await),
            Err(missing) => {
                warn!(?missing, "object storage not configured, jobs will fail");
                Err(missing)
            }
        };
        Self::build(settings, store)
    }
}

impl<S: ObjectStore> JobHandler<S> {
    pub fn new(settings: HandlerSettings, store: S) -> Result<Self, ComfyError> {
        Self::build(settings, Ok(store))
    }

    fn build(
        settings: HandlerSettings,
        store: Result<S, Vec<&'static str>>,
    ) -> Result<Self, ComfyError> {
        let comfy = ComfyClient::new(&settings.comfy_url, settings.request_timeout)?;
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            settings,
            comfy,
            http,
            store,
        })
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    /// Run one job and render the result the way callers receive it: the
    /// success object, or `{"error": ..., ...details}`.
    pub async fn handle_value(&self, input: &Value) -> Value {
        match self.handle(&JobInput::from_value(input)).await {
            Ok(output) => serde_json::to_value(&output).unwrap_or(Value::Null),
            Err(e) => {
                warn!(error = %e, "job failed");
                e.to_output()
            }
        }
    }

    pub async fn handle(&self, input: &JobInput) -> Result<JobOutput, HandlerError> {
        let settings = &self.settings;

        let image_url = input
            .image_url
            .as_deref()
            .ok_or(HandlerError::MissingImageUrl)?;

        settings
            .storage
            .require()
            .map_err(|missing| HandlerError::Env { missing })?;
        let store = self.store.as_ref().map_err(|missing| HandlerError::Env {
            missing: missing.clone(),
        })?;

        // ── Input image ────────────────────────────────────────────

        let image_name = format!("{}.png", Uuid::new_v4().simple());
        self.download_image(image_url, &settings.input_dir.join(&image_name))
            .await
            .map_err(HandlerError::ImageDownload)?;
        info!(%image_url, %image_name, "input image saved");

        // ── Workflow ───────────────────────────────────────────────

        let workflow_path = settings.workflow_path.clone();
        let mut wf = workflow::load(&workflow_path).map_err(|e| HandlerError::WorkflowLoad {
            reason: e.to_string(),
            workflow_path: workflow_path.clone(),
        })?;

        let patched = workflow::set_prompt(&mut wf, &input.prompt).and_then(|prompt_node| {
            workflow::set_image_filename(&mut wf, &image_name).map(|image_node| (prompt_node, image_node))
        });
        let (prompt_node, image_node) = patched.map_err(|e| HandlerError::WorkflowPatch {
            reason: e.to_string(),
            workflow_path: workflow_path.clone(),
            keys_preview: workflow::keys_preview(&wf),
        })?;

        // ── ComfyUI ────────────────────────────────────────────────

        let prompt_id = self
            .comfy
            .submit(&wf)
            .await
            .map_err(|e| HandlerError::ComfySubmit {
                reason: e.to_string(),
                prompt_node: prompt_node.clone(),
                image_node: image_node.clone(),
            })?;
        info!(%prompt_id, %prompt_node, %image_node, "workflow queued");

        let history = self
            .comfy
            .wait_for_history(&prompt_id, settings.poll_interval, settings.history_timeout)
            .await
            .map_err(|e| HandlerError::ComfyWait {
                reason: e.to_string(),
                prompt_id: prompt_id.clone(),
            })?;

        let videos = comfy::video_outputs(&history);
        let Some(video) = videos.last() else {
            return Err(HandlerError::NoVideo { prompt_id, history });
        };
        let Some(local_video) = comfy::resolve_output_path(&settings.output_dir, video) else {
            return Err(HandlerError::VideoNotFound {
                prompt_id,
                reported_filenames: videos.iter().map(|v| v.filename.clone()).collect(),
                output_dir: settings.output_dir.clone(),
            });
        };
        info!(%prompt_id, path = %local_video.display(), "video rendered");

        // ── Upload ─────────────────────────────────────────────────

        let video_url = store
            .upload(&local_video, &storage::video_key(), VIDEO_CONTENT_TYPE)
            .await
            .map_err(|e| HandlerError::Upload {
                reason: e.to_string(),
                prompt_id: prompt_id.clone(),
            })?;

        Ok(JobOutput {
            prompt_id,
            video_url,
            debug: JobDebug {
                prompt_node,
                image_node,
                saved_filename: video.filename.clone(),
            },
        })
    }

    async fn download_image(&self, url: &str, dest: &Path) -> Result<(), String> {
        let bytes = async {
            self.http
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await
        }
        .await
        .map_err(|e| e.to_string())?;

        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| format!("{}: {e}", dir.display()))?;
        }
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| format!("{}: {e}", dest.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_extraction_is_lenient() {
        assert_eq!(JobInput::from_value(&Value::Null), JobInput::default());
        assert_eq!(
            JobInput::from_value(&json!({"prompt": null, "image_url": ""})),
            JobInput::default()
        );
        for empty in [json!(false), json!(0), json!([]), json!({})] {
            assert_eq!(JobInput::from_value(&json!({"image_url": empty})).image_url, None);
        }
        assert_eq!(
            JobInput::from_value(&json!({"prompt": "a fox", "image_url": "https://x/y.png"})),
            JobInput {
                prompt: "a fox".to_string(),
                image_url: Some("https://x/y.png".to_string()),
            }
        );
    }

    #[test]
    fn non_string_values_are_kept_as_text() {
        assert_eq!(
            JobInput::from_value(&json!({"prompt": 5, "image_url": 42})),
            JobInput {
                prompt: "5".to_string(),
                image_url: Some("42".to_string()),
            }
        );
    }

    #[test]
    fn output_serializes_in_documented_shape() {
        let output = JobOutput {
            prompt_id: "p".to_string(),
            video_url: "https://pub/v.mp4".to_string(),
            debug: JobDebug {
                prompt_node: "134".to_string(),
                image_node: "148".to_string(),
                saved_filename: "wan_00001.mp4".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!({
                "prompt_id": "p",
                "video_url": "https://pub/v.mp4",
                "debug": {"prompt_node": "134", "image_node": "148", "saved_filename": "wan_00001.mp4"}
            })
        );
    }
}
