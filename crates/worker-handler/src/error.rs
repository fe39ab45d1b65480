use std::path::PathBuf;

use serde_json::{Map, Value, json};
use thiserror::Error;

/// A job failure. Each variant renders as the `error` string returned to the
/// caller; [`HandlerError::to_output`] adds the diagnostic fields.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("image_url is required")]
    MissingImageUrl,

    #[error("env_error: Missing required env vars: {}", .missing.join(", "))]
    Env { missing: Vec<&'static str> },

    #[error("image_download_failed: {0}")]
    ImageDownload(String),

    #[error("workflow_load_failed: {reason}")]
    WorkflowLoad { reason: String, workflow_path: PathBuf },

    /// The reason already carries the `workflow_patch_failed:` prefix.
    #[error("{reason}")]
    WorkflowPatch {
        reason: String,
        workflow_path: PathBuf,
        keys_preview: Vec<String>,
    },

    #[error("comfy_submit_failed: {reason}")]
    ComfySubmit {
        reason: String,
        prompt_node: String,
        image_node: String,
    },

    #[error("comfy_wait_failed: {reason}")]
    ComfyWait { reason: String, prompt_id: String },

    #[error("no_video_in_history_outputs")]
    NoVideo { prompt_id: String, history: Value },

    #[error("video_file_not_found_on_disk")]
    VideoNotFound {
        prompt_id: String,
        reported_filenames: Vec<String>,
        output_dir: PathBuf,
    },

    #[error("r2_upload_failed: {reason}")]
    Upload { reason: String, prompt_id: String },
}

impl HandlerError {
    /// Diagnostic fields reported alongside the error message.
    pub fn details(&self) -> Map<String, Value> {
        let value = match self {
            Self::MissingImageUrl | Self::Env { .. } | Self::ImageDownload(_) => json!({}),
            Self::WorkflowLoad { workflow_path, .. } => json!({
                "workflow_path": workflow_path.display().to_string(),
            }),
            Self::WorkflowPatch {
                workflow_path,
                keys_preview,
                ..
            } => json!({
                "workflow_path": workflow_path.display().to_string(),
                "workflow_keys_preview": keys_preview,
            }),
            Self::ComfySubmit {
                prompt_node,
                image_node,
                ..
            } => json!({ "prompt_node": prompt_node, "image_node": image_node }),
            Self::ComfyWait { prompt_id, .. } | Self::Upload { prompt_id, .. } => {
                json!({ "prompt_id": prompt_id })
            }
            Self::NoVideo { prompt_id, history } => {
                json!({ "prompt_id": prompt_id, "history": history })
            }
            Self::VideoNotFound {
                prompt_id,
                reported_filenames,
                output_dir,
            } => json!({
                "prompt_id": prompt_id,
                "reported_filenames": reported_filenames,
                "output_dir": output_dir.display().to_string(),
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Flat result object: `{"error": <message>, ...details}`.
    pub fn to_output(&self) -> Value {
        let mut output = Map::new();
        output.insert("error".to_string(), Value::String(self.to_string()));
        output.extend(self.details());
        Value::Object(output)
    }
}
