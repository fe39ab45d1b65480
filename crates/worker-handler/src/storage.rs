//! Object storage for finished videos.

use std::future::Future;
use std::path::Path;

use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Region, SharedCredentialsProvider};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::settings::R2Settings;

pub const VIDEO_CONTENT_TYPE: &str = "video/mp4";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("{0}")]
    Upload(String),
}

/// Fresh object key for an uploaded video: `videos/<32 hex chars>.mp4`.
pub fn video_key() -> String {
    format!("videos/{}.mp4", Uuid::new_v4().simple())
}

/// Destination for finished outputs.
pub trait ObjectStore: Send + Sync {
    /// Upload `local` under `key`. Returns the URL callers should use to
    /// fetch it.
    fn upload(
        &self,
        local: &Path,
        key: &str,
        content_type: &str,
    ) -> impl Future<Output = Result<String, StorageError>> + Send;
}

/// Cloudflare R2 (or any S3-compatible endpoint) via the AWS SDK.
#[derive(Debug, Clone)]
pub struct R2Store {
    client: Client,
    settings: R2Settings,
}

impl R2Store {
    pub async fn connect(settings: R2Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "comfy-worker",
        );

        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new("auto"))
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .endpoint_url(&settings.endpoint)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();

        debug!(endpoint = %settings.endpoint, bucket = %settings.bucket, "R2 client created");
        Self {
            client: Client::from_conf(s3_config),
            settings,
        }
    }
}

impl ObjectStore for R2Store {
    async fn upload(&self, local: &Path, key: &str, content_type: &str) -> Result<String, StorageError> {
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| StorageError::Read {
                path: local.display().to_string(),
                reason: e.to_string(),
            })?;

        self.client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Upload(DisplayErrorContext(&e).to_string()))?;

        info!(bucket = %self.settings.bucket, key, "uploaded");
        Ok(self.settings.public_url(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_keys_are_unique_hex_names() {
        let a = video_key();
        let b = video_key();
        assert_ne!(a, b);

        let name = a.strip_prefix("videos/").unwrap().strip_suffix(".mp4").unwrap();
        assert_eq!(name.len(), 32);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
