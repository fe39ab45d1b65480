//! Handler settings, read from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `COMFY_URL` | `http://127.0.0.1:8188` |
//! | `WORKFLOW_PATH` | `/comfyui/workflow.json` |
//! | `COMFY_INPUT_DIR` | `/comfyui/input` |
//! | `COMFY_OUTPUT_DIR` | `/comfyui/output` |
//! | `COMFY_HISTORY_TIMEOUT` | `3600s` |
//! | `COMFY_POLL_INTERVAL` | `1s` |
//! | `R2_ENDPOINT`, `R2_BUCKET`, `R2_ACCESS_KEY`, `R2_SECRET_KEY` | required per job |
//! | `R2_PUBLIC_BASE` | optional |

use std::path::PathBuf;
use std::time::Duration;

use worker_core::parse_duration;

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub comfy_url: String,
    pub workflow_path: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub request_timeout: Duration,
    pub history_timeout: Duration,
    pub poll_interval: Duration,
    pub storage: StorageSettings,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            comfy_url: "http://127.0.0.1:8188".to_string(),
            workflow_path: PathBuf::from("/comfyui/workflow.json"),
            input_dir: PathBuf::from("/comfyui/input"),
            output_dir: PathBuf::from("/comfyui/output"),
            request_timeout: Duration::from_secs(60),
            history_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
            storage: StorageSettings::default(),
        }
    }
}

/// Object storage (Cloudflare R2 / S3-compatible) settings. Every field is
/// optional at load time; [`StorageSettings::require`] enforces them when a
/// job actually needs to upload.
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Public base URL for returned links, e.g. `https://pub-xxxx.r2.dev`.
    pub public_base: Option<String>,
}

/// Complete storage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct R2Settings {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub public_base: Option<String>,
}

impl R2Settings {
    /// URL under which an uploaded key is returned to the caller.
    pub fn public_url(&self, key: &str) -> String {
        let base = self.public_base.as_deref().unwrap_or(&self.endpoint);
        format!("{}/{}/{}", base.trim_end_matches('/'), self.bucket, key)
    }
}

impl StorageSettings {
    /// All required fields, or the names of the missing variables.
    pub fn require(&self) -> Result<R2Settings, Vec<&'static str>> {
        let fields = [
            ("R2_ENDPOINT", &self.endpoint),
            ("R2_BUCKET", &self.bucket),
            ("R2_ACCESS_KEY", &self.access_key),
            ("R2_SECRET_KEY", &self.secret_key),
        ];
        let missing: Vec<_> = fields
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        let get = |v: &Option<String>| v.clone().unwrap_or_default();
        Ok(R2Settings {
            endpoint: get(&self.endpoint),
            bucket: get(&self.bucket),
            access_key: get(&self.access_key),
            secret_key: get(&self.secret_key),
            public_base: self.public_base.clone(),
        })
    }
}

impl HandlerSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. Empty values count
    /// as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let defaults = Self::default();
        let duration = |key: &str, default: Duration| {
            get(key).and_then(|v| parse_duration(&v)).unwrap_or(default)
        };

        Self {
            comfy_url: get("COMFY_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.comfy_url),
            workflow_path: get("WORKFLOW_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.workflow_path),
            input_dir: get("COMFY_INPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.input_dir),
            output_dir: get("COMFY_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            request_timeout: defaults.request_timeout,
            history_timeout: duration("COMFY_HISTORY_TIMEOUT", defaults.history_timeout),
            poll_interval: duration("COMFY_POLL_INTERVAL", defaults.poll_interval),
            storage: StorageSettings {
                endpoint: get("R2_ENDPOINT"),
                bucket: get("R2_BUCKET"),
                access_key: get("R2_ACCESS_KEY"),
                secret_key: get("R2_SECRET_KEY"),
                public_base: get("R2_PUBLIC_BASE"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = HandlerSettings::from_lookup(lookup(&[]));
        assert_eq!(settings.comfy_url, "http://127.0.0.1:8188");
        assert_eq!(settings.workflow_path, PathBuf::from("/comfyui/workflow.json"));
        assert_eq!(settings.history_timeout, Duration::from_secs(3600));
        assert_eq!(
            settings.storage.require().unwrap_err(),
            ["R2_ENDPOINT", "R2_BUCKET", "R2_ACCESS_KEY", "R2_SECRET_KEY"]
        );
    }

    #[test]
    fn test_overrides_and_empty_values() {
        let settings = HandlerSettings::from_lookup(lookup(&[
            ("COMFY_URL", "http://127.0.0.1:9000/"),
            ("COMFY_OUTPUT_DIR", "/tmp/out"),
            ("COMFY_POLL_INTERVAL", "250ms"),
            ("R2_ENDPOINT", "https://acct.r2.cloudflarestorage.com"),
            ("R2_BUCKET", "videos"),
            ("R2_ACCESS_KEY", ""),
            ("R2_SECRET_KEY", "secret"),
        ]));
        assert_eq!(settings.comfy_url, "http://127.0.0.1:9000");
        assert_eq!(settings.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.storage.require().unwrap_err(), ["R2_ACCESS_KEY"]);
    }

    #[test]
    fn test_public_url_prefers_public_base() {
        let mut r2 = R2Settings {
            endpoint: "https://acct.r2.cloudflarestorage.com/".to_string(),
            bucket: "media".to_string(),
            access_key: "a".to_string(),
            secret_key: "s".to_string(),
            public_base: None,
        };
        assert_eq!(
            r2.public_url("videos/abc.mp4"),
            "https://acct.r2.cloudflarestorage.com/media/videos/abc.mp4"
        );

        r2.public_base = Some("https://pub-1234.r2.dev/".to_string());
        assert_eq!(r2.public_url("videos/abc.mp4"), "https://pub-1234.r2.dev/media/videos/abc.mp4");
    }
}
