//! worker.toml configuration parser.
//!
//! Every field has a default matching the production container, so an
//! absent or empty file yields a working launcher: ComfyUI from
//! `/comfyui/main.py` on `127.0.0.1:8188`, readiness via `/system_stats`,
//! and this binary's `handler` subcommand in the foreground.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::HumanDuration;

/// Errors raised while loading a config or manifest file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub server: ServerConfig,
    pub readiness: ReadinessConfig,
    pub handler: HandlerProcessConfig,
    pub shutdown: ShutdownConfig,
}

/// The GUI server process started in the background.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Listen address handed to the server. Loopback keeps it private to
    /// the container.
    pub listen: String,
    pub port: u16,
    pub env: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["-u".to_string(), "/comfyui/main.py".to_string()],
            working_dir: Some(PathBuf::from("/comfyui")),
            listen: "127.0.0.1".to_string(),
            port: 8188,
            env: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// `host:port` the launcher probes.
    pub fn address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }

    /// Full argument list: configured args followed by the listen flags.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--listen".to_string());
        args.push(self.listen.clone());
        args.push("--port".to_string());
        args.push(self.port.to_string());
        args
    }
}

/// Bounded readiness polling against the server's status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub endpoint: String,
    /// Unconditional wait before the first probe.
    pub initial_delay: HumanDuration,
    pub interval: HumanDuration,
    pub max_interval: HumanDuration,
    pub probe_timeout: HumanDuration,
    /// Give up (and exit non-zero) after this long without a 2xx.
    pub max_wait: HumanDuration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            endpoint: "/system_stats".to_string(),
            initial_delay: HumanDuration::from_secs(0),
            interval: HumanDuration::from_millis(500),
            max_interval: HumanDuration::from_secs(5),
            probe_timeout: HumanDuration::from_secs(2),
            max_wait: HumanDuration::from_secs(300),
        }
    }
}

/// The foreground handler process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerProcessConfig {
    /// Program to run; `None` re-executes the current binary.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for HandlerProcessConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["handler".to_string()],
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time the server gets between SIGTERM and SIGKILL.
    pub grace_period: HumanDuration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: HumanDuration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: WorkerConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.program.trim().is_empty() {
            return Err(ConfigError::Invalid("server.program is empty".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".to_string()));
        }
        if !self.readiness.endpoint.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "readiness.endpoint must start with '/': {:?}",
                self.readiness.endpoint
            )));
        }
        if self.readiness.interval.as_duration().is_zero() {
            return Err(ConfigError::Invalid("readiness.interval must be non-zero".to_string()));
        }
        if self.readiness.max_interval < self.readiness.interval {
            return Err(ConfigError::Invalid(
                "readiness.max_interval is shorter than readiness.interval".to_string(),
            ));
        }
        if let Some(program) = &self.handler.program
            && program.trim().is_empty()
        {
            return Err(ConfigError::Invalid("handler.program is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_bind_loopback() {
        let config = WorkerConfig::default();
        assert_eq!(config.server.address(), "127.0.0.1:8188");
        assert_eq!(config.readiness.endpoint, "/system_stats");
        assert_eq!(config.handler.args, vec!["handler"]);
        assert!(config.handler.program.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_command_args_append_listen_flags() {
        let server = ServerConfig {
            args: vec!["main.py".to_string()],
            port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(
            server.command_args(),
            vec!["main.py", "--listen", "127.0.0.1", "--port", "9000"]
        );
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[server]
port = 8190

[readiness]
interval = "250ms"
max_wait = "2m"
"#;
        let config: WorkerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 8190);
        assert_eq!(config.server.program, "python");
        assert_eq!(config.readiness.interval.as_duration(), Duration::from_millis(250));
        assert_eq!(config.readiness.max_wait.as_duration(), Duration::from_secs(120));
        assert_eq!(config.readiness.probe_timeout.as_duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_empty_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "").unwrap();

        let config = WorkerConfig::from_file(&path).unwrap();
        assert_eq!(config.server.port, 8188);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = WorkerConfig::from_file(Path::new("/nonexistent/worker.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/worker.toml"));
    }

    #[test]
    fn test_validate_rejects_relative_endpoint() {
        let mut config = WorkerConfig::default();
        config.readiness.endpoint = "system_stats".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = WorkerConfig::default();
        config.readiness.interval = HumanDuration::from_secs(10);
        config.readiness.max_interval = HumanDuration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = WorkerConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("system_stats"));
        let back: WorkerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.readiness.interval, config.readiness.interval);
    }
}
