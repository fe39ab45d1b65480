//! worker provision — build-time installation of the GUI framework's
//! dependencies into the container image.
//!
//! Steps run in a fixed order and the first failure aborts the build:
//!
//! 1. OS packages (`apt-get update`, `apt-get install ...`)
//! 2. Plugins, one installer invocation each (`comfy node install --exit-on-fail name@version`)
//! 3. Model weights, streamed to `<root>/<relative_path>/<filename>`
//! 4. Placed files (workflow definition, scripts) with their modes
//!
//! There is no retry and no partial-success handling: a build either
//! completes every step or fails.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use worker_core::{FileEntry, Manifest, ManifestError, ModelEntry, PluginEntry};

pub mod download;
pub mod files;
pub mod runner;
pub mod verify;

pub use download::DownloadedModel;
pub use runner::{CommandRunner, CommandSpec, SystemRunner};
pub use verify::{VerifyReport, verify};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}` failed (exit code: {code})")]
    CommandFailed { command: String, code: i32 },

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("step `{step}` failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<ProvisionError>,
    },
}

/// One unit of build work.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    SystemUpdate(CommandSpec),
    SystemInstall {
        packages: Vec<String>,
        command: CommandSpec,
    },
    Plugin {
        entry: PluginEntry,
        command: CommandSpec,
    },
    Model {
        entry: ModelEntry,
        destination: PathBuf,
    },
    File {
        entry: FileEntry,
        source: PathBuf,
    },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::SystemUpdate(cmd) => write!(f, "system update: {cmd}"),
            Step::SystemInstall { command, .. } => write!(f, "system install: {command}"),
            Step::Plugin { entry, command } => write!(f, "plugin {}: {command}", entry.spec()),
            Step::Model { entry, destination } => {
                write!(f, "model {} -> {}", entry.url, destination.display())
            }
            Step::File { entry, source } => write!(
                f,
                "file {} -> {}{}",
                source.display(),
                entry.destination.display(),
                entry
                    .mode
                    .as_deref()
                    .map(|m| format!(" (mode {m})"))
                    .unwrap_or_default()
            ),
        }
    }
}

/// Render the manifest into the ordered list of steps `run` executes.
pub fn plan(manifest: &Manifest) -> Vec<Step> {
    let root = &manifest.framework.root;
    let mut steps = Vec::new();

    if !manifest.system.packages.is_empty() {
        if let Some(update) = CommandSpec::from_argv(&manifest.system.update) {
            steps.push(Step::SystemUpdate(update));
        }
        if let Some(mut install) = CommandSpec::from_argv(&manifest.system.install) {
            install.args.extend(manifest.system.packages.iter().cloned());
            steps.push(Step::SystemInstall {
                packages: manifest.system.packages.clone(),
                command: install,
            });
        }
    }

    for plugin in &manifest.plugins {
        let args = manifest
            .installer
            .args
            .iter()
            .map(|arg| {
                arg.replace("{name}", &plugin.name)
                    .replace("{version}", &plugin.version)
            })
            .collect();
        steps.push(Step::Plugin {
            entry: plugin.clone(),
            command: CommandSpec::new(manifest.installer.program.clone(), args).in_dir(root),
        });
    }

    for model in &manifest.models {
        steps.push(Step::Model {
            entry: model.clone(),
            destination: model.destination(root),
        });
    }

    for file in &manifest.files {
        steps.push(Step::File {
            entry: file.clone(),
            source: manifest.source_path(file),
        });
    }

    steps
}

/// What a successful build installed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    pub packages: Vec<String>,
    pub plugins: Vec<String>,
    pub models: Vec<DownloadedModel>,
    pub files: Vec<PathBuf>,
}

impl ProvisionReport {
    pub fn total_model_bytes(&self) -> u64 {
        self.models.iter().map(|m| m.size_bytes).sum()
    }
}

/// Executes a manifest's plan.
pub struct Provisioner<R> {
    runner: R,
    http: reqwest::Client,
}

impl<R: CommandRunner> Provisioner<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            http: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured HTTP client for model downloads.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Validate the manifest, then run every step in order. Stops at the
    /// first failing step.
    pub async fn run(&self, manifest: &Manifest) -> Result<ProvisionReport, ProvisionError> {
        manifest.validate()?;

        let steps = plan(manifest);
        let total = steps.len();
        let mut report = ProvisionReport::default();

        for (i, step) in steps.into_iter().enumerate() {
            info!("[{}/{}] {}", i + 1, total, step);
            self.run_step(&step, manifest, &mut report)
                .await
                .map_err(|source| ProvisionError::Step {
                    step: step.to_string(),
                    source: Box::new(source),
                })?;
        }

        info!(
            plugins = report.plugins.len(),
            models = report.models.len(),
            model_bytes = report.total_model_bytes(),
            files = report.files.len(),
            "provisioning complete"
        );
        Ok(report)
    }

    async fn run_step(
        &self,
        step: &Step,
        manifest: &Manifest,
        report: &mut ProvisionReport,
    ) -> Result<(), ProvisionError> {
        match step {
            Step::SystemUpdate(cmd) => self.runner.run(cmd).await,
            Step::SystemInstall { packages, command } => {
                self.runner.run(command).await?;
                report.packages.extend(packages.iter().cloned());
                Ok(())
            }
            Step::Plugin { entry, command } => {
                self.runner.run(command).await?;
                report.plugins.push(entry.spec());
                Ok(())
            }
            Step::Model { entry, .. } => {
                let model =
                    download::download_model(&self.http, entry, &manifest.framework.root).await?;
                report.models.push(model);
                Ok(())
            }
            Step::File { entry, source } => {
                files::place_file(source, entry).await?;
                report.files.push(entry.destination.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample() -> Manifest {
        Manifest::from_toml_str(
            r#"
[framework]
root = "/comfyui"

[system]
packages = ["libgl1", "ffmpeg"]

[[plugins]]
name = "comfyui-videohelpersuite"
version = "1.7.4"

[[plugins]]
name = "comfyui-kjnodes"
version = "1.1.0"

[[models]]
url = "https://example.com/vae.safetensors"
relative_path = "models/vae"
filename = "wan_2.1_vae.safetensors"

[[files]]
source = "workflow.json"
destination = "/comfyui/workflow.json"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_plan_order() {
        let steps = plan(&sample());
        let kinds: Vec<_> = steps
            .iter()
            .map(|s| match s {
                Step::SystemUpdate(_) => "update",
                Step::SystemInstall { .. } => "install",
                Step::Plugin { .. } => "plugin",
                Step::Model { .. } => "model",
                Step::File { .. } => "file",
            })
            .collect();
        assert_eq!(kinds, ["update", "install", "plugin", "plugin", "model", "file"]);
    }

    #[test]
    fn test_plan_renders_installer_template() {
        let steps = plan(&sample());
        let Step::Plugin { command, .. } = &steps[2] else {
            panic!("expected plugin step");
        };
        assert_eq!(
            command.to_string(),
            "comfy node install --exit-on-fail comfyui-videohelpersuite@1.7.4"
        );
        assert_eq!(command.current_dir.as_deref(), Some(Path::new("/comfyui")));
    }

    #[test]
    fn test_plan_appends_packages() {
        let steps = plan(&sample());
        assert_eq!(
            steps[1].to_string(),
            "system install: apt-get install -y --no-install-recommends libgl1 ffmpeg"
        );
    }

    #[test]
    fn test_plan_skips_system_without_packages() {
        let mut manifest = sample();
        manifest.system.packages.clear();
        let steps = plan(&manifest);
        assert!(matches!(steps[0], Step::Plugin { .. }));
    }

    #[test]
    fn test_plan_model_destination() {
        let steps = plan(&sample());
        assert_eq!(
            steps[4].to_string(),
            "model https://example.com/vae.safetensors -> /comfyui/models/vae/wan_2.1_vae.safetensors"
        );
    }

    #[test]
    fn test_step_error_wraps_cause() {
        let err = ProvisionError::Step {
            step: "plugin x@1".to_string(),
            source: Box::new(ProvisionError::CommandFailed {
                command: "comfy node install x@1".to_string(),
                code: 1,
            }),
        };
        let text = err.to_string();
        assert!(text.contains("plugin x@1"));
        assert!(text.contains("exit code: 1"));
    }
}
