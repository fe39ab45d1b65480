//! manifest.toml — what the image build installs.
//!
//! ```toml
//! [framework]
//! root = "/comfyui"
//!
//! [system]
//! packages = ["libgl1", "ffmpeg"]
//!
//! [[plugins]]
//! name = "comfyui-videohelpersuite"
//! version = "1.7.4"
//!
//! [[models]]
//! url = "https://example.com/wan_2.1_vae.safetensors"
//! relative_path = "models/vae"
//! filename = "wan_2.1_vae.safetensors"
//!
//! [[files]]
//! source = "workflow.json"
//! destination = "/comfyui/workflow.json"
//! ```
//!
//! Entry order is install order.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error(transparent)]
    Load(#[from] ConfigError),

    #[error("invalid manifest:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub framework: FrameworkConfig,
    #[serde(default)]
    pub installer: InstallerConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Directory relative file sources resolve against (the manifest's own
    /// directory when loaded from disk).
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    pub root: PathBuf,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/comfyui"),
        }
    }
}

/// Command template for installing one plugin. `{name}` and `{version}`
/// are substituted in every argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: "comfy".to_string(),
            args: vec![
                "node".to_string(),
                "install".to_string(),
                "--exit-on-fail".to_string(),
                "{name}@{version}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub packages: Vec<String>,
    /// Index refresh run once before installing; empty to skip.
    pub update: Vec<String>,
    /// Install command; package names are appended.
    pub install: Vec<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            packages: Vec::new(),
            update: vec!["apt-get".to_string(), "update".to_string()],
            install: vec![
                "apt-get".to_string(),
                "install".to_string(),
                "-y".to_string(),
                "--no-install-recommends".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    pub version: String,
}

impl PluginEntry {
    pub fn spec(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub url: String,
    /// Destination directory relative to the framework root.
    pub relative_path: String,
    pub filename: String,
    /// Expected hex SHA-256 of the file, checked when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ModelEntry {
    pub fn destination(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path).join(&self.filename)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Octal permission bits, e.g. "0755".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl FileEntry {
    pub fn mode_bits(&self) -> Option<u32> {
        self.mode
            .as_deref()
            .and_then(|m| u32::from_str_radix(m.trim_start_matches("0o"), 8).ok())
    }
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Resolve a file entry's source against the manifest directory.
    pub fn source_path(&self, entry: &FileEntry) -> PathBuf {
        if entry.source.is_absolute() {
            entry.source.clone()
        } else {
            self.base_dir.join(&entry.source)
        }
    }

    /// Check every entry, collecting all problems instead of stopping at
    /// the first one.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut problems = Vec::new();

        let mut plugin_names = HashSet::new();
        for (i, plugin) in self.plugins.iter().enumerate() {
            if plugin.name.trim().is_empty() {
                problems.push(format!("plugins[{i}]: name is empty"));
            }
            if plugin.version.trim().is_empty() {
                problems.push(format!("plugins[{i}] ({}): version is empty", plugin.name));
            }
            if !plugin_names.insert(plugin.name.to_ascii_lowercase()) {
                problems.push(format!("plugins[{i}]: duplicate plugin {}", plugin.name));
            }
        }

        let mut destinations = HashSet::new();
        for (i, model) in self.models.iter().enumerate() {
            if !(model.url.starts_with("https://") || model.url.starts_with("http://")) {
                problems.push(format!("models[{i}]: url must be http(s): {}", model.url));
            }
            if !is_contained_relative(Path::new(&model.relative_path)) {
                problems.push(format!(
                    "models[{i}]: relative_path must be relative without '..': {}",
                    model.relative_path
                ));
            }
            if !is_single_component(&model.filename) {
                problems.push(format!(
                    "models[{i}]: filename must be a plain file name: {}",
                    model.filename
                ));
            }
            if let Some(digest) = &model.sha256
                && (digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()))
            {
                problems.push(format!("models[{i}]: sha256 must be 64 hex characters"));
            }
            let dest = Path::new(&model.relative_path).join(&model.filename);
            if !destinations.insert(dest.clone()) {
                problems.push(format!("models[{i}]: duplicate destination {}", dest.display()));
            }
        }

        for (i, file) in self.files.iter().enumerate() {
            if !file.destination.is_absolute() {
                problems.push(format!(
                    "files[{i}]: destination must be absolute: {}",
                    file.destination.display()
                ));
            }
            if file.mode.is_some() && file.mode_bits().is_none() {
                problems.push(format!(
                    "files[{i}]: mode must be octal: {}",
                    file.mode.as_deref().unwrap_or_default()
                ));
            }
        }

        if self.installer.program.trim().is_empty() {
            problems.push("installer.program is empty".to_string());
        }
        if !self.system.packages.is_empty() && self.system.install.is_empty() {
            problems.push("system.install is empty but packages are listed".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ManifestError::Invalid(problems))
        }
    }
}

fn is_contained_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}
