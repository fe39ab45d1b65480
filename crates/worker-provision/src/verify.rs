//! Post-build verification: is everything the manifest declares on disk?

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;
use worker_core::{Manifest, PluginEntry};

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check plugins, models and placed files against the manifest.
///
/// Plugins are looked up under `<root>/custom_nodes/` by directory name
/// (case-insensitive). When the plugin ships a `pyproject.toml` its
/// `[project].version` must match the pinned version.
pub fn verify(manifest: &Manifest) -> VerifyReport {
    let root = &manifest.framework.root;
    let mut report = VerifyReport::default();

    for plugin in &manifest.plugins {
        report.checked += 1;
        if let Err(problem) = check_plugin(root, plugin) {
            report.problems.push(problem);
        }
    }

    for model in &manifest.models {
        report.checked += 1;
        let dest = model.destination(root);
        match std::fs::metadata(&dest) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                debug!(path = %dest.display(), bytes = meta.len(), "model present");
            }
            Ok(_) => report
                .problems
                .push(format!("model {} is empty or not a file", dest.display())),
            Err(_) => report
                .problems
                .push(format!("model {} is missing", dest.display())),
        }
    }

    for file in &manifest.files {
        report.checked += 1;
        if !file.destination.is_file() {
            report
                .problems
                .push(format!("file {} is missing", file.destination.display()));
        }
    }

    report
}

fn check_plugin(root: &Path, plugin: &PluginEntry) -> Result<(), String> {
    let dir = find_plugin_dir(&root.join("custom_nodes"), &plugin.name)
        .ok_or_else(|| format!("plugin {} is not installed", plugin.name))?;

    match installed_version(&dir) {
        Some(installed) if !versions_match(&installed, &plugin.version) => Err(format!(
            "plugin {} is at version {installed}, expected {}",
            plugin.name, plugin.version
        )),
        Some(installed) => {
            debug!(plugin = %plugin.name, version = %installed, "plugin present");
            Ok(())
        }
        None => {
            debug!(plugin = %plugin.name, dir = %dir.display(), "plugin present, version not declared");
            Ok(())
        }
    }
}

fn find_plugin_dir(custom_nodes: &Path, name: &str) -> Option<PathBuf> {
    std::fs::read_dir(custom_nodes)
        .ok()?
        .filter_map(Result::ok)
        .find(|entry| {
            entry.path().is_dir() && entry.file_name().to_string_lossy().eq_ignore_ascii_case(name)
        })
        .map(|entry| entry.path())
}

/// `[project].version` from the plugin's pyproject.toml.
fn installed_version(plugin_dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(plugin_dir.join("pyproject.toml")).ok()?;
    let doc: toml::Value = toml::from_str(&content).ok()?;
    doc.get("project")?
        .get("version")?
        .as_str()
        .map(str::to_string)
}

fn versions_match(installed: &str, pinned: &str) -> bool {
    let trim = |v: &str| v.trim().trim_start_matches('v').to_string();
    match (
        semver::Version::parse(&trim(installed)),
        semver::Version::parse(&trim(pinned)),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => trim(installed) == trim(pinned),
    }
}
