//! worker-core — shared types for comfy-worker.
//!
//! Holds the two configuration documents the worker reads:
//!
//! - `worker.toml` ([`WorkerConfig`]) — how the launcher starts the GUI
//!   server, how it waits for readiness, and what handler it runs.
//! - `manifest.toml` ([`Manifest`]) — what the image build installs:
//!   OS packages, plugins, model weights and placed files.

pub mod config;
pub mod duration;
pub mod manifest;

pub use config::{ConfigError, WorkerConfig};
pub use duration::{HumanDuration, parse_duration};
pub use manifest::{FileEntry, Manifest, ManifestError, ModelEntry, PluginEntry};
