//! Placing workflow definitions and scripts at fixed paths.

use std::path::Path;

use tracing::info;
use worker_core::FileEntry;

use crate::ProvisionError;

/// Copy `source` to the entry's destination and apply its mode.
pub async fn place_file(source: &Path, entry: &FileEntry) -> Result<(), ProvisionError> {
    let dest = &entry.destination;
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ProvisionError::Io { path, source }
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }
    tokio::fs::copy(source, dest).await.map_err(io_err(source))?;

    if let Some(mode) = entry.mode_bits() {
        set_mode(dest, mode).await.map_err(io_err(dest))?;
    }

    info!(
        source = %source.display(),
        dest = %dest.display(),
        mode = entry.mode.as_deref().unwrap_or("-"),
        "placed file"
    );
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
