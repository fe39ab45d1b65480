//! Model weight downloads.
//!
//! Files are streamed to `<dest>.part` and renamed into place once
//! complete, so a failed build never leaves a truncated model at the
//! final path. No resume, no retries.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use worker_core::ModelEntry;

use crate::ProvisionError;

/// A model file written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedModel {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Download one model entry under `root`.
pub async fn download_model(
    client: &reqwest::Client,
    entry: &ModelEntry,
    root: &Path,
) -> Result<DownloadedModel, ProvisionError> {
    let dest = entry.destination(root);
    let part = part_path(&dest);

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ProvisionError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    info!(url = %entry.url, dest = %dest.display(), "downloading model");

    match fetch_to(client, &entry.url, &part).await {
        Ok((size_bytes, sha256)) => {
            if let Some(expected) = &entry.sha256
                && !expected.eq_ignore_ascii_case(&sha256)
            {
                remove_quietly(&part).await;
                return Err(ProvisionError::Checksum {
                    path: dest,
                    expected: expected.to_ascii_lowercase(),
                    actual: sha256,
                });
            }

            tokio::fs::rename(&part, &dest)
                .await
                .map_err(|source| ProvisionError::Io {
                    path: dest.clone(),
                    source,
                })?;

            info!(
                "Downloaded {}: {} bytes, sha256: {}",
                dest.display(),
                size_bytes,
                sha256
            );

            Ok(DownloadedModel {
                path: dest,
                size_bytes,
                sha256,
            })
        }
        Err(e) => {
            remove_quietly(&part).await;
            Err(e)
        }
    }
}

/// Stream `url` into `path`, returning byte count and hex SHA-256.
async fn fetch_to(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
) -> Result<(u64, String), ProvisionError> {
    let download_err = |reason: String| ProvisionError::Download {
        url: url.to_string(),
        reason,
    };

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| download_err(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(download_err(format!("HTTP {status}")));
    }
    if let Some(len) = response.content_length() {
        debug!(%url, bytes = len, "download started");
    }

    let file = tokio::fs::File::create(path)
        .await
        .map_err(|source| ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let mut writer = BufWriter::with_capacity(1024 * 1024, file);
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| download_err(e.to_string()))?;
        hasher.update(&chunk);
        size_bytes += chunk.len() as u64;
        writer
            .write_all(&chunk)
            .await
            .map_err(|source| ProvisionError::Io {
                path: path.to_path_buf(),
                source,
            })?;
    }

    writer.flush().await.map_err(|source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok((size_bytes, hex::encode(hasher.finalize())))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove partial download");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry(server: &MockServer, file: &str) -> ModelEntry {
        ModelEntry {
            url: format!("{}/files/{file}", server.uri()),
            relative_path: "models/vae".to_string(),
            filename: file.to_string(),
            sha256: None,
        }
    }

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/m/vae.safetensors")),
            PathBuf::from("/m/vae.safetensors.part")
        );
    }

    #[tokio::test]
    async fn test_download_writes_file_and_digest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/vae.safetensors"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"weights".to_vec()))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let model = download_model(&reqwest::Client::new(), &entry(&server, "vae.safetensors"), root.path())
            .await
            .unwrap();

        assert_eq!(model.path, root.path().join("models/vae/vae.safetensors"));
        assert_eq!(model.size_bytes, 7);
        assert_eq!(model.sha256, hex::encode(Sha256::digest(b"weights")));
        assert_eq!(std::fs::read(&model.path).unwrap(), b"weights");
        assert!(!part_path(&model.path).exists());
    }

    #[tokio::test]
    async fn test_download_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let err = download_model(&reqwest::Client::new(), &entry(&server, "gone.bin"), root.path())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("404"), "{err}");
        assert!(!root.path().join("models/vae/gone.bin").exists());
    }

    #[tokio::test]
    async fn test_download_checksum_mismatch_leaves_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let mut model = entry(&server, "lora.safetensors");
        model.sha256 = Some(hex::encode(Sha256::digest(b"original")));

        let err = download_model(&reqwest::Client::new(), &model, root.path())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Checksum { .. }));
        let dest = model.destination(root.path());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_download_checksum_match_accepts_uppercase() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"exact".to_vec()))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let mut model = entry(&server, "clip.safetensors");
        model.sha256 = Some(hex::encode(Sha256::digest(b"exact")).to_ascii_uppercase());

        let downloaded = download_model(&reqwest::Client::new(), &model, root.path())
            .await
            .unwrap();
        assert_eq!(downloaded.size_bytes, 5);
    }
}
