//! Collecting artifacts out of containers and shipping them to a store

use std::path::Path;

use bollard::container::DownloadFromContainerOptions;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::store::{PutRequest, Store, StoreError};
use super::Artifact;
use crate::archive::{Archive, ExtractError, ARTIFACT_SIZE_CAP};
use crate::engine::DockerClient;

#[derive(Debug, Error)]
pub enum CollectError {
    /// The guest path produced no regular files
    #[error("Empty tarball")]
    EmptyTarball,

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Extract error: {0}")]
    Extract(ExtractError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CollectError {
    pub fn is_empty_tarball(&self) -> bool {
        matches!(self, CollectError::EmptyTarball)
    }
}

impl From<ExtractError> for CollectError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::EmptyTarball => CollectError::EmptyTarball,
            other => CollectError::Extract(other),
        }
    }
}

/// Streams container paths into tarballs and hands them to a store
pub struct Artificer {
    client: DockerClient,
}

impl Artificer {
    pub fn new(client: DockerClient) -> Self {
        Self { client }
    }

    /// Collect `artifact.guest_path` from its container: the raw tar is
    /// written to `host_tar_path` as it streams, then extracted into
    /// `host_path`.
    pub async fn collect(&self, artifact: &Artifact) -> Result<(), CollectError> {
        self.collect_path(artifact, &artifact.guest_path, ARTIFACT_SIZE_CAP)
            .await
    }

    /// Collect with an explicit size cap (cache collection is tighter)
    pub async fn collect_capped(
        &self,
        artifact: &Artifact,
        size_cap: u64,
    ) -> Result<(), CollectError> {
        self.collect_path(artifact, &artifact.guest_path, size_cap)
            .await
    }

    /// Collect with a fallback guest path tried when the primary one is
    /// an empty tarball.
    pub async fn collect_with_fallback(
        &self,
        artifact: &Artifact,
        fallback_guest_path: &str,
    ) -> Result<(), CollectError> {
        match self
            .collect_path(artifact, &artifact.guest_path, ARTIFACT_SIZE_CAP)
            .await
        {
            Err(e) if e.is_empty_tarball() => {
                info!(
                    "No files under {}, falling back to {}",
                    artifact.guest_path, fallback_guest_path
                );
                self.collect_path(artifact, fallback_guest_path, ARTIFACT_SIZE_CAP)
                    .await
            }
            other => other,
        }
    }

    async fn collect_path(
        &self,
        artifact: &Artifact,
        guest_path: &str,
        size_cap: u64,
    ) -> Result<(), CollectError> {
        self.download_tar(&artifact.container_id, guest_path, &artifact.host_tar_path)
            .await?;

        let prefix = Path::new(guest_path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        let tar_path = artifact.host_tar_path.clone();
        let host_path = artifact.host_path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), CollectError> {
            let file = std::fs::File::open(&tar_path)?;
            Archive::new(file).multi(&prefix, &host_path, size_cap)?;
            Ok(())
        })
        .await
        .map_err(|e| CollectError::Io(std::io::Error::other(e)))??;

        debug!(
            "Collected {} into {}",
            guest_path,
            artifact.host_path.display()
        );
        Ok(())
    }

    /// Stream one guest path out of the container into a tar file
    async fn download_tar(
        &self,
        container_id: &str,
        guest_path: &str,
        tar_path: &Path,
    ) -> Result<(), CollectError> {
        if let Some(parent) = tar_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = DownloadFromContainerOptions { path: guest_path };
        let mut stream = self
            .client
            .client()
            .download_from_container(container_id, Some(options));

        let mut file = tokio::fs::File::create(tar_path).await?;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => file.write_all(&bytes).await?,
                Err(e) => {
                    // A missing path is an empty tarball, not a failure
                    if let bollard::errors::Error::DockerResponseServerError {
                        status_code: 404,
                        ..
                    } = e
                    {
                        warn!("Guest path {} does not exist", guest_path);
                        file.flush().await?;
                        return Ok(());
                    }
                    return Err(CollectError::Docker(e));
                }
            }
        }
        file.flush().await?;
        Ok(())
    }

    /// Read one file out of a container; empty tarball when it is absent
    pub async fn read_file(
        &self,
        container_id: &str,
        guest_path: &str,
    ) -> Result<Vec<u8>, CollectError> {
        let options = DownloadFromContainerOptions { path: guest_path };
        let mut stream = self
            .client
            .client()
            .download_from_container(container_id, Some(options));

        let mut tar_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => tar_bytes.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    ..
                }) => return Err(CollectError::EmptyTarball),
                Err(e) => return Err(CollectError::Docker(e)),
            }
        }

        let name = Path::new(guest_path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, CollectError> {
            let mut out = Vec::new();
            Archive::new(&tar_bytes[..]).single_bytes(&name, &mut out)?;
            Ok(out)
        })
        .await
        .map_err(|e| CollectError::Io(std::io::Error::other(e)))?
    }

    /// Upload the collected tarball to the store
    pub async fn upload(&self, store: &dyn Store, artifact: &Artifact) -> Result<(), CollectError> {
        store
            .put(PutRequest {
                path: &artifact.host_tar_path,
                key: artifact.remote_key(),
                content_type: if artifact.content_type.is_empty() {
                    "application/x-tar".to_string()
                } else {
                    artifact.content_type.clone()
                },
                meta: &artifact.meta,
                max_tries: 3,
            })
            .await?;
        Ok(())
    }
}
