//! Artifact store interface and the bundled filesystem backend

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store put failed after {tries} tries: {last}")]
    Exhausted { tries: u32, last: String },

    #[error("{0}")]
    Other(String),
}

/// One upload request
pub struct PutRequest<'a> {
    /// Local file to upload
    pub path: &'a Path,

    /// Destination key
    pub key: String,

    pub content_type: String,

    pub meta: &'a HashMap<String, String>,

    /// Bounded retry count
    pub max_tries: u32,
}

/// Destination for collected artifacts.
///
/// Remote backends (object storage, registries) live behind this trait;
/// the engine only ever calls `put`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, request: PutRequest<'_>) -> Result<(), StoreError>;
}

/// Filesystem-backed store
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn destination(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl Store for FileStore {
    async fn put(&self, request: PutRequest<'_>) -> Result<(), StoreError> {
        let destination = self.destination(&request.key);

        let tries = request.max_tries.max(1);
        let mut last = String::new();

        for attempt in 1..=tries {
            let result: Result<(), std::io::Error> = async {
                if let Some(parent) = destination.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(request.path, &destination).await?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => {
                    debug!(
                        "Stored {} as {} ({})",
                        request.path.display(),
                        destination.display(),
                        request.content_type
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("Store put attempt {}/{} failed: {}", attempt, tries, e);
                    last = e.to_string();
                    if attempt < tries {
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }

        Err(StoreError::Exhausted { tries, last })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_put() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src.tar");
        tokio::fs::write(&source, b"data").await.unwrap();

        let store = FileStore::new(tmp.path().join("store"));
        let meta = HashMap::new();
        store
            .put(PutRequest {
                path: &source,
                key: "artifacts/app/run/src.tar".to_string(),
                content_type: "application/x-tar".to_string(),
                meta: &meta,
                max_tries: 3,
            })
            .await
            .unwrap();

        let stored = tmp.path().join("store/artifacts/app/run/src.tar");
        assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_file_store_exhausts_retries() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("store"));
        let meta = HashMap::new();
        let missing = tmp.path().join("missing.tar");

        let err = store
            .put(PutRequest {
                path: &missing,
                key: "k".to_string(),
                content_type: "application/x-tar".to_string(),
                meta: &meta,
                max_tries: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Exhausted { tries: 1, .. }));
    }
}
