//! Artifact collection and upload

mod artificer;
mod store;

pub use artificer::{Artificer, CollectError};
pub use store::{FileStore, PutRequest, Store, StoreError};

use std::collections::HashMap;
use std::path::PathBuf;

/// A path collected out of a container, bound for a store
#[derive(Debug, Clone, Default)]
pub struct Artifact {
    pub container_id: String,

    /// Directory inside the container to collect
    pub guest_path: String,

    /// Host directory the contents are extracted into
    pub host_path: PathBuf,

    /// Host file the raw tar stream is written to
    pub host_tar_path: PathBuf,

    pub application_id: String,
    pub run_id: String,

    /// Set for per-step artifacts, absent for the pipeline artifact
    pub step_safe_id: Option<String>,

    pub bucket: String,

    /// Explicit store key; derived from the other fields when absent
    pub key: Option<String>,

    pub content_type: String,
    pub meta: HashMap<String, String>,
}

impl Artifact {
    /// Store key for the uploaded tarball
    pub fn remote_key(&self) -> String {
        if let Some(key) = &self.key {
            return key.clone();
        }

        let filename = self
            .host_tar_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact.tar".to_string());

        let mut parts = vec![self.bucket.as_str(), self.application_id.as_str(), self.run_id.as_str()];
        if let Some(step) = &self.step_safe_id {
            parts.push(step);
        }

        let mut key = parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        key.push('/');
        key.push_str(&filename);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_key_derivation() {
        let artifact = Artifact {
            application_id: "owner/app".to_string(),
            run_id: "run1".to_string(),
            bucket: "artifacts".to_string(),
            host_tar_path: PathBuf::from("/tmp/output.tar"),
            ..Default::default()
        };
        assert_eq!(artifact.remote_key(), "artifacts/owner/app/run1/output.tar");

        let with_step = Artifact {
            step_safe_id: Some("script-1".to_string()),
            ..artifact.clone()
        };
        assert_eq!(
            with_step.remote_key(),
            "artifacts/owner/app/run1/script-1/output.tar"
        );

        let explicit = Artifact {
            key: Some("custom/key.tar".to_string()),
            ..artifact
        };
        assert_eq!(explicit.remote_key(), "custom/key.tar");
    }
}
