//! Step registry client and step package handling

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("step not found")]
    StepNotFound,

    #[error("Registry request failed: {0}")]
    Request(String),

    #[error("Tarball download failed: {0}")]
    Download(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid step manifest: {0}")]
    Manifest(String),
}

/// Transient registry fetches retry this many times
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_secs(1);

/// Resolved registry step metadata
#[derive(Debug, Clone, Deserialize)]
pub struct StepInfo {
    #[serde(default)]
    pub summary: Option<String>,

    #[serde(rename = "tarballUrl")]
    pub tarball_url: String,

    pub version: StepVersion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepVersion {
    pub number: String,
}

#[derive(Debug, Deserialize)]
struct StepResponse {
    step: StepInfo,
}

/// Client for the external step registry
#[derive(Clone)]
pub struct StepRegistry {
    base_url: String,
    http: reqwest::Client,
}

impl StepRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Resolve `{owner, name, version}` to a tarball; bounded retries on
    /// transient failures, an immediate miss on 404.
    pub async fn resolve(
        &self,
        owner: &str,
        name: &str,
        version: &str,
    ) -> Result<StepInfo, RegistryError> {
        let url = format!(
            "{}/steps/{}/{}?version={}",
            self.base_url.trim_end_matches('/'),
            owner,
            name,
            version
        );

        let mut last = String::new();
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.http.get(&url).send().await {
                Ok(response) => {
                    if response.status() == reqwest::StatusCode::NOT_FOUND {
                        return Err(RegistryError::StepNotFound);
                    }
                    if response.status().is_success() {
                        let parsed: StepResponse = response
                            .json()
                            .await
                            .map_err(|e| RegistryError::Request(e.to_string()))?;
                        debug!(
                            "Resolved {}/{}@{} -> {}",
                            owner, name, version, parsed.step.version.number
                        );
                        return Ok(parsed.step);
                    }
                    last = format!("registry returned {}", response.status());
                }
                Err(e) => last = e.to_string(),
            }

            warn!(
                "Registry fetch attempt {}/{} failed: {}",
                attempt, FETCH_ATTEMPTS, last
            );
            if attempt < FETCH_ATTEMPTS {
                tokio::time::sleep(FETCH_BACKOFF).await;
            }
        }

        Err(RegistryError::Request(last))
    }

    /// Download a step tarball into the shared step cache and unpack it.
    /// Returns the unpacked directory.
    pub async fn fetch_tarball(
        &self,
        info: &StepInfo,
        cache_dir: &Path,
        owner: &str,
        name: &str,
    ) -> Result<PathBuf, RegistryError> {
        let dirname = format!("{}-{}@{}", owner, name, info.version.number);
        let target = cache_dir.join(&dirname);

        if target.is_dir() {
            debug!("Step {} already cached", dirname);
            return Ok(target);
        }

        crate::fsutil::download_tarball(&info.tarball_url, &target)
            .await
            .map_err(|e| RegistryError::Download(e.to_string()))?;

        info!("Fetched step {} from registry", dirname);
        Ok(target)
    }
}

/// Property declared in a step manifest
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropertyDefinition {
    #[serde(default)]
    pub default: Option<String>,

    #[serde(default)]
    pub required: bool,
}

/// `step.yml` shipped inside a step package
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepManifest {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub summary: Option<String>,

    #[serde(rename = "sync-environment", default)]
    pub sync_environment: bool,

    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
}

impl StepManifest {
    /// Load `step.yml` (or `wercker-step.yml`) from a step directory
    pub fn load(step_dir: &Path) -> Result<Option<Self>, RegistryError> {
        for candidate in ["step.yml", "wercker-step.yml"] {
            let path = step_dir.join(candidate);
            if path.is_file() {
                let content = std::fs::read_to_string(&path)?;
                let manifest: StepManifest = serde_yaml::from_str(&content)
                    .map_err(|e| RegistryError::Manifest(e.to_string()))?;
                return Ok(Some(manifest));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_parsing() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("step.yml"),
            r#"
name: install-packages
version: 1.0.2
sync-environment: true
properties:
  packages:
    default: ""
    required: true
  update:
    default: "false"
"#,
        )
        .unwrap();

        let manifest = StepManifest::load(tmp.path()).unwrap().unwrap();
        assert_eq!(manifest.name.as_deref(), Some("install-packages"));
        assert!(manifest.sync_environment);
        assert_eq!(manifest.properties.len(), 2);
        assert_eq!(
            manifest.properties["update"].default.as_deref(),
            Some("false")
        );
        assert!(manifest.properties["packages"].required);
    }

    #[test]
    fn test_manifest_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(StepManifest::load(tmp.path()).unwrap().is_none());
    }
}
