//! Remote docker daemon provisioning

use async_trait::async_trait;

use super::{BoxError, BoxResult};

/// Provisions a dedicated docker daemon for a run.
///
/// When a pipeline asks for raw docker access and a provisioner is
/// configured, the box switches to the returned endpoint for the rest of
/// the run and deprovisions it during cleanup.
#[async_trait]
pub trait DaemonProvisioner: Send + Sync {
    /// Obtain a daemon endpoint for this run
    async fn provision(&self, run_id: &str) -> BoxResult<String>;

    /// Release the daemon; best-effort, called from cleanup paths
    async fn deprovision(&self, run_id: &str) -> BoxResult<()>;
}

/// Provisioner that hands out a preconfigured endpoint.
///
/// Covers the common case of an externally managed daemon reached over
/// a fixed URI (including a local socket used for testing).
pub struct StaticProvisioner {
    endpoint: String,
}

impl StaticProvisioner {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl DaemonProvisioner for StaticProvisioner {
    async fn provision(&self, run_id: &str) -> BoxResult<String> {
        if self.endpoint.is_empty() {
            return Err(BoxError::RemoteDaemon(
                "No daemon endpoint configured".to_string(),
            ));
        }
        tracing::info!("Provisioned daemon {} for run {}", self.endpoint, run_id);
        Ok(self.endpoint.clone())
    }

    async fn deprovision(&self, _run_id: &str) -> BoxResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provisioner() {
        let provisioner = StaticProvisioner::new("unix:///var/run/docker.sock");
        let endpoint = provisioner.provision("r1").await.unwrap();
        assert_eq!(endpoint, "unix:///var/run/docker.sock");
        provisioner.deprovision("r1").await.unwrap();

        let empty = StaticProvisioner::new("");
        assert!(empty.provision("r1").await.is_err());
    }
}
