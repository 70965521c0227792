//! Docker client construction and shared error type

use std::sync::Arc;

use bollard::Docker;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Unsupported docker endpoint: {0}")]
    UnsupportedEndpoint(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Shared handle to one Docker daemon.
///
/// Cheap to clone; carries the endpoint it was built from so remote-daemon
/// switching can compare endpoints.
#[derive(Clone)]
pub struct DockerClient {
    client: Arc<Docker>,
    endpoint: String,
}

impl DockerClient {
    /// Connect to an endpoint. Empty string means the local defaults
    /// (DOCKER_HOST or the platform socket).
    pub fn connect(endpoint: &str) -> EngineResult<Self> {
        let client = if endpoint.is_empty() {
            Docker::connect_with_local_defaults()?
        } else if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?
        } else if endpoint.starts_with("tcp://")
            || endpoint.starts_with("http://")
            || endpoint.starts_with("https://")
        {
            Docker::connect_with_http(endpoint, 120, bollard::API_DEFAULT_VERSION)?
        } else {
            return Err(EngineError::UnsupportedEndpoint(endpoint.to_string()));
        };

        debug!("Connected docker client for endpoint {:?}", endpoint);

        Ok(Self {
            client: Arc::new(client),
            endpoint: endpoint.to_string(),
        })
    }

    pub fn client(&self) -> &Docker {
        &self.client
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the endpoint is a unix socket on this host
    pub fn is_local_socket(&self) -> bool {
        self.endpoint.is_empty() || self.endpoint.starts_with("unix://")
    }

    /// The socket path when local ("" endpoint resolves to the default)
    pub fn socket_path(&self) -> Option<String> {
        if self.endpoint.is_empty() {
            return Some("/var/run/docker.sock".to_string());
        }
        self.endpoint
            .strip_prefix("unix://")
            .map(|p| p.to_string())
    }

    pub async fn ping(&self) -> EngineResult<()> {
        self.client.ping().await?;
        Ok(())
    }
}

/// True when a Docker error is a 404 from the daemon
pub fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// True when a Docker error is a 409 conflict
pub fn is_conflict(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_endpoint() {
        assert!(matches!(
            DockerClient::connect("ftp://nope"),
            Err(EngineError::UnsupportedEndpoint(_))
        ));
    }

    #[test]
    fn test_socket_path_resolution() {
        let client = DockerClient::connect("unix:///var/run/docker.sock");
        // Construction does not dial, so this succeeds without a daemon
        let client = client.unwrap();
        assert!(client.is_local_socket());
        assert_eq!(
            client.socket_path().as_deref(),
            Some("/var/run/docker.sock")
        );
    }
}
