//! Per-run Docker network lifecycle

use std::collections::HashMap;

use bollard::network::{CreateNetworkOptions, DisconnectNetworkOptions};
use tracing::{debug, info, warn};

use super::BoxError;
use crate::engine::docker::is_conflict;
use crate::engine::DockerClient;

/// How many name collisions we tolerate before giving up
const CREATE_ATTEMPTS: usize = 3;

/// The network a run's containers share
#[derive(Debug, Clone)]
pub struct RunNetwork {
    pub name: String,
    pub id: String,
    /// Whether this run created it (and so must remove it)
    pub created: bool,
}

/// Use the configured network, or create a fresh `w-<short-id>` one
pub async fn ensure_network(
    client: &DockerClient,
    configured: &str,
) -> Result<RunNetwork, BoxError> {
    if !configured.is_empty() {
        let network = client
            .client()
            .inspect_network::<String>(configured, None)
            .await?;
        return Ok(RunNetwork {
            name: configured.to_string(),
            id: network.id.unwrap_or_default(),
            created: false,
        });
    }

    let mut last_err = None;
    for attempt in 1..=CREATE_ATTEMPTS {
        let short_id = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let name = format!("w-{}", short_id);

        let mut options = HashMap::new();
        options.insert(
            "com.docker.network.bridge.enable_icc".to_string(),
            "true".to_string(),
        );
        options.insert(
            "com.docker.network.bridge.enable_ip_masquerade".to_string(),
            "true".to_string(),
        );
        options.insert(
            "com.docker.network.driver.mtu".to_string(),
            "1500".to_string(),
        );

        let create = CreateNetworkOptions {
            name: name.clone(),
            check_duplicate: true,
            options,
            ..Default::default()
        };

        match client.client().create_network(create).await {
            Ok(_) => {
                info!("Created docker network {}", name);
                let id = client
                    .client()
                    .inspect_network::<String>(&name, None)
                    .await
                    .ok()
                    .and_then(|n| n.id)
                    .unwrap_or_default();
                return Ok(RunNetwork {
                    name,
                    id,
                    created: true,
                });
            }
            Err(e) if is_conflict(&e) => {
                debug!("Network name {} collided (attempt {})", name, attempt);
                last_err = Some(e);
            }
            Err(e) => return Err(BoxError::Docker(e)),
        }
    }

    Err(BoxError::Network(format!(
        "Failed to create a network after {} attempts: {}",
        CREATE_ATTEMPTS,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Remove a created network, disconnecting any stragglers first
pub async fn remove_network(client: &DockerClient, network: &RunNetwork) -> Result<(), BoxError> {
    if !network.created {
        return Ok(());
    }

    if let Ok(inspected) = client
        .client()
        .inspect_network::<String>(&network.name, None)
        .await
    {
        for container in inspected.containers.unwrap_or_default().keys() {
            debug!("Disconnecting {} from {}", container, network.name);
            let options = DisconnectNetworkOptions {
                container: container.clone(),
                force: true,
            };
            if let Err(e) = client
                .client()
                .disconnect_network(&network.name, options)
                .await
            {
                warn!("Failed to disconnect {}: {}", container, e);
            }
        }
    }

    match client.client().remove_network(&network.name).await {
        Ok(()) => {
            info!("Removed docker network {}", network.name);
            Ok(())
        }
        Err(e) if crate::engine::docker::is_not_found(&e) => Ok(()),
        Err(e) => Err(BoxError::Docker(e)),
    }
}
