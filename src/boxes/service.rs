//! Service containers attached to the pipeline network

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::{EndpointSettings, HostConfig};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::network::RunNetwork;
use super::BoxError;
use crate::config::BoxDefinition;
use crate::core::{Environment, PipelineOptions};
use crate::engine::docker::is_not_found;
use crate::engine::{normalize_repo, split_repo_tag, DockerClient};
use crate::events::{Emitter, LogStream};

/// An auxiliary container (database, queue) for one run.
///
/// Started before the base box; its address and ports are surfaced to the
/// base container through legacy link-style env vars.
pub struct ServiceBox {
    pub config: BoxDefinition,
    pub alias: String,
    pub repository: String,
    pub tag: String,
    container_id: Option<String>,
    container_name: String,
    client: DockerClient,
    emitter: Emitter,
    run_id: String,
}

/// Runtime facts needed for link env computation
#[derive(Debug, Clone, Default)]
pub struct ServiceInfo {
    pub alias: String,
    pub ip: String,
    /// (port, protocol), sorted ascending
    pub ports: Vec<(u16, String)>,
    pub env: Vec<(String, String)>,
}

impl ServiceBox {
    pub fn new(
        options: &PipelineOptions,
        config: BoxDefinition,
        client: DockerClient,
        emitter: Emitter,
    ) -> Self {
        let (repository, tag) = split_repo_tag(&config.id, "latest");
        let alias = config.name.clone().unwrap_or_else(|| {
            repository
                .rsplit('/')
                .next()
                .unwrap_or(&repository)
                .to_string()
        });
        let container_name = format!("wercker-service-{}-{}", alias, options.run_id);

        Self {
            config,
            alias,
            repository,
            tag,
            container_id: None,
            container_name,
            client,
            emitter,
            run_id: options.run_id.clone(),
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Pull the service image unless it is already present
    pub async fn fetch(&self, env: &Environment) -> Result<(), BoxError> {
        let reference = format!("{}:{}", env.interpolate(&self.repository), self.tag);
        if self.client.client().inspect_image(&reference).await.is_ok() {
            debug!("Service image {} already exists", reference);
            return Ok(());
        }

        let inferred = normalize_repo(&self.repository, "");
        let credentials = crate::engine::auth::credentials_for(&self.config, &inferred.registry);

        let options = bollard::image::CreateImageOptions {
            from_image: reference.as_str(),
            ..Default::default()
        };
        let mut stream = self
            .client
            .client()
            .create_image(Some(options), None, credentials);

        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(BoxError::ImagePull(e.to_string()));
            }
        }

        info!("Pulled service image {}", reference);
        Ok(())
    }

    /// Create and start the service on the run network, then inspect it
    /// for link env computation. Spawns a waiter that surfaces logs when
    /// the service dies with a non-zero exit.
    pub async fn run(
        &mut self,
        env: &Environment,
        network: &RunNetwork,
        memory_bytes: u64,
    ) -> Result<ServiceInfo, BoxError> {
        let image = format!("{}:{}", env.interpolate(&self.repository), self.tag);

        let env_vars: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, env.interpolate(v)))
            .collect();

        let mut endpoints = HashMap::new();
        endpoints.insert(
            network.name.clone(),
            EndpointSettings {
                aliases: Some(vec![self.alias.clone()]),
                ..Default::default()
            },
        );

        let host_config = HostConfig {
            memory: if memory_bytes > 0 {
                Some(memory_bytes as i64)
            } else {
                None
            },
            network_mode: Some(network.name.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.clone()),
            env: Some(env_vars),
            cmd: self
                .config
                .cmd
                .as_ref()
                .map(|c| shell_words::split(c))
                .transpose()
                .map_err(|e| BoxError::Config(format!("Invalid service cmd: {}", e)))?,
            entrypoint: self
                .config
                .entrypoint
                .as_ref()
                .map(|c| shell_words::split(c))
                .transpose()
                .map_err(|e| BoxError::Config(format!("Invalid service entrypoint: {}", e)))?,
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: self.container_name.as_str(),
            platform: None,
        };

        let created = self
            .client
            .client()
            .create_container(Some(options), config)
            .await?;
        self.container_id = Some(created.id.clone());

        self.client
            .client()
            .start_container(&self.container_name, None::<StartContainerOptions<String>>)
            .await?;
        info!("Started service {} ({})", self.alias, image);

        self.spawn_exit_waiter(created.id.clone());

        let inspected = self
            .client
            .client()
            .inspect_container(&self.container_name, None)
            .await?;

        let ip = inspected
            .network_settings
            .as_ref()
            .and_then(|s| s.networks.as_ref())
            .and_then(|n| n.get(&network.name))
            .and_then(|e| e.ip_address.clone())
            .unwrap_or_default();

        let mut ports: Vec<(u16, String)> = inspected
            .config
            .as_ref()
            .and_then(|c| c.exposed_ports.as_ref())
            .map(|map| {
                map.keys()
                    .filter_map(|key| {
                        let (port, proto) = key.split_once('/')?;
                        Some((port.parse::<u16>().ok()?, proto.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        ports.sort();

        Ok(ServiceInfo {
            alias: self.alias.clone(),
            ip,
            ports,
            env: self
                .config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), env.interpolate(v)))
                .collect(),
        })
    }

    /// Watch for the service dying early and drain its logs to the emitter
    fn spawn_exit_waiter(&self, container_id: String) {
        let client = self.client.clone();
        let emitter = self.emitter.clone();
        let run_id = self.run_id.clone();
        let alias = self.alias.clone();

        tokio::spawn(async move {
            let options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut stream = client.client().wait_container(&container_id, Some(options));

            let status = match stream.next().await {
                Some(Ok(response)) => response.status_code,
                _ => return,
            };

            if status == 0 {
                return;
            }

            warn!("Service {} exited with code {}", alias, status);
            let log_options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "50".to_string(),
                ..Default::default()
            };
            let mut logs = client.client().logs(&container_id, Some(log_options));
            while let Some(Ok(output)) = logs.next().await {
                emitter.emit_log(
                    &run_id,
                    "",
                    LogStream::Stderr,
                    format!("service {}: {}", alias, output),
                    false,
                );
            }
        });
    }

    /// Graceful 1-second stop
    pub async fn stop(&self) {
        if self.container_id.is_none() {
            return;
        }
        let options = StopContainerOptions { t: 1 };
        if let Err(e) = self
            .client
            .client()
            .stop_container(&self.container_name, Some(options))
            .await
        {
            if !is_not_found(&e) {
                warn!("Failed to stop service {}: {}", self.alias, e);
            }
        }
    }

    /// Force removal, volumes included
    pub async fn clean(&self) {
        if self.container_id.is_none() {
            return;
        }
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .client
            .client()
            .remove_container(&self.container_name, Some(options))
            .await
        {
            Ok(()) => debug!("Removed service container {}", self.container_name),
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!("Failed to remove service {}: {}", self.alias, e),
        }
    }
}

/// Legacy container-link env vars for one service.
///
/// `run_container` is the base container's name. Service env vars that
/// would collide with a link var are skipped.
pub fn link_env_vars(info: &ServiceInfo, run_container: &str) -> Vec<(String, String)> {
    let alias = info.alias.to_uppercase().replace('-', "_");
    let mut vars: Vec<(String, String)> = Vec::new();

    vars.push((
        format!("{}_NAME", alias),
        format!("/{}/{}", run_container, info.alias),
    ));

    if let Some((port, proto)) = info.ports.first() {
        vars.push((
            format!("{}_PORT", alias),
            format!("{}://{}:{}", proto, info.ip, port),
        ));
    }

    for (port, proto) in &info.ports {
        let proto_upper = proto.to_uppercase();
        let prefix = format!("{}_PORT_{}_{}", alias, port, proto_upper);
        vars.push((prefix.clone(), format!("{}://{}:{}", proto, info.ip, port)));
        vars.push((format!("{}_ADDR", prefix), info.ip.clone()));
        vars.push((format!("{}_PORT", prefix), port.to_string()));
        vars.push((format!("{}_PROTO", prefix), proto.clone()));
    }

    let taken: Vec<String> = vars.iter().map(|(k, _)| k.clone()).collect();
    for (key, value) in &info.env {
        let name = format!("{}_ENV_{}", alias, key);
        if !taken.contains(&name) {
            // Legacy link format carries the original pair as the value
            vars.push((name, format!("{}={}", key, value)));
        }
    }

    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_env_vars() {
        let info = ServiceInfo {
            alias: "redis-main".to_string(),
            ip: "172.18.0.2".to_string(),
            ports: vec![(6379, "tcp".to_string())],
            env: vec![("MAXMEMORY".to_string(), "64mb".to_string())],
        };

        let vars = link_env_vars(&info, "wercker-pipeline-run1");
        let get = |k: &str| {
            vars.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(
            get("REDIS_MAIN_NAME"),
            Some("/wercker-pipeline-run1/redis-main")
        );
        assert_eq!(get("REDIS_MAIN_PORT"), Some("tcp://172.18.0.2:6379"));
        assert_eq!(
            get("REDIS_MAIN_PORT_6379_TCP"),
            Some("tcp://172.18.0.2:6379")
        );
        assert_eq!(get("REDIS_MAIN_PORT_6379_TCP_ADDR"), Some("172.18.0.2"));
        assert_eq!(get("REDIS_MAIN_PORT_6379_TCP_PORT"), Some("6379"));
        assert_eq!(get("REDIS_MAIN_PORT_6379_TCP_PROTO"), Some("tcp"));
        assert_eq!(get("REDIS_MAIN_ENV_MAXMEMORY"), Some("MAXMEMORY=64mb"));
    }

    #[test]
    fn test_link_env_lowest_port_wins() {
        let info = ServiceInfo {
            alias: "db".to_string(),
            ip: "10.0.0.3".to_string(),
            ports: vec![(5432, "tcp".to_string()), (5433, "tcp".to_string())],
            env: vec![],
        };
        let vars = link_env_vars(&info, "base");
        let primary = vars
            .iter()
            .find(|(k, _)| k == "DB_PORT")
            .map(|(_, v)| v.as_str());
        assert_eq!(primary, Some("tcp://10.0.0.3:5432"));
    }
}
