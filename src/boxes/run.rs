//! Booting the base container: network, services, binds, create, start

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, NetworkingConfig, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use tracing::{debug, info, warn};

use super::network::ensure_network;
use super::service::link_env_vars;
use super::{BoxError, BoxResult, PipelineBox};
use crate::core::Environment;
use crate::engine::docker::is_not_found;

/// Create retries while the daemon still reports the image missing
const CREATE_ATTEMPTS: u32 = 10;
const CREATE_BACKOFF_MS: u64 = 500;

/// Share of the memory limit the base container gets
const BASE_MEMORY_SHARE: f64 = 0.75;

impl PipelineBox {
    /// Boot the run: network up, services first, then the base container.
    /// Returns the base container id.
    pub async fn run(&mut self, env: &Environment) -> BoxResult<String> {
        let network = ensure_network(&self.client, &self.options.network_name).await?;

        let total_memory = self.options.memory_mb * 1024 * 1024;
        let service_count = self.services.len() as u64;
        let service_memory = if total_memory > 0 && service_count > 0 {
            ((total_memory as f64 * (1.0 - BASE_MEMORY_SHARE)) / service_count as f64) as u64
        } else {
            0
        };
        let base_memory = if total_memory > 0 {
            (total_memory as f64 * BASE_MEMORY_SHARE) as u64
        } else {
            0
        };

        // Services go first so their addresses can be linked in
        let mut link_vars: Vec<(String, String)> = Vec::new();
        let container_name = self.container_name.clone();
        for service in &mut self.services {
            let info = service.run(env, &network, service_memory).await?;
            link_vars.extend(link_env_vars(&info, &container_name));
        }

        let mut env_vars: Vec<String> = env
            .all()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env_vars.extend(link_vars.iter().map(|(k, v)| format!("{}={}", k, v)));

        let binds = if self.client.is_local_socket() {
            self.compute_binds()
        } else {
            // Remote daemons cannot see this host; content is copied in
            Vec::new()
        };

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        if self.options.expose_ports {
            for port in &self.config.ports {
                let key = if port.contains('/') {
                    port.clone()
                } else {
                    format!("{}/tcp", port)
                };
                exposed_ports.insert(key.clone(), HashMap::new());
                let host_port = key.split('/').next().unwrap_or(&key).to_string();
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(host_port),
                    }]),
                );
            }
        }

        let mut endpoints = HashMap::new();
        endpoints.insert(network.name.clone(), EndpointSettings::default());

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            memory: if base_memory > 0 {
                Some(base_memory as i64)
            } else {
                None
            },
            memory_swap: if base_memory > 0 {
                Some((base_memory * 2) as i64)
            } else {
                None
            },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: Some(network.name.clone()),
            ..Default::default()
        };

        let cmd = match &self.config.cmd {
            Some(cmd) => shell_words::split(cmd)
                .map_err(|e| BoxError::Config(format!("Invalid cmd: {}", e)))?,
            None => vec!["/bin/bash".to_string()],
        };
        let entrypoint = self
            .config
            .entrypoint
            .as_ref()
            .map(|e| shell_words::split(e))
            .transpose()
            .map_err(|e| BoxError::Config(format!("Invalid entrypoint: {}", e)))?;

        let image = self.image_reference(env);
        let config = Config {
            image: Some(image.clone()),
            cmd: Some(cmd),
            entrypoint,
            env: Some(env_vars),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(false),
            tty: Some(false),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        let container_id = self.create_with_retry(&image, config).await?;
        self.container_id = Some(container_id.clone());
        self.network = Some(network);

        self.client
            .client()
            .start_container(&self.container_name, None::<StartContainerOptions<String>>)
            .await?;
        info!("Started base container {} ({})", self.container_name, image);

        Ok(container_id)
    }

    /// The daemon may briefly report "no such image" right after a pull;
    /// retry with a growing backoff.
    async fn create_with_retry(&self, image: &str, config: Config<String>) -> BoxResult<String> {
        let mut last = String::new();
        for attempt in 1..=CREATE_ATTEMPTS {
            let options = CreateContainerOptions {
                name: self.container_name.as_str(),
                platform: None,
            };
            match self
                .client
                .client()
                .create_container(Some(options), config.clone())
                .await
            {
                Ok(response) => return Ok(response.id),
                Err(e) if is_not_found(&e) => {
                    debug!(
                        "Image {} not visible yet (attempt {}/{})",
                        image, attempt, CREATE_ATTEMPTS
                    );
                    last = e.to_string();
                    tokio::time::sleep(std::time::Duration::from_millis(
                        CREATE_BACKOFF_MS * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(BoxError::Docker(e)),
            }
        }
        Err(BoxError::Create(format!(
            "Gave up creating container after {} attempts: {}",
            CREATE_ATTEMPTS, last
        )))
    }

    /// Host binds for a local daemon
    fn compute_binds(&self) -> Vec<String> {
        let mut binds = Vec::new();
        let build_dir = self.options.host_path(&[]);
        let cache_dir = self.options.cache_path();

        if self.options.direct_mount {
            // The caller's checkout is the guest source, read-write
            binds.push(format!(
                "{}:{}:rw",
                self.options.project_path.display(),
                self.options.guest_path(&["source"])
            ));
            binds.push(format!(
                "{}:{}:rw",
                cache_dir.display(),
                self.options.guest_path(&["cache"])
            ));
        } else {
            binds.push(format!(
                "{}:{}:ro",
                build_dir.display(),
                self.options.mnt_path(&["build"])
            ));
            binds.push(format!(
                "{}:{}:ro",
                cache_dir.display(),
                self.options.mnt_path(&["cache"])
            ));
        }

        if let Some(volumes) = &self.config.volumes {
            for pair in volumes.split_whitespace() {
                binds.push(format!("{}:rw", pair));
            }
        }

        if self.mount_docker_socket {
            if let Some(bind) = self.socket_bind() {
                binds.push(bind);
            }
        }

        binds
    }

    /// Additional bind for a provisioned daemon reachable over a local
    /// unix socket: the socket is handed into the pipeline container.
    pub fn socket_bind(&self) -> Option<String> {
        self.client
            .socket_path()
            .map(|path| format!("{}:/var/run/docker.sock:rw", path))
    }

    /// Copy host directories into the container at the staging root.
    ///
    /// Used when the daemon is remote and binds are impossible; symlinks
    /// are resolved host-side so the stream is self-contained.
    pub async fn copy_to_guest(&self, host_dirs: &[std::path::PathBuf]) -> BoxResult<()> {
        for dir in host_dirs {
            if !dir.exists() {
                warn!("Skipping missing directory {}", dir.display());
                continue;
            }

            let dir = dir.clone();
            let tar_bytes = tokio::task::spawn_blocking(move || {
                crate::fsutil::tar_dir_resolving_symlinks(&dir, Vec::new())
            })
            .await
            .map_err(|e| BoxError::Create(e.to_string()))?
            .map_err(|e| BoxError::Create(e.to_string()))?;

            let options = UploadToContainerOptions {
                path: self.options.mnt_root.clone(),
                ..Default::default()
            };

            self.client
                .client()
                .upload_to_container(
                    &self.container_name,
                    Some(options),
                    bytes::Bytes::from(tar_bytes).into(),
                )
                .await?;
        }
        debug!("Copied {} directories into {}", host_dirs.len(), self.options.mnt_root);
        Ok(())
    }
}
