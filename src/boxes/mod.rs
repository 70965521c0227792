//! The base container and everything attached to it
//!
//! A `PipelineBox` owns the run's base container, its service containers,
//! the per-run docker network, and the volume layout. Lifecycle is
//! fetch -> run -> stop -> clean; clean runs unconditionally on shutdown.

pub mod network;
pub mod rdd;
mod run;
pub mod service;

pub use network::{ensure_network, remove_network, RunNetwork};
pub use rdd::{DaemonProvisioner, StaticProvisioner};
pub use service::{link_env_vars, ServiceBox, ServiceInfo};

use bollard::container::{
    Config, RemoveContainerOptions, RestartContainerOptions,
    StopContainerOptions,
};
use bollard::image::{CommitContainerOptions, CreateImageOptions, RemoveImageOptions};
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BoxDefinition;
use crate::core::{Environment, PipelineOptions};
use crate::engine::docker::is_not_found;
use crate::engine::status::StatusError;
use crate::engine::{normalize_repo, split_repo_tag, DockerClient, JsonMessage, PullStatusProcessor};
use crate::events::{Emitter, LogStream};

#[derive(Debug, Error)]
pub enum BoxError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Image pull failed: {0}")]
    ImagePull(String),

    #[error("Image {0} not found locally")]
    ImageNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid box configuration: {0}")]
    Config(String),

    #[error("Container create failed: {0}")]
    Create(String),

    #[error("Remote daemon error: {0}")]
    RemoteDaemon(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Status(#[from] StatusError),
}

pub type BoxResult<T> = Result<T, BoxError>;

/// The base container for one pipeline run
pub struct PipelineBox {
    pub options: PipelineOptions,
    pub config: BoxDefinition,

    client: DockerClient,
    emitter: Emitter,

    pub repository: String,
    pub tag: String,
    pub registry: String,

    /// Recorded after fetch
    image_digest: Option<String>,

    container_id: Option<String>,
    container_name: String,

    pub services: Vec<ServiceBox>,
    network: Option<RunNetwork>,

    /// Hand the daemon socket into the pipeline container
    pub(crate) mount_docker_socket: bool,

    /// Checkpoint images to delete during clean
    images_to_remove: Vec<String>,
}

impl PipelineBox {
    /// Normalize the box reference; never pulls.
    pub fn new(
        options: &PipelineOptions,
        config: BoxDefinition,
        services: Vec<BoxDefinition>,
        client: DockerClient,
        emitter: Emitter,
    ) -> Self {
        let (repository, mut tag) = split_repo_tag(&config.id, "latest");
        if let Some(explicit) = &config.tag {
            tag = explicit.clone();
        }
        // A checkpoint resume points the box at the committed image
        if !options.checkpoint.is_empty() && options.enable_dev_steps {
            tag = format!("w-{}", options.checkpoint);
        }

        let container_name = format!("wercker-pipeline-{}", options.run_id);

        let services = services
            .into_iter()
            .map(|def| ServiceBox::new(options, def, client.clone(), emitter.clone()))
            .collect();

        Self {
            options: options.clone(),
            config,
            client,
            emitter,
            repository,
            tag,
            registry: String::new(),
            image_digest: None,
            container_id: None,
            container_name,
            services,
            network: None,
            mount_docker_socket: false,
            images_to_remove: Vec::new(),
        }
    }

    /// Bind-mount the daemon's unix socket into the pipeline container.
    /// Only meaningful when the daemon is reachable over a local socket.
    pub fn mount_docker_socket(&mut self) {
        self.mount_docker_socket = true;
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn client(&self) -> &DockerClient {
        &self.client
    }

    pub fn network(&self) -> Option<&RunNetwork> {
        self.network.as_ref()
    }

    pub fn image_digest(&self) -> Option<&str> {
        self.image_digest.as_deref()
    }

    /// The full image reference this box runs
    pub fn image_reference(&self, env: &Environment) -> String {
        format!("{}:{}", env.interpolate(&self.repository), self.tag)
    }

    /// Point the box (and its services) at a different daemon.
    ///
    /// Used after remote-daemon provisioning; must happen before `run`.
    pub fn set_client(&mut self, client: DockerClient) {
        for service in &mut self.services {
            *service = ServiceBox::new(
                &self.options,
                service.config.clone(),
                client.clone(),
                self.emitter.clone(),
            );
        }
        self.client = client;
    }

    /// Resolve the image: registry inference, then local inspect or pull
    /// with progress streaming. Records the effective digest.
    pub async fn fetch(&mut self, env: &Environment) -> BoxResult<String> {
        let repository = env.interpolate(&self.repository);
        let reference = format!("{}:{}", repository, self.tag);

        let configured_registry = self
            .config
            .url
            .clone()
            .or_else(|| self.config.auth.as_ref().and_then(|a| a.registry.clone()))
            .unwrap_or_default();
        let inferred = normalize_repo(&repository, &configured_registry);
        self.registry = inferred.registry.clone();

        if self.options.local_only {
            let inspected = self
                .client
                .client()
                .inspect_image(&reference)
                .await
                .map_err(|e| {
                    if is_not_found(&e) {
                        BoxError::ImageNotFound(reference.clone())
                    } else {
                        BoxError::Docker(e)
                    }
                })?;
            self.image_digest = inspected.id.clone();
            return Ok(reference);
        }

        let credentials = crate::engine::auth::credentials_for(&self.config, &inferred.registry);

        let options = CreateImageOptions {
            from_image: reference.clone(),
            ..Default::default()
        };
        let mut stream = self
            .client
            .client()
            .create_image(Some(options), None, credentials);

        let mut processor = PullStatusProcessor::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    let msg = JsonMessage::from(info);
                    if let Some(line) = processor.process(&msg)? {
                        self.emitter.emit_log(
                            &self.options.run_id,
                            "",
                            LogStream::Stdout,
                            line,
                            false,
                        );
                    }
                }
                Err(e) => return Err(BoxError::ImagePull(e.to_string())),
            }
        }
        self.emitter.emit_log(
            &self.options.run_id,
            "",
            LogStream::Stdout,
            processor.final_line(),
            false,
        );

        let inspected = self.client.client().inspect_image(&reference).await?;
        self.image_digest = inspected.id.clone();
        info!(
            "Fetched {} ({})",
            reference,
            self.image_digest.as_deref().unwrap_or("unknown digest")
        );

        Ok(reference)
    }

    /// Pull every service image
    pub async fn fetch_services(&self, env: &Environment) -> BoxResult<()> {
        for service in &self.services {
            service.fetch(env).await?;
        }
        Ok(())
    }

    /// Commit the base container as `repository:tag`.
    ///
    /// When `cleanup` is set the image is deleted during clean
    /// (checkpoint commits); otherwise it outlives the run.
    pub async fn commit(
        &mut self,
        repository: &str,
        tag: &str,
        message: &str,
        cleanup: bool,
    ) -> BoxResult<String> {
        let container_id = self
            .container_id
            .clone()
            .ok_or_else(|| BoxError::Create("No container to commit".to_string()))?;

        let options = CommitContainerOptions {
            container: container_id,
            repo: repository.to_string(),
            tag: tag.to_string(),
            comment: message.to_string(),
            pause: true,
            ..Default::default()
        };

        let config = Config::<String>::default();
        self.client.client().commit_container(options, config).await?;

        let reference = format!("{}:{}", repository, tag);
        info!("Committed container as {}", reference);
        if cleanup {
            self.images_to_remove.push(reference.clone());
        }
        Ok(reference)
    }

    /// Graceful 1-second stop: services first, then the base container
    pub async fn stop(&self) {
        for service in &self.services {
            service.stop().await;
        }

        if self.container_id.is_some() {
            let options = StopContainerOptions { t: 1 };
            if let Err(e) = self
                .client
                .client()
                .stop_container(&self.container_name, Some(options))
                .await
            {
                if !is_not_found(&e) {
                    warn!("Failed to stop {}: {}", self.container_name, e);
                }
            }
        }
    }

    /// Restart the base container for after-steps
    pub async fn restart(&self) -> BoxResult<()> {
        let options = RestartContainerOptions { t: 1 };
        self.client
            .client()
            .restart_container(&self.container_name, Some(options))
            .await?;
        debug!("Restarted {}", self.container_name);
        Ok(())
    }

    /// Remove everything this run created: containers (with volumes),
    /// checkpoint images, and the run network.
    pub async fn clean(&self) {
        for service in &self.services {
            service.clean().await;
        }

        if self.container_id.is_some() && self.options.should_remove {
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
                Ok(()) => debug!("Removed container {}", self.container_name),
                Err(e) if is_not_found(&e) => {}
                Err(e) => warn!("Failed to remove {}: {}", self.container_name, e),
            }
        }

        for image in &self.images_to_remove {
            let options = RemoveImageOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = self
                .client
                .client()
                .remove_image(image, Some(options), None)
                .await
            {
                if !is_not_found(&e) {
                    warn!("Failed to remove image {}: {}", image, e);
                }
            }
        }

        if let Some(network) = &self.network {
            if let Err(e) = remove_network(&self.client, network).await {
                warn!("Failed to remove network {}: {}", network.name, e);
            }
        }
    }
}
