//! `internal/docker-run` and `internal/docker-kill`: auxiliary containers
//! managed from within a pipeline

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{EndpointSettings, HostConfig};
use tracing::{info, warn};

use super::InternalCore;
use crate::config::StepDefinition;
use crate::core::{Environment, PipelineOptions};
use crate::engine::docker::is_not_found;
use crate::step::{ExecContext, Step, StepContext, StepError, StepResult};

/// Container name for a run/kill pair within one run
fn aux_container_name(options: &PipelineOptions, name: &str) -> String {
    format!("wercker-run-{}-{}", name, options.run_id)
}

pub struct DockerRunStep {
    core: InternalCore,
    container_name: String,
    image: String,
}

impl DockerRunStep {
    pub fn new(definition: &StepDefinition, options: &PipelineOptions) -> Self {
        let core = InternalCore::new("docker-run", definition);
        let name = core
            .data
            .get("name")
            .cloned()
            .unwrap_or_else(|| "aux".to_string());
        Self {
            container_name: aux_container_name(options, &name),
            core,
            image: String::new(),
        }
    }
}

#[async_trait]
impl Step for DockerRunStep {
    fn display_name(&self) -> &str {
        &self.core.display_name
    }

    fn id(&self) -> &str {
        &self.core.id
    }

    fn owner(&self) -> &str {
        self.core.owner()
    }

    fn safe_id(&self) -> &str {
        &self.core.safe_id
    }

    fn checkpoint(&self) -> Option<&str> {
        self.core.checkpoint.as_deref()
    }

    async fn fetch(&mut self, _ctx: &StepContext) -> StepResult<()> {
        Ok(())
    }

    fn init_env(&mut self, _ctx: &StepContext, _env: &mut Environment) -> StepResult<()> {
        self.image = self
            .core
            .data
            .get("image")
            .cloned()
            .ok_or_else(|| StepError::Config("docker-run requires an image".to_string()))?;
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        let network_name = {
            let pipeline_box = ctx.pipeline_box.lock().await;
            pipeline_box.network().map(|n| n.name.clone())
        };

        let env_vars: Vec<String> = self
            .core
            .data
            .get("env")
            .map(|e| e.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        let cmd = self
            .core
            .data
            .get("cmd")
            .map(|c| shell_words::split(c))
            .transpose()
            .map_err(|e| StepError::Config(format!("Invalid cmd: {}", e)))?;
        let entrypoint = self
            .core
            .data
            .get("entrypoint")
            .map(|c| shell_words::split(c))
            .transpose()
            .map_err(|e| StepError::Config(format!("Invalid entrypoint: {}", e)))?;

        let networking_config = network_name.as_ref().map(|name| {
            let mut endpoints = HashMap::new();
            endpoints.insert(name.clone(), EndpointSettings::default());
            NetworkingConfig {
                endpoints_config: endpoints,
            }
        });

        let config = Config {
            image: Some(self.image.clone()),
            env: Some(env_vars),
            cmd,
            entrypoint,
            host_config: Some(HostConfig {
                network_mode: network_name,
                ..Default::default()
            }),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: self.container_name.as_str(),
            platform: None,
        };
        ctx.client
            .client()
            .create_container(Some(options), config)
            .await
            .map_err(crate::boxes::BoxError::Docker)?;

        ctx.client
            .client()
            .start_container(&self.container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(crate::boxes::BoxError::Docker)?;

        info!("Started auxiliary container {}", self.container_name);
        Ok(0)
    }
}

pub struct DockerKillStep {
    core: InternalCore,
    container_name: String,
}

impl DockerKillStep {
    pub fn new(definition: &StepDefinition, options: &PipelineOptions) -> Self {
        let core = InternalCore::new("docker-kill", definition);
        let name = core
            .data
            .get("name")
            .cloned()
            .unwrap_or_else(|| "aux".to_string());
        Self {
            container_name: aux_container_name(options, &name),
            core,
        }
    }
}

#[async_trait]
impl Step for DockerKillStep {
    fn display_name(&self) -> &str {
        &self.core.display_name
    }

    fn id(&self) -> &str {
        &self.core.id
    }

    fn owner(&self) -> &str {
        self.core.owner()
    }

    fn safe_id(&self) -> &str {
        &self.core.safe_id
    }

    fn checkpoint(&self) -> Option<&str> {
        self.core.checkpoint.as_deref()
    }

    async fn fetch(&mut self, _ctx: &StepContext) -> StepResult<()> {
        Ok(())
    }

    fn init_env(&mut self, _ctx: &StepContext, _env: &mut Environment) -> StepResult<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        let client = ctx.client.client();

        let kill = KillContainerOptions { signal: "SIGKILL" };
        if let Err(e) = client
            .kill_container(&self.container_name, Some(kill))
            .await
        {
            if !is_not_found(&e) {
                warn!("Failed to kill {}: {}", self.container_name, e);
            }
        }

        let remove = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match client
            .remove_container(&self.container_name, Some(remove))
            .await
        {
            Ok(()) => info!("Removed auxiliary container {}", self.container_name),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(StepError::Box(crate::boxes::BoxError::Docker(e))),
        }

        Ok(0)
    }
}
