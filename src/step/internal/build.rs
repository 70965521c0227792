//! `internal/docker-build`: build an image from the checked-out source

use async_trait::async_trait;
use bollard::image::BuildImageOptions;
use futures_util::StreamExt;
use tracing::info;

use super::InternalCore;
use crate::config::StepDefinition;
use crate::core::Environment;
use crate::events::LogStream;
use crate::step::{ExecContext, Step, StepContext, StepError, StepResult};

pub struct DockerBuildStep {
    core: InternalCore,
    image_name: String,
    dockerfile: String,
}

impl DockerBuildStep {
    pub fn new(definition: &StepDefinition) -> Self {
        Self {
            core: InternalCore::new("docker-build", definition),
            image_name: String::new(),
            dockerfile: String::new(),
        }
    }
}

#[async_trait]
impl Step for DockerBuildStep {
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
        self.image_name = self
            .core
            .data
            .get("image-name")
            .or_else(|| self.core.data.get("tag"))
            .cloned()
            .ok_or_else(|| {
                StepError::Config("docker-build requires an image-name".to_string())
            })?;
        self.dockerfile = self
            .core
            .data
            .get("dockerfile")
            .cloned()
            .unwrap_or_else(|| "Dockerfile".to_string());
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        // The build context is the materialized source on the host
        let source_dir = ctx.options.project_dir();
        let context_dir = match self.core.cwd.as_deref() {
            Some(cwd) => source_dir.join(cwd),
            None => source_dir,
        };

        let tar_bytes = tokio::task::spawn_blocking(move || {
            let mut builder = tar::Builder::new(Vec::new());
            builder.follow_symlinks(true);
            builder.append_dir_all(".", &context_dir)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| StepError::Other(e.to_string()))??;

        let options = BuildImageOptions {
            dockerfile: self.dockerfile.clone(),
            t: self.image_name.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = ctx.client.client().build_image(
            options,
            None,
            Some(bytes::Bytes::from(tar_bytes).into()),
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(StepError::Other(format!("Build failed: {}", error)));
                    }
                    if let Some(line) = info.stream {
                        ctx.emitter.emit_log(
                            &ctx.options.run_id,
                            "",
                            LogStream::Stdout,
                            line,
                            false,
                        );
                    }
                }
                Err(e) => {
                    return Err(StepError::Box(crate::boxes::BoxError::Docker(e)));
                }
            }
        }

        info!("Built image {}", self.image_name);
        Ok(0)
    }
}
