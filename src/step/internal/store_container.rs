//! `internal/store-container`: commit the box and archive the image

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::InternalCore;
use crate::artifact::PutRequest;
use crate::config::StepDefinition;
use crate::core::Environment;
use crate::step::{ExecContext, Step, StepContext, StepError, StepResult};

pub struct StoreContainerStep {
    core: InternalCore,
    repository: String,
}

impl StoreContainerStep {
    pub fn new(definition: &StepDefinition) -> Self {
        Self {
            core: InternalCore::new("store-container", definition),
            repository: String::new(),
        }
    }
}

#[async_trait]
impl Step for StoreContainerStep {
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

    fn init_env(&mut self, ctx: &StepContext, _env: &mut Environment) -> StepResult<()> {
        self.repository = self
            .core
            .data
            .get("repository")
            .cloned()
            .unwrap_or_else(|| format!("run-{}", ctx.options.run_id));
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        let reference = {
            let mut pipeline_box = ctx.pipeline_box.lock().await;
            pipeline_box
                .commit(&self.repository, "latest", "Stored container image", true)
                .await?
        };

        // Export the committed image to the shared containers dir
        let tar_path = ctx
            .options
            .container_path()
            .join(format!("{}.tar", ctx.options.run_id));
        if let Some(parent) = tar_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut stream = ctx.client.client().export_image(&reference);
        let mut file = tokio::fs::File::create(&tar_path).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(crate::boxes::BoxError::Docker)?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        info!("Exported container image to {}", tar_path.display());

        if let Some(store) = &ctx.store {
            let meta = std::collections::HashMap::new();
            store
                .put(PutRequest {
                    path: &tar_path,
                    key: format!(
                        "containers/{}/{}.tar",
                        ctx.options.application_id, ctx.options.run_id
                    ),
                    content_type: "application/x-tar".to_string(),
                    meta: &meta,
                    max_tries: 3,
                })
                .await
                .map_err(StepError::Store)?;
        }

        Ok(0)
    }
}
