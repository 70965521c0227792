//! `internal/publish-step`: package a step directory for distribution

use async_trait::async_trait;
use tracing::info;

use super::InternalCore;
use crate::artifact::PutRequest;
use crate::config::StepDefinition;
use crate::core::Environment;
use crate::step::registry::StepManifest;
use crate::step::{ExecContext, Step, StepContext, StepError, StepResult};

pub struct PublishStepStep {
    core: InternalCore,
    step_dir: String,
}

impl PublishStepStep {
    pub fn new(definition: &StepDefinition) -> Self {
        Self {
            core: InternalCore::new("publish-step", definition),
            step_dir: String::new(),
        }
    }
}

#[async_trait]
impl Step for PublishStepStep {
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
        self.step_dir = self
            .core
            .data
            .get("path")
            .cloned()
            .unwrap_or_else(|| ".".to_string());
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        let source = ctx.options.project_dir().join(&self.step_dir);
        if !source.is_dir() {
            return Err(StepError::Config(format!(
                "step directory {} does not exist",
                source.display()
            )));
        }

        let manifest = StepManifest::load(&source)?.ok_or_else(|| {
            StepError::Config("publish-step requires a step.yml".to_string())
        })?;
        let name = manifest
            .name
            .clone()
            .ok_or_else(|| StepError::Config("step.yml must declare a name".to_string()))?;
        let version = manifest
            .version
            .clone()
            .unwrap_or_else(|| "0.0.0".to_string());

        let tar_path = ctx
            .options
            .host_path(&[&self.core.safe_id])
            .join(format!("{}-{}.tar.gz", name, version));
        if let Some(parent) = tar_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let source_clone = source.clone();
        let tar_clone = tar_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            let file = std::fs::File::create(&tar_clone)?;
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(true);
            builder.append_dir_all(".", &source_clone)?;
            builder.into_inner()?.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| StepError::Other(e.to_string()))??;

        let store = ctx.store.as_ref().ok_or_else(|| {
            StepError::Config("publish-step requires a configured store".to_string())
        })?;

        let meta = std::collections::HashMap::new();
        store
            .put(PutRequest {
                path: &tar_path,
                key: format!("steps/{}/{}/{}.tar.gz", self.core.owner(), name, version),
                content_type: "application/gzip".to_string(),
                meta: &meta,
                max_tries: 3,
            })
            .await?;

        info!("Published step {}@{}", name, version);
        Ok(0)
    }
}
