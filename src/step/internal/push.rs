//! Image push built-ins

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::image::{CreateImageOptions, PushImageOptions, TagImageOptions};
use futures_util::StreamExt;
use tracing::{info, warn};

use super::InternalCore;
use crate::config::StepDefinition;
use crate::core::Environment;
use crate::engine::{normalize_registry, JsonMessage, PushStatusProcessor};
use crate::events::LogStream;
use crate::step::{ExecContext, Step, StepContext, StepError, StepResult};

/// Decoded configuration shared by the push variants
#[derive(Debug, Clone, Default)]
struct PushConfig {
    repository: String,
    registry: String,
    username: Option<String>,
    password: Option<String>,
    tags: Vec<String>,
    message: String,
}

impl PushConfig {
    fn decode(core: &InternalCore) -> StepResult<Self> {
        let repository = core
            .data
            .get("repository")
            .cloned()
            .unwrap_or_default();
        if repository.is_empty() {
            return Err(StepError::Config(
                "docker-push requires a repository".to_string(),
            ));
        }

        let tags: Vec<String> = core
            .data
            .get("tag")
            .map(|t| t.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        Ok(Self {
            repository,
            registry: core
                .data
                .get("registry")
                .map(|r| normalize_registry(r))
                .unwrap_or_default(),
            username: core.data.get("username").cloned(),
            password: core.data.get("password").cloned(),
            tags: if tags.is_empty() {
                vec!["latest".to_string()]
            } else {
                tags
            },
            message: core
                .data
                .get("message")
                .cloned()
                .unwrap_or_else(|| "Pushed by pipeline".to_string()),
        })
    }

    fn credentials(&self) -> Option<DockerCredentials> {
        let username = self.username.clone()?;
        Some(DockerCredentials {
            username: Some(username),
            password: self.password.clone(),
            serveraddress: if self.registry.is_empty() {
                None
            } else {
                Some(self.registry.clone())
            },
            ..Default::default()
        })
    }
}

/// Push the pushable image: tag every requested tag, stream the push,
/// and require a digest (or explicit completion) to call it a success.
async fn push_tags(
    ctx: &ExecContext,
    config: &PushConfig,
    source_reference: &str,
) -> StepResult<()> {
    let client = ctx.client.client();

    for tag in &config.tags {
        let options = TagImageOptions {
            repo: config.repository.as_str(),
            tag: tag.as_str(),
        };
        client.tag_image(source_reference, Some(options)).await
            .map_err(crate::boxes::BoxError::Docker)?;

        let push_options = PushImageOptions { tag: tag.as_str() };
        let mut stream = client.push_image(
            &config.repository,
            Some(push_options),
            config.credentials(),
        );

        let mut processor = PushStatusProcessor::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    let msg = JsonMessage::from(info);
                    match processor.process(&msg) {
                        Ok(Some(line)) => ctx.emitter.emit_log(
                            &ctx.options.run_id,
                            "",
                            LogStream::Stdout,
                            line,
                            false,
                        ),
                        Ok(None) => {}
                        Err(e) => return Err(StepError::Box(e.into())),
                    }
                }
                Err(e) => {
                    warn!("Push stream error: {}", e);
                    return Err(StepError::Box(crate::boxes::BoxError::Docker(e)));
                }
            }
        }
        ctx.emitter.emit_log(
            &ctx.options.run_id,
            "",
            LogStream::Stdout,
            processor.final_line(),
            false,
        );

        processor
            .finish_push()
            .map_err(|e| StepError::Box(e.into()))?;
        info!(
            "Pushed {}:{} ({})",
            config.repository,
            tag,
            processor.digest().unwrap_or("no digest")
        );
    }

    Ok(())
}

/// `internal/docker-push`: commit the base container and push it
pub struct DockerPushStep {
    core: InternalCore,
    config: PushConfig,
}

impl DockerPushStep {
    pub fn new(definition: &StepDefinition) -> Self {
        Self {
            core: InternalCore::new("docker-push", definition),
            config: PushConfig::default(),
        }
    }
}

#[async_trait]
impl Step for DockerPushStep {
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
        // Config errors surface here, before any container work
        self.config = PushConfig::decode(&self.core)?;
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        let first_tag = self.config.tags[0].clone();
        let reference = {
            let mut pipeline_box = ctx.pipeline_box.lock().await;
            pipeline_box
                .commit(
                    &self.config.repository,
                    &first_tag,
                    &self.config.message,
                    false,
                )
                .await?
        };

        push_tags(ctx, &self.config, &reference).await?;
        Ok(0)
    }
}

/// `internal/docker-scratch-push`: flatten the container filesystem into
/// a fresh single-layer image, then push that.
pub struct DockerScratchPushStep {
    core: InternalCore,
    config: PushConfig,
}

impl DockerScratchPushStep {
    pub fn new(definition: &StepDefinition) -> Self {
        Self {
            core: InternalCore::new("docker-scratch-push", definition),
            config: PushConfig::default(),
        }
    }
}

#[async_trait]
impl Step for DockerScratchPushStep {
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
        self.config = PushConfig::decode(&self.core)?;
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        let container_id = ctx.container_id().await?;
        let client = ctx.client.client();

        // Flatten: export the container fs and re-import it as one layer
        let mut export = client.export_container(&container_id);
        let mut rootfs = Vec::new();
        while let Some(chunk) = export.next().await {
            let chunk = chunk.map_err(crate::boxes::BoxError::Docker)?;
            rootfs.extend_from_slice(&chunk);
        }

        let first_tag = self.config.tags[0].clone();
        let options = CreateImageOptions {
            from_src: "-",
            repo: self.config.repository.as_str(),
            tag: first_tag.as_str(),
            ..Default::default()
        };
        let mut import =
            client.create_image(Some(options), Some(bytes::Bytes::from(rootfs).into()), None);
        while let Some(result) = import.next().await {
            if let Err(e) = result {
                return Err(StepError::Box(crate::boxes::BoxError::ImagePull(
                    e.to_string(),
                )));
            }
        }

        let reference = format!("{}:{}", self.config.repository, first_tag);
        push_tags(ctx, &self.config, &reference).await?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_push_config_decode() {
        let mut data = BTreeMap::new();
        data.insert("repository".to_string(), "acme/app".to_string());
        data.insert("tag".to_string(), "latest v1".to_string());
        data.insert("username".to_string(), "u".to_string());
        data.insert("password".to_string(), "p".to_string());
        let definition = StepDefinition {
            id: "internal/docker-push".to_string(),
            data,
            ..Default::default()
        };
        let core = InternalCore::new("docker-push", &definition);

        let config = PushConfig::decode(&core).unwrap();
        assert_eq!(config.repository, "acme/app");
        assert_eq!(config.tags, vec!["latest", "v1"]);
        assert!(config.credentials().is_some());
    }

    #[test]
    fn test_push_config_requires_repository() {
        let definition = StepDefinition {
            id: "internal/docker-push".to_string(),
            ..Default::default()
        };
        let core = InternalCore::new("docker-push", &definition);
        assert!(matches!(
            PushConfig::decode(&core),
            Err(StepError::Config(_))
        ));
    }
}
