//! Built-in steps
//!
//! These run inside the pipeline but talk to the docker daemon directly
//! instead of going through the shell session.

mod build;
mod publish;
mod push;
mod run_kill;
mod shell;
mod store_container;
mod watch;

pub use build::DockerBuildStep;
pub use publish::PublishStepStep;
pub use push::{DockerPushStep, DockerScratchPushStep};
pub use run_kill::{DockerKillStep, DockerRunStep};
pub use shell::ShellStep;
pub use store_container::StoreContainerStep;
pub use watch::WatchStep;

use std::collections::BTreeMap;

use super::{safe_id_for, Step, StepError, StepResult, DEFAULT_STEP_OWNER};
use crate::config::StepDefinition;
use crate::core::PipelineOptions;

/// Identity and configuration shared by every built-in
pub(crate) struct InternalCore {
    pub id: String,
    pub safe_id: String,
    pub display_name: String,
    pub cwd: Option<String>,
    pub checkpoint: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl InternalCore {
    pub fn new(name: &str, definition: &StepDefinition) -> Self {
        Self {
            id: name.to_string(),
            safe_id: safe_id_for(name),
            display_name: definition
                .name
                .clone()
                .unwrap_or_else(|| name.to_string()),
            cwd: definition.cwd.clone(),
            checkpoint: definition.checkpoint.clone(),
            data: definition.data.clone(),
        }
    }

    pub fn owner(&self) -> &str {
        DEFAULT_STEP_OWNER
    }
}

/// Construct a built-in by its name (the part after `internal/`)
pub fn from_definition(
    name: &str,
    definition: &StepDefinition,
    options: &PipelineOptions,
) -> StepResult<Box<dyn Step>> {
    match name {
        "docker-push" => Ok(Box::new(DockerPushStep::new(definition))),
        "docker-scratch-push" => Ok(Box::new(DockerScratchPushStep::new(definition))),
        "docker-build" => Ok(Box::new(DockerBuildStep::new(definition))),
        "docker-run" => Ok(Box::new(DockerRunStep::new(definition, options))),
        "docker-kill" => Ok(Box::new(DockerKillStep::new(definition, options))),
        "store-container" => Ok(Box::new(StoreContainerStep::new(definition))),
        "publish-step" => Ok(Box::new(PublishStepStep::new(definition))),
        "watch" => Ok(Box::new(WatchStep::new(definition))),
        "shell" => Ok(Box::new(ShellStep::new(definition))),
        other => Err(StepError::Config(format!(
            "Unknown internal step: internal/{}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_known_and_unknown() {
        let options = PipelineOptions::default();
        let definition = StepDefinition {
            id: "internal/docker-push".to_string(),
            ..Default::default()
        };
        let step = from_definition("docker-push", &definition, &options).unwrap();
        assert_eq!(step.owner(), "wercker");

        let err = from_definition("no-such-thing", &definition, &options).unwrap_err();
        assert!(matches!(err, StepError::Config(_)));
    }
}
