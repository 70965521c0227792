//! Steps: the units of work a pipeline executes
//!
//! A step moves through fetch -> init_env -> execute -> collect, with a
//! best-effort clean at the end. External steps (inline scripts and
//! registry packages) run through the shell session; internal steps are
//! built-ins that talk to the docker daemon directly.

pub mod external;
pub mod internal;
pub mod registry;

pub use external::ExternalStep;
pub use registry::{RegistryError, StepRegistry};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::artifact::{Artifact, Artificer, CollectError, Store, StoreError};
use crate::boxes::{BoxError, PipelineBox};
use crate::core::{Environment, PipelineOptions};
use crate::engine::DockerClient;
use crate::events::Emitter;
use crate::session::{Session, SessionError};

/// Runner version reported for synthesized script steps
pub const RUNNER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum StepError {
    #[error("Step fetch failed: {0}")]
    Fetch(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Invalid step configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Box(#[from] BoxError),

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type StepResult<T> = Result<T, StepError>;

/// Parsed step identifier.
///
/// Accepted forms: `name`, `owner/name`, `owner/name@version`, each
/// optionally followed by a whitespace-separated quoted url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepId {
    pub owner: String,
    pub name: String,
    pub version: String,
    pub url: Option<String>,
}

/// Default owner for unqualified step names
pub const DEFAULT_STEP_OWNER: &str = "wercker";

/// Version wildcard used when none is pinned
pub const ANY_VERSION: &str = "*";

pub fn parse_step_id(raw: &str) -> StepId {
    let raw = raw.trim();

    // Optional trailing quoted url
    let (spec, url) = match raw.find('"') {
        Some(idx) => {
            let url = raw[idx..].trim().trim_matches('"').to_string();
            (raw[..idx].trim(), Some(url).filter(|u| !u.is_empty()))
        }
        None => (raw, None),
    };

    let (ownername, version) = match spec.split_once('@') {
        Some((head, version)) => (head, version.to_string()),
        None => (spec, ANY_VERSION.to_string()),
    };

    let (owner, name) = match ownername.split_once('/') {
        Some((owner, name)) => (owner.to_string(), name.to_string()),
        None => (DEFAULT_STEP_OWNER.to_string(), ownername.to_string()),
    };

    StepId {
        owner,
        name,
        version,
        url,
    }
}

/// Unique-per-process step directory name: the id plus random suffix
pub fn safe_id_for(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("{}-{}", sanitized, suffix)
}

/// Everything a step needs while fetching and preparing
pub struct StepContext {
    pub options: PipelineOptions,
    pub registry: StepRegistry,
}

/// Everything a step needs while executing
pub struct ExecContext {
    pub options: PipelineOptions,
    pub session: Arc<Session>,
    pub client: DockerClient,
    pub emitter: Emitter,
    pub pipeline_box: Arc<Mutex<PipelineBox>>,
    pub artificer: Arc<Artificer>,
    pub store: Option<Arc<dyn Store>>,
    /// Pipeline environment at execution time
    pub env: Environment,
}

impl ExecContext {
    /// The base container's id
    pub async fn container_id(&self) -> StepResult<String> {
        self.pipeline_box
            .lock()
            .await
            .container_id()
            .map(|id| id.to_string())
            .ok_or_else(|| StepError::Other("No running container".to_string()))
    }
}

/// Result of running one step
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub exit_code: i32,
    /// Contents of the step's message file, when it wrote one
    pub message: String,
    pub artifact: Option<Artifact>,
}

impl StepOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One unit of work in a pipeline
#[async_trait]
pub trait Step: Send + Sync {
    fn display_name(&self) -> &str;
    fn id(&self) -> &str;
    fn owner(&self) -> &str;
    fn safe_id(&self) -> &str;

    fn cwd(&self) -> Option<&str> {
        None
    }

    fn checkpoint(&self) -> Option<&str> {
        None
    }

    /// Whether the runner should sync the container env back before
    /// executing this step
    fn should_sync_env(&self) -> bool {
        false
    }

    /// Materialize the step into its per-run host directory
    async fn fetch(&mut self, ctx: &StepContext) -> StepResult<()>;

    /// Populate `WERCKER_STEP_*` and property defaults
    fn init_env(&mut self, ctx: &StepContext, env: &mut Environment) -> StepResult<()>;

    /// Run inside the existing session; returns the exit code
    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32>;

    /// Capture the report message and (optionally) the step artifact
    async fn collect(&self, ctx: &ExecContext, outcome: &mut StepOutcome) -> StepResult<()> {
        let _ = (ctx, outcome);
        Ok(())
    }

    /// Best-effort cleanup of per-step state
    async fn clean(&self, ctx: &StepContext) {
        let _ = ctx;
    }
}

impl std::fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("id", &self.id()).finish()
    }
}

/// Build a step from its normalized configuration
pub fn from_definition(
    definition: &crate::config::StepDefinition,
    options: &PipelineOptions,
) -> StepResult<std::boxed::Box<dyn Step>> {
    if let Some(rest) = definition.id.strip_prefix("internal/") {
        return internal::from_definition(rest, definition, options);
    }
    Ok(std::boxed::Box::new(ExternalStep::from_definition(
        definition, options,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step_id_forms() {
        assert_eq!(
            parse_step_id("script"),
            StepId {
                owner: "wercker".to_string(),
                name: "script".to_string(),
                version: "*".to_string(),
                url: None,
            }
        );
        assert_eq!(
            parse_step_id("acme/deploy"),
            StepId {
                owner: "acme".to_string(),
                name: "deploy".to_string(),
                version: "*".to_string(),
                url: None,
            }
        );
        assert_eq!(
            parse_step_id("acme/deploy@1.2.3"),
            StepId {
                owner: "acme".to_string(),
                name: "deploy".to_string(),
                version: "1.2.3".to_string(),
                url: None,
            }
        );
        assert_eq!(
            parse_step_id("acme/deploy@1.0 \"file:///tmp/step\""),
            StepId {
                owner: "acme".to_string(),
                name: "deploy".to_string(),
                version: "1.0".to_string(),
                url: Some("file:///tmp/step".to_string()),
            }
        );
    }

    #[test]
    fn test_safe_id_is_unique_and_clean() {
        let a = safe_id_for("my step!");
        let b = safe_id_for("my step!");
        assert_ne!(a, b);
        assert!(a.starts_with("my-step--"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
