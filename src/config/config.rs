//! Configuration structures and loading
//!
//! The definition file (`wercker.yml`) is YAML: a top-level box and
//! services, per-pipeline sections keyed by pipeline name, and optional
//! workflows. Step entries come in three shapes (`"id"`, `{id: {k: v}}`,
//! and the legacy inline `{id, k: v}`) and are normalized here so the rest
//! of the engine only sees [`StepDefinition`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("No pipeline named {0:?} in configuration")]
    MissingPipeline(String),

    #[error("Invalid step entry: {0}")]
    InvalidStep(String),

    #[error("Invalid box entry: {0}")]
    InvalidBox(String),
}

/// Parsed definition file
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Default box for every pipeline
    #[serde(rename = "box", default)]
    pub box_entry: Option<BoxEntry>,

    /// Default services for every pipeline
    #[serde(default)]
    pub services: Vec<BoxEntry>,

    /// Per-command bound, minutes
    #[serde(rename = "command-timeout", default)]
    pub command_timeout: Option<u64>,

    /// Silence bound between reads, minutes
    #[serde(rename = "no-response-timeout", default)]
    pub no_response_timeout: Option<u64>,

    #[serde(rename = "source-dir", default)]
    pub source_dir: Option<String>,

    #[serde(rename = "ignore-file", default)]
    pub ignore_file: Option<String>,

    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,

    /// Everything else at the top level is a pipeline section
    #[serde(flatten)]
    sections: BTreeMap<String, serde_yaml::Value>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Names of all pipeline sections present
    pub fn pipeline_names(&self) -> Vec<String> {
        self.sections
            .iter()
            .filter(|(_, v)| v.is_mapping())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn has_pipeline(&self, name: &str) -> bool {
        self.sections.get(name).map(|v| v.is_mapping()).unwrap_or(false)
    }

    /// Parse the named pipeline section
    pub fn pipeline(&self, name: &str) -> Result<PipelineDefinition, ConfigError> {
        let value = self
            .sections
            .get(name)
            .ok_or_else(|| ConfigError::MissingPipeline(name.to_string()))?;
        let definition: PipelineDefinition = serde_yaml::from_value(value.clone())?;
        Ok(definition)
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.iter().find(|w| w.name == name)
    }
}

/// One pipeline section of the definition file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineDefinition {
    /// Box override for this pipeline
    #[serde(rename = "box", default)]
    pub box_entry: Option<BoxEntry>,

    #[serde(default)]
    pub services: Vec<BoxEntry>,

    #[serde(default)]
    pub steps: Vec<StepEntry>,

    #[serde(rename = "after-steps", default)]
    pub after_steps: Vec<StepEntry>,

    #[serde(rename = "base-path", default)]
    pub base_path: Option<String>,

    /// Whether the pipeline gets raw docker daemon access
    #[serde(default)]
    pub docker: bool,
}

/// A box reference: bare image string or full definition
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BoxEntry {
    Id(String),
    Definition(BoxDefinition),
}

impl BoxEntry {
    /// Normalize to a full definition
    pub fn definition(&self) -> BoxDefinition {
        match self {
            BoxEntry::Id(id) => BoxDefinition {
                id: id.clone(),
                ..Default::default()
            },
            BoxEntry::Definition(def) => def.clone(),
        }
    }
}

/// Registry credentials for a box
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthDefinition {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
}

/// Full box definition
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BoxDefinition {
    pub id: String,

    #[serde(default)]
    pub tag: Option<String>,

    /// Service alias override; defaults to the image basename
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub cmd: Option<String>,

    #[serde(default)]
    pub entrypoint: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Ports to publish, `"port"` or `"port/proto"`
    #[serde(default)]
    pub ports: Vec<String>,

    /// Extra host volumes, space-separated `src:dst` pairs
    #[serde(default)]
    pub volumes: Option<String>,

    /// Explicit registry URL
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub auth: Option<AuthDefinition>,
}

/// A step entry in one of its three YAML shapes
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StepEntry {
    Id(String),
    Map(serde_yaml::Mapping),
}

/// Normalized step configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDefinition {
    pub id: String,
    /// Display name override
    pub name: Option<String>,
    /// Working directory override inside the guest
    pub cwd: Option<String>,
    /// Checkpoint label for resume/commit
    pub checkpoint: Option<String>,
    /// Everything else, stringified
    pub data: BTreeMap<String, String>,
}

impl StepEntry {
    /// Normalize any of the three shapes to a [`StepDefinition`]
    pub fn normalize(&self) -> Result<StepDefinition, ConfigError> {
        match self {
            StepEntry::Id(id) => Ok(StepDefinition {
                id: id.trim().to_string(),
                ..Default::default()
            }),
            StepEntry::Map(map) => normalize_map(map),
        }
    }
}

fn normalize_map(map: &serde_yaml::Mapping) -> Result<StepDefinition, ConfigError> {
    // Legacy inline form carries an explicit `id` key
    if map.get("id").is_some() {
        let mut def = StepDefinition::default();
        for (key, value) in map {
            let key = key
                .as_str()
                .ok_or_else(|| ConfigError::InvalidStep("non-string key".to_string()))?;
            if key == "id" {
                def.id = scalar_to_string(value)?;
            } else {
                assign(&mut def, key, value)?;
            }
        }
        if def.id.is_empty() {
            return Err(ConfigError::InvalidStep("empty step id".to_string()));
        }
        return Ok(def);
    }

    // Modern form: a single key naming the step, mapping to its data
    if map.len() != 1 {
        return Err(ConfigError::InvalidStep(format!(
            "expected one step id key, found {}",
            map.len()
        )));
    }

    let (key, value) = map.iter().next().unwrap();
    let id = key
        .as_str()
        .ok_or_else(|| ConfigError::InvalidStep("non-string step id".to_string()))?;

    let mut def = StepDefinition {
        id: id.trim().to_string(),
        ..Default::default()
    };

    match value {
        serde_yaml::Value::Null => {}
        serde_yaml::Value::Mapping(data) => {
            for (key, value) in data {
                let key = key
                    .as_str()
                    .ok_or_else(|| ConfigError::InvalidStep("non-string key".to_string()))?;
                assign(&mut def, key, value)?;
            }
        }
        other => {
            return Err(ConfigError::InvalidStep(format!(
                "step {:?} has non-mapping value: {:?}",
                id, other
            )))
        }
    }

    Ok(def)
}

fn assign(
    def: &mut StepDefinition,
    key: &str,
    value: &serde_yaml::Value,
) -> Result<(), ConfigError> {
    let value = scalar_to_string(value)?;
    match key {
        "name" => def.name = Some(value),
        "cwd" => def.cwd = Some(value),
        "checkpoint" => def.checkpoint = Some(value),
        _ => {
            def.data.insert(key.to_string(), value);
        }
    }
    Ok(())
}

fn scalar_to_string(value: &serde_yaml::Value) -> Result<String, ConfigError> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        other => Err(ConfigError::InvalidStep(format!(
            "expected scalar, found {:?}",
            other
        ))),
    }
}

/// One workflow: a named DAG of pipeline invocations
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub pipelines: Vec<WorkflowPipelineDefinition>,
}

/// One node of a workflow DAG
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowPipelineDefinition {
    /// Node name, unique within the workflow
    pub name: String,

    /// Pipeline section to execute; defaults to the node name
    #[serde(rename = "pipelineName", alias = "pipeline-name", default)]
    pub pipeline_name: Option<String>,

    /// Upstream node names this one waits for
    #[serde(default)]
    pub requires: Vec<String>,

    /// Narrow artifact fan-in to this single upstream
    #[serde(rename = "artifactPipeline", alias = "artifact-pipeline", default)]
    pub artifact_pipeline: Option<String>,

    /// Env file loaded for this node's run
    #[serde(rename = "envFile", alias = "env-file", default)]
    pub env_file: Option<String>,
}

impl WorkflowPipelineDefinition {
    /// The pipeline section this node executes
    pub fn pipeline(&self) -> &str {
        self.pipeline_name.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
box: ubuntu:22.04
command-timeout: 25
build:
  steps:
    - script:
        name: say hi
        code: echo hi
    - install-packages:
        packages: git curl
deploy:
  box:
    id: alpine
    tag: "3.19"
  steps:
    - script:
        code: ./deploy.sh
workflows:
  - name: main
    pipelines:
      - name: build
      - name: deploy
        requires: [build]
"#;

    #[test]
    fn test_parse_basic_config() {
        let config = Config::from_str(BASIC).unwrap();
        assert!(config.has_pipeline("build"));
        assert!(config.has_pipeline("deploy"));
        assert!(!config.has_pipeline("missing"));
        assert_eq!(config.command_timeout, Some(25));

        let build = config.pipeline("build").unwrap();
        assert_eq!(build.steps.len(), 2);

        let step = build.steps[0].normalize().unwrap();
        assert_eq!(step.id, "script");
        assert_eq!(step.name.as_deref(), Some("say hi"));
        assert_eq!(step.data.get("code").map(String::as_str), Some("echo hi"));

        let deploy = config.pipeline("deploy").unwrap();
        let box_def = deploy.box_entry.unwrap().definition();
        assert_eq!(box_def.id, "alpine");
        assert_eq!(box_def.tag.as_deref(), Some("3.19"));
    }

    #[test]
    fn test_missing_pipeline_errors() {
        let config = Config::from_str(BASIC).unwrap();
        assert!(matches!(
            config.pipeline("nope"),
            Err(ConfigError::MissingPipeline(_))
        ));
    }

    #[test]
    fn test_step_forms() {
        let yaml = r#"
build:
  steps:
    - plain-id
    - script:
        code: echo one
    - id: legacy-step
      name: legacy
      cwd: sub
      flag: "true"
    - bare-mapping:
"#;
        let config = Config::from_str(yaml).unwrap();
        let build = config.pipeline("build").unwrap();
        let steps: Vec<StepDefinition> = build
            .steps
            .iter()
            .map(|s| s.normalize().unwrap())
            .collect();

        assert_eq!(steps[0].id, "plain-id");
        assert_eq!(steps[1].id, "script");
        assert_eq!(steps[2].id, "legacy-step");
        assert_eq!(steps[2].name.as_deref(), Some("legacy"));
        assert_eq!(steps[2].cwd.as_deref(), Some("sub"));
        assert_eq!(steps[2].data.get("flag").map(String::as_str), Some("true"));
        assert_eq!(steps[3].id, "bare-mapping");
    }

    #[test]
    fn test_workflow_definition() {
        let config = Config::from_str(BASIC).unwrap();
        let workflow = config.workflow("main").unwrap();
        assert_eq!(workflow.pipelines.len(), 2);
        assert_eq!(workflow.pipelines[1].requires, vec!["build"]);
        assert_eq!(workflow.pipelines[1].pipeline(), "deploy");
    }

    #[test]
    fn test_service_box_entries() {
        let yaml = r#"
build:
  services:
    - redis
    - id: postgres
      tag: "16"
      env:
        POSTGRES_PASSWORD: secret
  steps:
    - script:
        code: make test
"#;
        let config = Config::from_str(yaml).unwrap();
        let build = config.pipeline("build").unwrap();
        assert_eq!(build.services.len(), 2);
        assert_eq!(build.services[0].definition().id, "redis");
        let pg = build.services[1].definition();
        assert_eq!(pg.id, "postgres");
        assert_eq!(pg.env.get("POSTGRES_PASSWORD").map(String::as_str), Some("secret"));
    }
}
