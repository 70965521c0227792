//! Workflow driver: pipelines chained into a DAG by artifact handoff

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, WorkflowDefinition, WorkflowPipelineDefinition};
use crate::core::{PipelineKind, PipelineOptions};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow has duplicate pipeline name {0:?}")]
    DuplicateName(String),

    #[error("Workflow pipeline {node:?} references unknown pipeline {pipeline:?}")]
    UnknownPipeline { node: String, pipeline: String },

    #[error("Workflow pipeline {node:?} requires unknown pipeline {requirement:?}")]
    UnknownRequirement { node: String, requirement: String },

    #[error("Workflow has no root pipeline (every pipeline has requirements)")]
    NoRoot,

    #[error("Workflow has multiple root pipelines: {0:?}")]
    MultipleRoots(Vec<String>),

    #[error("Workflow has a cycle: {0}")]
    Cycle(String),

    #[error("Output directory missing for pipeline {pipeline:?}: {path}")]
    MissingOutput { pipeline: String, path: String },

    #[error("Pipeline {0:?} failed")]
    PipelineFailed(String),

    #[error("{0}")]
    Other(String),
}

/// Validate a workflow against the configuration: unique names, resolvable
/// references, exactly one root, and no cycles.
pub fn validate(workflow: &WorkflowDefinition, config: &Config) -> Result<(), WorkflowError> {
    let mut seen = Vec::new();
    for node in &workflow.pipelines {
        if seen.contains(&node.name) {
            return Err(WorkflowError::DuplicateName(node.name.clone()));
        }
        seen.push(node.name.clone());
    }

    for node in &workflow.pipelines {
        if !config.has_pipeline(node.pipeline()) {
            return Err(WorkflowError::UnknownPipeline {
                node: node.name.clone(),
                pipeline: node.pipeline().to_string(),
            });
        }
        for requirement in &node.requires {
            if !seen.contains(requirement) {
                return Err(WorkflowError::UnknownRequirement {
                    node: node.name.clone(),
                    requirement: requirement.clone(),
                });
            }
        }
    }

    let roots: Vec<String> = workflow
        .pipelines
        .iter()
        .filter(|n| n.requires.is_empty())
        .map(|n| n.name.clone())
        .collect();
    match roots.len() {
        0 => return Err(WorkflowError::NoRoot),
        1 => {}
        _ => return Err(WorkflowError::MultipleRoots(roots)),
    }

    detect_cycles(workflow)?;
    Ok(())
}

/// DFS along `requires` edges; a back edge yields the `A -> B -> A` text
fn detect_cycles(workflow: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let by_name: HashMap<&str, &WorkflowPipelineDefinition> = workflow
        .pipelines
        .iter()
        .map(|n| (n.name.as_str(), n))
        .collect();

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a WorkflowPipelineDefinition>,
        stack: &mut Vec<&'a str>,
        finished: &mut Vec<&'a str>,
    ) -> Result<(), WorkflowError> {
        if finished.contains(&name) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|n| *n == name) {
            let mut path: Vec<&str> = stack[pos..].to_vec();
            path.push(name);
            return Err(WorkflowError::Cycle(path.join(" -> ")));
        }

        stack.push(name);
        if let Some(node) = by_name.get(name) {
            for requirement in &node.requires {
                visit(requirement, by_name, stack, finished)?;
            }
        }
        stack.pop();
        finished.push(name);
        Ok(())
    }

    let mut finished = Vec::new();
    for node in &workflow.pipelines {
        let mut stack = Vec::new();
        visit(&node.name, &by_name, &mut stack, &mut finished)?;
    }
    Ok(())
}

/// Executes one pipeline run; the workflow driver stays agnostic of how
#[async_trait]
pub trait PipelineExecutor: Send {
    /// Run a pipeline with these options; returns its run id
    async fn run(&mut self, options: PipelineOptions) -> Result<String, WorkflowError>;
}

/// Drive a validated workflow to completion.
///
/// Pipelines start as soon as everything they require has a recorded run
/// id; each node runs exactly once, fed by its upstreams' output dirs.
pub async fn execute<E: PipelineExecutor>(
    workflow: &WorkflowDefinition,
    base_options: &PipelineOptions,
    executor: &mut E,
) -> Result<HashMap<String, String>, WorkflowError> {
    let mut run_map: HashMap<String, String> = HashMap::new();

    loop {
        let next = workflow.pipelines.iter().find(|node| {
            !run_map.contains_key(&node.name)
                && node.requires.iter().all(|r| run_map.contains_key(r))
        });

        let Some(node) = next else { break };

        let options = node_options(node, base_options, &run_map)?;
        info!(
            "Workflow {}: running {} as {}",
            workflow.name, node.name, options.run_id
        );

        let run_id = executor.run(options).await?;
        run_map.insert(node.name.clone(), run_id);
    }

    // Validate() guarantees every node becomes ready eventually
    if run_map.len() != workflow.pipelines.len() {
        return Err(WorkflowError::Other(format!(
            "Workflow stalled: ran {} of {} pipelines",
            run_map.len(),
            workflow.pipelines.len()
        )));
    }

    Ok(run_map)
}

/// Per-node options: fresh run id, artifacts on, fan-in project paths
fn node_options(
    node: &WorkflowPipelineDefinition,
    base: &PipelineOptions,
    run_map: &HashMap<String, String>,
) -> Result<PipelineOptions, WorkflowError> {
    let mut options = base.clone();
    options.run_id = uuid::Uuid::new_v4().simple().to_string();
    options.pipeline_name = node.pipeline().to_string();
    options.should_artifacts = true;
    options.env_file = node.env_file.as_ref().map(PathBuf::from);

    if node.requires.is_empty() {
        options.kind = PipelineKind::Build;
        return Ok(options);
    }

    // Downstream pipelines execute with deploy semantics
    options.kind = PipelineKind::Deploy;

    let sources: Vec<&String> = match &node.artifact_pipeline {
        Some(single) => vec![single],
        None => node.requires.iter().collect(),
    };

    let mut project_paths = HashMap::new();
    for source in sources {
        let run_id = run_map.get(source).ok_or_else(|| WorkflowError::Other(
            format!("No recorded run for required pipeline {:?}", source),
        ))?;
        let output = base.build_path().join(run_id).join("output");
        if !output.is_dir() {
            return Err(WorkflowError::MissingOutput {
                pipeline: source.clone(),
                path: output.display().to_string(),
            });
        }
        project_paths.insert(source.clone(), output);
    }

    debug!(
        "Pipeline {} fans in from {:?}",
        node.name,
        project_paths.keys().collect::<Vec<_>>()
    );
    options.project_paths_by_pipeline = project_paths;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with_workflow(workflow_yaml: &str) -> Config {
        let yaml = format!(
            r#"
box: busybox
a:
  steps: [script-a]
b:
  steps: [script-b]
c:
  steps: [script-c]
{}"#,
            workflow_yaml
        );
        Config::from_str(&yaml).unwrap()
    }

    #[test]
    fn test_validate_accepts_linear_chain() {
        let config = config_with_workflow(
            r#"
workflows:
  - name: main
    pipelines:
      - name: a
      - name: b
        requires: [a]
      - name: c
        requires: [b]
"#,
        );
        let workflow = config.workflow("main").unwrap();
        validate(workflow, &config).unwrap();
    }

    #[test]
    fn test_validate_rejects_cycle_with_path() {
        let config = config_with_workflow(
            r#"
workflows:
  - name: main
    pipelines:
      - name: root
        pipelineName: a
      - name: a
        pipelineName: a
        requires: [b]
      - name: b
        pipelineName: b
        requires: [a]
"#,
        );
        // A root exists so cycle detection is what trips
        let workflow = config.workflow("main").unwrap();
        let err = validate(workflow, &config).unwrap_err();
        match err {
            WorkflowError::Cycle(path) => {
                assert!(path == "a -> b -> a" || path == "b -> a -> b", "{}", path);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_pipeline_and_requirement() {
        let config = config_with_workflow(
            r#"
workflows:
  - name: missing-pipeline
    pipelines:
      - name: nope
  - name: missing-requirement
    pipelines:
      - name: a
      - name: b
        requires: [ghost]
"#,
        );
        assert!(matches!(
            validate(config.workflow("missing-pipeline").unwrap(), &config),
            Err(WorkflowError::UnknownPipeline { .. })
        ));
        assert!(matches!(
            validate(config.workflow("missing-requirement").unwrap(), &config),
            Err(WorkflowError::UnknownRequirement { .. })
        ));
    }

    #[test]
    fn test_validate_requires_exactly_one_root() {
        let config = config_with_workflow(
            r#"
workflows:
  - name: two-roots
    pipelines:
      - name: a
      - name: b
"#,
        );
        assert!(matches!(
            validate(config.workflow("two-roots").unwrap(), &config),
            Err(WorkflowError::MultipleRoots(_))
        ));
    }

    struct RecordingExecutor {
        tmp: std::path::PathBuf,
        ran: Vec<(String, PipelineOptions)>,
        next: usize,
    }

    #[async_trait]
    impl PipelineExecutor for RecordingExecutor {
        async fn run(&mut self, options: PipelineOptions) -> Result<String, WorkflowError> {
            let run_id = format!("run{}", self.next);
            self.next += 1;

            // Leave behind the output dir downstream nodes fan in from
            let output = self.tmp.join("builds").join(&run_id).join("output");
            std::fs::create_dir_all(&output).unwrap();

            let mut recorded = options.clone();
            recorded.run_id = run_id.clone();
            self.ran.push((options.pipeline_name.clone(), recorded));
            Ok(run_id)
        }
    }

    #[tokio::test]
    async fn test_execute_fan_in_order_and_paths() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = config_with_workflow(
            r#"
workflows:
  - name: main
    pipelines:
      - name: a
      - name: b
        requires: [a]
      - name: c
        requires: [a, b]
"#,
        );
        let workflow = config.workflow("main").unwrap();
        validate(workflow, &config).unwrap();

        let base = PipelineOptions {
            working_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let mut executor = RecordingExecutor {
            tmp: tmp.path().to_path_buf(),
            ran: Vec::new(),
            next: 0,
        };

        let run_map = execute(workflow, &base, &mut executor).await.unwrap();
        assert_eq!(run_map.len(), 3);

        let order: Vec<&str> = executor.ran.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        // c fans in from both upstream output dirs
        let (_, c_options) = &executor.ran[2];
        assert_eq!(c_options.project_paths_by_pipeline.len(), 2);
        assert!(c_options.project_paths_by_pipeline["a"]
            .ends_with("builds/run0/output"));
        assert!(c_options.project_paths_by_pipeline["b"]
            .ends_with("builds/run1/output"));
        assert!(c_options.should_artifacts);
        assert_eq!(c_options.kind, PipelineKind::Deploy);
    }

    #[tokio::test]
    async fn test_execute_narrows_to_artifact_pipeline() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = config_with_workflow(
            r#"
workflows:
  - name: main
    pipelines:
      - name: a
      - name: b
        requires: [a]
      - name: c
        requires: [a, b]
        artifactPipeline: b
"#,
        );
        let workflow = config.workflow("main").unwrap();

        let base = PipelineOptions {
            working_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let mut executor = RecordingExecutor {
            tmp: tmp.path().to_path_buf(),
            ran: Vec::new(),
            next: 0,
        };

        execute(workflow, &base, &mut executor).await.unwrap();
        let (_, c_options) = &executor.ran[2];
        assert_eq!(c_options.project_paths_by_pipeline.len(), 1);
        assert!(c_options.project_paths_by_pipeline.contains_key("b"));
    }
}
