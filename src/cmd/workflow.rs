//! Workflow execution command

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use tracing::info;

use super::root::{build_options, provisioner_for, store_for};
use super::RunArgs;
use crate::config::Config;
use crate::core::{PipelineKind, PipelineOptions};
use crate::events::{Emitter, TerminalLogger};
use crate::runner::Runner;
use crate::signals::SignalRegistry;
use crate::step::StepRegistry;
use crate::workflow::{self, PipelineExecutor, WorkflowError};

#[derive(Args, Debug)]
pub struct WorkflowArgs {
    /// Name of the workflow to run
    pub name: String,

    #[command(flatten)]
    pub run: RunArgs,
}

/// Runs each workflow node through the single-pipeline runner
struct RunnerExecutor {
    config: Config,
    args: RunArgs,
}

#[async_trait]
impl PipelineExecutor for RunnerExecutor {
    async fn run(&mut self, options: PipelineOptions) -> Result<String, WorkflowError> {
        let emitter = Emitter::new();
        let logger = TerminalLogger::start(&emitter);

        let runner = Runner {
            options: options.clone(),
            config: self.config.clone(),
            emitter: emitter.clone(),
            registry: StepRegistry::new(&self.args.step_registry),
            store: store_for(&self.args),
            provisioner: provisioner_for(&self.args),
            signals: SignalRegistry::global().clone(),
        };

        let result = runner
            .run()
            .await
            .map_err(|e| WorkflowError::Other(e.to_string()))?;

        drop(runner);
        drop(emitter);
        let _ = logger.await;

        if result.success {
            Ok(result.run_id)
        } else {
            Err(WorkflowError::PipelineFailed(options.pipeline_name))
        }
    }
}

/// Validate and drive a workflow; returns the process exit code.
pub async fn run(args: &WorkflowArgs) -> Result<i32> {
    let config_path = if args.run.config.is_absolute() {
        args.run.config.clone()
    } else {
        args.run.target.join(&args.run.config)
    };
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Loading {}", config_path.display()))?;

    let Some(workflow) = config.workflow(&args.name).cloned() else {
        bail!("No workflow named {:?} in configuration", args.name);
    };

    // Everything is checked before any container work starts
    workflow::validate(&workflow, &config)?;

    // Artifacts are forced on: downstream pipelines feed on them
    let mut base_args = args.run.clone();
    base_args.artifacts = true;
    let base_options = build_options(PipelineKind::Build, &base_args, &config)?;

    let mut executor = RunnerExecutor {
        config,
        args: base_args,
    };

    match workflow::execute(&workflow, &base_options, &mut executor).await {
        Ok(run_map) => {
            info!(
                "Workflow {} finished: {} pipelines",
                workflow.name,
                run_map.len()
            );
            Ok(0)
        }
        Err(WorkflowError::PipelineFailed(name)) => {
            tracing::error!("Workflow {} failed at {}", workflow.name, name);
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}
