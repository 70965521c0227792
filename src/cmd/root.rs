//! Single-pipeline execution command

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::RunArgs;
use crate::artifact::{FileStore, Store};
use crate::boxes::{DaemonProvisioner, StaticProvisioner};
use crate::config::Config;
use crate::core::{parse_application_id, PipelineKind, PipelineOptions};
use crate::events::{Emitter, TerminalLogger};
use crate::runner::Runner;
use crate::signals::SignalRegistry;
use crate::step::StepRegistry;

/// Run one pipeline; returns the process exit code.
pub async fn run(kind: PipelineKind, args: &RunArgs) -> Result<i32> {
    let config_path = if args.config.is_absolute() {
        args.config.clone()
    } else {
        args.target.join(&args.config)
    };
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Loading {}", config_path.display()))?;

    let options = build_options(kind, args, &config)?;
    info!(
        "Running pipeline {:?} as {}",
        options.pipeline_name, options.run_id
    );

    let emitter = Emitter::new();
    let logger = TerminalLogger::start(&emitter);

    let runner = Runner {
        options,
        config,
        emitter: emitter.clone(),
        registry: StepRegistry::new(&args.step_registry),
        store: store_for(args),
        provisioner: provisioner_for(args),
        signals: SignalRegistry::global().clone(),
    };

    let result = runner.run().await?;

    drop(runner);
    drop(emitter);
    let _ = logger.await;

    if result.success {
        Ok(0)
    } else {
        Ok(1)
    }
}

/// Resolve the artifact store when one was requested
pub fn store_for(args: &RunArgs) -> Option<Arc<dyn Store>> {
    if !args.store {
        return None;
    }
    let root = args
        .store_path
        .clone()
        .unwrap_or_else(|| args.working_dir.join("store"));
    Some(Arc::new(FileStore::new(root)))
}

/// Resolve the remote-daemon provisioner when one was configured
pub fn provisioner_for(args: &RunArgs) -> Option<Arc<dyn DaemonProvisioner>> {
    args.rdd
        .as_ref()
        .map(|endpoint| Arc::new(StaticProvisioner::new(endpoint.clone())) as Arc<dyn DaemonProvisioner>)
}

/// Map CLI arguments plus config defaults onto resolved run options
pub fn build_options(
    kind: PipelineKind,
    args: &RunArgs,
    config: &Config,
) -> Result<PipelineOptions> {
    let pipeline_name = args.pipeline.clone().unwrap_or_else(|| {
        match kind {
            PipelineKind::Build => "build",
            PipelineKind::Deploy => "deploy",
        }
        .to_string()
    });

    let project_path = args
        .target
        .canonicalize()
        .unwrap_or_else(|_| args.target.clone());

    let (owner, name) = match &args.application_id {
        Some(id) => parse_application_id(id).map_err(anyhow::Error::msg)?,
        None => {
            let name = project_path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string());
            ("local".to_string(), name)
        }
    };

    let mut options = PipelineOptions {
        pipeline_name,
        kind,
        application_id: format!("{}/{}", owner, name),
        application_name: name,
        application_owner_name: owner,
        working_dir: args.working_dir.clone(),
        project_path,
        should_commit: args.commit,
        should_artifacts: args.artifacts || args.store,
        should_store: args.store,
        direct_mount: args.direct_mount,
        expose_ports: args.expose_ports,
        local_only: args.docker_local,
        enable_dev_steps: args.enable_dev_steps,
        checkpoint: args.checkpoint.clone(),
        checkpoint_commit: args.commit_checkpoints,
        env_file: args.env_file.clone(),
        docker_host: args.docker_host.clone(),
        network_name: args.network.clone().unwrap_or_default(),
        memory_mb: args.memory,
        ..Default::default()
    };

    // Config-level timeouts are minutes
    if let Some(minutes) = config.command_timeout {
        options.command_timeout_ms = minutes * 60 * 1000;
    }
    if let Some(minutes) = config.no_response_timeout {
        options.no_response_timeout_ms = minutes * 60 * 1000;
    }
    if let Some(source_dir) = config.source_dir.clone().or(args.source_dir.clone()) {
        options.source_dir = source_dir;
    }
    if let Some(ignore_file) = config.ignore_file.clone().or(args.ignore_file.clone()) {
        options.ignore_file = ignore_file;
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: RunArgs,
    }

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["test"];
        argv.extend(extra);
        Harness::parse_from(argv).args
    }

    #[test]
    fn test_build_options_defaults() {
        let config = Config::from_str("box: busybox\nbuild:\n  steps: [a]\n").unwrap();
        let options = build_options(PipelineKind::Build, &args(&[]), &config).unwrap();
        assert_eq!(options.pipeline_name, "build");
        assert_eq!(options.command_timeout_ms, 25 * 60 * 1000);
        assert!(!options.should_artifacts);
        assert!(options.application_id.starts_with("local/"));
    }

    #[test]
    fn test_build_options_config_timeouts_and_store() {
        let config = Config::from_str(
            "box: busybox\ncommand-timeout: 5\nno-response-timeout: 1\nbuild:\n  steps: [a]\n",
        )
        .unwrap();
        let options = build_options(
            PipelineKind::Build,
            &args(&["--store", "--application-id", "acme/app"]),
            &config,
        )
        .unwrap();
        assert_eq!(options.command_timeout_ms, 5 * 60 * 1000);
        assert_eq!(options.no_response_timeout_ms, 60 * 1000);
        assert!(options.should_store);
        // Storing implies collecting
        assert!(options.should_artifacts);
        assert_eq!(options.application_id, "acme/app");
    }
}
