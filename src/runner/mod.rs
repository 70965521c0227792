//! Drives one pipeline end-to-end
//!
//! Phases: materialize source, prune old builds, set up the environment
//! (box, services, session), run the steps, commit/store, run after-steps,
//! collect the cache. Every phase is wrapped so its step-finished event is
//! emitted no matter how the phase ends, and the box-cleanup signal
//! handler is registered before any container exists.

mod finisher;

pub use finisher::Finisher;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{Artificer, Store};
use crate::boxes::{DaemonProvisioner, PipelineBox};
use crate::config::Config;
use crate::core::{options::update_symlink, Environment, PipelineOptions};
use crate::engine::DockerClient;
use crate::events::{Emitter, Event, LogStream, StepSummary};
use crate::pipeline::{Pipeline, PipelineResult};
use crate::session::{DockerTransport, Session, SessionError};
use crate::signals::SignalRegistry;
use crate::step::{ExecContext, Step, StepContext, StepOutcome, StepRegistry};

/// Build dirs older than this (beyond the newest two) are pruned
const BUILD_RETENTION: Duration = Duration::from_secs(24 * 3600);
const BUILDS_KEPT: usize = 2;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to materialize source: {0}")]
    Code(String),

    #[error("Setup environment failed: {0}")]
    Setup(String),

    #[error("Store phase failed: {0}")]
    StorePhase(String),

    #[error("{0}")]
    Other(String),
}

/// Final result of one pipeline run
#[derive(Debug, Clone, Default)]
pub struct RunnerResult {
    pub run_id: String,
    pub success: bool,
    pub failed_step_name: String,
    pub failed_step_message: String,
}

/// Everything a runner needs, wired once by the caller
pub struct Runner {
    pub options: PipelineOptions,
    pub config: Config,
    pub emitter: Emitter,
    pub registry: StepRegistry,
    pub store: Option<Arc<dyn Store>>,
    pub provisioner: Option<Arc<dyn DaemonProvisioner>>,
    pub signals: SignalRegistry,
}

impl Runner {
    /// Run the pipeline to completion; cleanup happens on every path.
    pub async fn run(&self) -> Result<RunnerResult, RunnerError> {
        let run_id = self.options.run_id.clone();
        self.emitter.emit(Event::BuildStarted {
            run_id: run_id.clone(),
            pipeline_name: self.options.pipeline_name.clone(),
        });

        let result = self.run_inner().await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emit_error(&e.to_string());
                RunnerResult {
                    run_id: run_id.clone(),
                    success: false,
                    failed_step_name: "setup".to_string(),
                    failed_step_message: e.to_string(),
                }
            }
        };

        self.emitter.emit(Event::BuildFinished {
            run_id: run_id.clone(),
            result: if outcome.success { "passed" } else { "failed" }.to_string(),
        });
        self.emitter.emit(Event::FullPipelineFinished {
            run_id,
            main_successful: outcome.success,
            run_error: if outcome.success {
                None
            } else {
                Some(outcome.failed_step_message.clone())
            },
        });

        Ok(outcome)
    }

    async fn run_inner(&self) -> Result<RunnerResult, RunnerError> {
        self.ensure_code().await?;
        self.cleanup_old_builds();

        let mut pipeline = Pipeline::from_config(&self.config, &self.options)
            .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;

        pipeline
            .init_env(std::env::vars())
            .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;

        self.announce_steps(&pipeline);

        // Setup environment runs as its own reported step
        let setup_summary = StepSummary {
            id: "setup environment".to_string(),
            safe_id: "setup-environment".to_string(),
            display_name: "setup environment".to_string(),
        };
        let mut finisher = Finisher::new(&self.emitter, &self.options.run_id, &setup_summary, 0);

        let setup = self.setup_environment(&mut pipeline).await;
        let shared = match setup {
            Ok(shared) => {
                finisher.finish(true, "");
                shared
            }
            Err(e) => {
                finisher.finish(false, &e.to_string());
                return Err(e);
            }
        };

        let result = self.run_steps(&mut pipeline, &shared).await;

        // After-steps and cache export still run on a failed step list,
        // but only once setup produced a live session.
        let after = self.run_after_steps(&mut pipeline, &shared, &result).await;
        if let Err(e) = after {
            warn!("After-steps failed: {}", e);
        }

        if !self.options.direct_mount {
            if let Err(e) = pipeline
                .collect_cache(&shared.artificer, &shared.container_id)
                .await
            {
                warn!("Cache export failed: {}", e);
            }
        }

        // Shutdown discipline: stop, then clean, then drop the handler
        {
            let pipeline_box = shared.pipeline_box.lock().await;
            pipeline_box.stop().await;
            pipeline_box.clean().await;
        }
        drop(shared.cleanup_guard);

        if let Err(e) = update_symlink(&self.options) {
            debug!("Symlink update failed: {}", e);
        }

        Ok(result)
    }

    /// Materialize source into the project dir. Four cases: direct mount
    /// (trust the caller), remote tarball, workflow fan-in, local copy.
    async fn ensure_code(&self) -> Result<(), RunnerError> {
        let options = &self.options;
        let project_dir = options.project_dir();

        if options.direct_mount {
            debug!("Direct mount, source stays at {}", options.project_path.display());
            return Ok(());
        }

        std::fs::create_dir_all(&project_dir)
            .map_err(|e| self.phase_error(RunnerError::Code(e.to_string())))?;

        if let Some(url) = &options.project_url {
            crate::fsutil::download_tarball(url, &project_dir)
                .await
                .map_err(|e| self.phase_error(RunnerError::Code(e.to_string())))?;
            return Ok(());
        }

        if !options.project_paths_by_pipeline.is_empty() {
            for (pipeline_name, source_dir) in &options.project_paths_by_pipeline {
                let target = project_dir.join(pipeline_name);
                crate::fsutil::copy_tree(source_dir, &target)
                    .map_err(|e| self.phase_error(RunnerError::Code(e.to_string())))?;
            }
            return Ok(());
        }

        for legacy in ["_builds", "_steps", "_projects"] {
            if options.project_path.join(legacy).is_dir() {
                self.emit_error(&format!(
                    "Warning: legacy directory {:?} found in the project; it is no longer used",
                    legacy
                ));
            }
        }

        crate::fsutil::copy_project(&options.project_path, &project_dir, &options.ignore_file)
            .map_err(|e| self.phase_error(RunnerError::Code(e.to_string())))?;
        Ok(())
    }

    fn cleanup_old_builds(&self) {
        if let Err(e) = crate::fsutil::prune_old_builds(
            &self.options.build_path(),
            BUILDS_KEPT,
            BUILD_RETENTION,
        ) {
            warn!("Old build cleanup failed: {}", e);
        }
    }

    fn announce_steps(&self, pipeline: &Pipeline) {
        let mut steps: Vec<StepSummary> = Vec::new();
        for step in &pipeline.steps {
            steps.push(summary_of(step.as_ref()));
        }
        let store_step = if self.options.should_artifacts {
            Some(StepSummary {
                id: "store".to_string(),
                safe_id: "store".to_string(),
                display_name: "store".to_string(),
            })
        } else {
            None
        };
        self.emitter.emit(Event::BuildStepsAdded {
            run_id: self.options.run_id.clone(),
            steps,
            store_step,
        });
    }

    /// Boot the box and attach the session. The cleanup signal handler is
    /// registered before the first container action and is the last one
    /// added, so a signal reaches it first.
    async fn setup_environment(&self, pipeline: &mut Pipeline) -> Result<RunnerShared, RunnerError> {
        let options = &self.options;

        let mut client = DockerClient::connect(&options.docker_host)
            .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;

        // Raw docker access: swap to a provisioned daemon for this run
        let mut provisioned = false;
        if pipeline.docker_access {
            if let Some(provisioner) = &self.provisioner {
                let endpoint = provisioner
                    .provision(&options.run_id)
                    .await
                    .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;
                client = DockerClient::connect(&endpoint)
                    .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;
                provisioned = true;
            }
        }

        let mut pipeline_box = PipelineBox::new(
            options,
            pipeline.box_definition.clone(),
            pipeline.service_definitions.clone(),
            client.clone(),
            self.emitter.clone(),
        );
        if pipeline.docker_access && client.is_local_socket() {
            pipeline_box.mount_docker_socket();
        }
        let pipeline_box = Arc::new(Mutex::new(pipeline_box));

        // Registered last -> runs first. Deprovision, stop, clean, exit.
        let cleanup_guard = {
            let pipeline_box = pipeline_box.clone();
            let provisioner = self.provisioner.clone().filter(|_| provisioned);
            let run_id = options.run_id.clone();
            self.signals.add(move || {
                let pipeline_box = pipeline_box.clone();
                let provisioner = provisioner.clone();
                let run_id = run_id.clone();
                Box::pin(async move {
                    if let Some(provisioner) = provisioner {
                        let _ = provisioner.deprovision(&run_id).await;
                    }
                    let guard = pipeline_box.lock().await;
                    guard.stop().await;
                    guard.clean().await;
                    std::process::exit(1);
                })
            })
        };
        self.signals.install();

        let container_id = {
            let mut guard = pipeline_box.lock().await;
            guard
                .fetch(&pipeline.env)
                .await
                .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;
            guard
                .fetch_services(&pipeline.env)
                .await
                .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;
            guard
                .run(&pipeline.env)
                .await
                .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?
        };

        // Remote daemons cannot bind-mount this host; copy content in
        if !client.is_local_socket() {
            let dirs = vec![self.options.host_path(&[]), self.options.cache_path()];
            let guard = pipeline_box.lock().await;
            guard
                .copy_to_guest(&dirs)
                .await
                .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;
        }

        // Fetch steps only after the box resolved, so fetch errors carry
        // working log context
        let step_ctx = StepContext {
            options: options.clone(),
            registry: self.registry.clone(),
        };
        for step in pipeline
            .steps
            .iter_mut()
            .chain(pipeline.after_steps.iter_mut())
        {
            step.fetch(&step_ctx)
                .await
                .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;
        }

        let ctx = CancellationToken::new();
        let transport = DockerTransport::new(client.clone(), container_id.clone());
        let session = Session::attach(&transport, ctx.clone(), self.emitter.clone(), options)
            .await
            .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;

        pipeline
            .setup_guest(&session)
            .await
            .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;
        pipeline
            .export_environment(&session)
            .await
            .map_err(|e| self.phase_error(RunnerError::Setup(e.to_string())))?;

        Ok(RunnerShared {
            client: client.clone(),
            container_id,
            session,
            ctx,
            artificer: Arc::new(Artificer::new(client)),
            pipeline_box,
            cleanup_guard,
        })
    }

    async fn run_steps(
        &self,
        pipeline: &mut Pipeline,
        shared: &RunnerShared,
    ) -> RunnerResult {
        let mut result = RunnerResult {
            run_id: self.options.run_id.clone(),
            success: true,
            ..Default::default()
        };

        // Checkpoint resume: skip everything up to and including the
        // named checkpoint
        let mut skipping = self.options.enable_dev_steps && !self.options.checkpoint.is_empty();

        let step_ctx = StepContext {
            options: self.options.clone(),
            registry: self.registry.clone(),
        };

        let count = pipeline.steps.len();
        for order in 0..count {
            if skipping {
                let hit = pipeline.steps[order].checkpoint()
                    == Some(self.options.checkpoint.as_str());
                info!(
                    "Skipping step {} (checkpoint resume)",
                    pipeline.steps[order].display_name()
                );
                if hit {
                    skipping = false;
                }
                continue;
            }

            let summary = summary_of(pipeline.steps[order].as_ref());
            let sync_env = pipeline.steps[order].should_sync_env();
            let checkpoint = pipeline.steps[order].checkpoint().map(String::from);
            self.emitter.emit(Event::BuildStepStarted {
                run_id: self.options.run_id.clone(),
                step: summary.clone(),
                order: order + 1,
            });
            let mut finisher =
                Finisher::new(&self.emitter, &self.options.run_id, &summary, order + 1);

            // A signal mid-step marks it interrupted and is swallowed;
            // the cancelled context fails the in-flight command, which
            // drives the normal teardown path. Dropping the guard
            // deregisters on every exit path.
            let _step_signal_guard = {
                let emitter = self.emitter.clone();
                let run_id = self.options.run_id.clone();
                let summary = summary.clone();
                let order = order + 1;
                let ctx = shared.ctx.clone();
                self.signals.add(move || {
                    let emitter = emitter.clone();
                    let run_id = run_id.clone();
                    let summary = summary.clone();
                    let ctx = ctx.clone();
                    Box::pin(async move {
                        emitter.emit(Event::BuildStepFinished {
                            run_id,
                            step: summary,
                            order,
                            successful: false,
                            message: "interrupted".to_string(),
                            artifact_url: None,
                        });
                        ctx.cancel();
                        true
                    })
                })
            };

            if sync_env {
                if let Err(e) = pipeline
                    .sync_environment(&shared.session, &self.emitter)
                    .await
                {
                    warn!("Env sync failed: {}", e);
                }
            }

            let mut env = pipeline.env.clone();
            let outcome = self
                .run_one_step(
                    pipeline.steps[order].as_mut(),
                    &step_ctx,
                    shared,
                    shared.session.clone(),
                    &mut env,
                )
                .await;

            match outcome {
                Ok(outcome) if outcome.success() => {
                    finisher.finish(true, &outcome.message);

                    // Commit a checkpoint image for later resume
                    if self.options.checkpoint_commit {
                        if let Some(checkpoint) = checkpoint.as_deref() {
                            let tag = format!("w-{}", checkpoint);
                            let repository = pipeline.image_repository();
                            let mut guard = shared.pipeline_box.lock().await;
                            if let Err(e) = guard
                                .commit(&repository, &tag, "Checkpoint", false)
                                .await
                            {
                                warn!("Checkpoint commit failed: {}", e);
                            }
                        }
                    }
                }
                Ok(outcome) => {
                    let message = if outcome.message.is_empty() {
                        format!("Step failed with exit code {}", outcome.exit_code)
                    } else {
                        outcome.message.clone()
                    };
                    finisher.finish(false, &message);
                    result.success = false;
                    result.failed_step_name = summary.display_name.clone();
                    result.failed_step_message = message;
                    break;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.emit_error(&message);
                    finisher.finish(false, &message);
                    result.success = false;
                    result.failed_step_name = summary.display_name.clone();
                    result.failed_step_message = message;
                    break;
                }
            }
        }

        if result.success {
            if let Err(e) = self.store_phase(pipeline, shared).await {
                result.success = false;
                result.failed_step_name = "store".to_string();
                result.failed_step_message = e.to_string();
            }
        }

        result
    }

    async fn run_one_step(
        &self,
        step: &mut dyn Step,
        step_ctx: &StepContext,
        shared: &RunnerShared,
        session: Arc<Session>,
        env: &mut Environment,
    ) -> Result<StepOutcome, crate::step::StepError> {
        step.init_env(step_ctx, env)?;

        let exec_ctx = ExecContext {
            options: self.options.clone(),
            session,
            client: shared.client.clone(),
            emitter: self.emitter.clone(),
            pipeline_box: shared.pipeline_box.clone(),
            artificer: shared.artificer.clone(),
            store: self.store.clone(),
            env: env.clone(),
        };

        let exit_code = step.execute(&exec_ctx).await?;

        let mut outcome = StepOutcome {
            exit_code,
            ..Default::default()
        };
        step.collect(&exec_ctx, &mut outcome).await?;
        step.clean(step_ctx).await;

        Ok(outcome)
    }

    /// Commit the box and run the implicit store step
    async fn store_phase(
        &self,
        pipeline: &Pipeline,
        shared: &RunnerShared,
    ) -> Result<(), RunnerError> {
        if self.options.should_commit {
            let mut guard = shared.pipeline_box.lock().await;
            guard
                .commit(
                    &pipeline.image_repository(),
                    &pipeline.image_tag(),
                    &pipeline.commit_message(),
                    false,
                )
                .await
                .map_err(|e| self.phase_error(RunnerError::StorePhase(e.to_string())))?;
        }

        if !self.options.should_artifacts {
            return Ok(());
        }

        let summary = StepSummary {
            id: "store".to_string(),
            safe_id: "store".to_string(),
            display_name: "store".to_string(),
        };
        self.emitter.emit(Event::BuildStepStarted {
            run_id: self.options.run_id.clone(),
            step: summary.clone(),
            order: pipeline.steps.len() + 1,
        });
        let mut finisher = Finisher::new(
            &self.emitter,
            &self.options.run_id,
            &summary,
            pipeline.steps.len() + 1,
        );

        let stored = async {
            let artifact = pipeline
                .collect_artifact(&shared.artificer, &shared.container_id)
                .await
                .map_err(|e| RunnerError::StorePhase(e.to_string()))?;

            pipeline.emit_artifact_listing(&self.emitter, &artifact.host_path);

            if self.options.should_store {
                if let Some(store) = &self.store {
                    shared
                        .artificer
                        .upload(store.as_ref(), &artifact)
                        .await
                        .map_err(|e| RunnerError::StorePhase(e.to_string()))?;
                }
            }
            Ok::<(), RunnerError>(())
        }
        .await;

        match stored {
            Ok(()) => {
                finisher.finish(true, "");
                Ok(())
            }
            Err(e) => {
                finisher.finish(false, &e.to_string());
                Err(self.phase_error(e))
            }
        }
    }

    /// Restart the box and run after-steps with the result env exported.
    /// After-steps run whenever they are declared and setup succeeded,
    /// even when a main step failed.
    async fn run_after_steps(
        &self,
        pipeline: &mut Pipeline,
        shared: &RunnerShared,
        result: &RunnerResult,
    ) -> Result<(), RunnerError> {
        if pipeline.after_steps.is_empty() {
            return Ok(());
        }

        {
            let guard = shared.pipeline_box.lock().await;
            guard
                .restart()
                .await
                .map_err(|e| RunnerError::Other(e.to_string()))?;
        }

        let transport = DockerTransport::new(shared.client.clone(), shared.container_id.clone());
        let session = Session::attach(
            &transport,
            shared.ctx.clone(),
            self.emitter.clone(),
            &self.options,
        )
        .await
        .map_err(|e: SessionError| RunnerError::Other(e.to_string()))?;

        let pipeline_result = PipelineResult {
            success: result.success,
            failed_step_name: result.failed_step_name.clone(),
            failed_step_message: result.failed_step_message.clone(),
        };
        pipeline.env.update(&pipeline_result.export());

        pipeline
            .setup_guest(&session)
            .await
            .map_err(|e| RunnerError::Other(e.to_string()))?;
        pipeline
            .export_environment(&session)
            .await
            .map_err(|e| RunnerError::Other(e.to_string()))?;

        let step_ctx = StepContext {
            options: self.options.clone(),
            registry: self.registry.clone(),
        };

        let count = pipeline.after_steps.len();
        for order in 0..count {
            let summary = summary_of(pipeline.after_steps[order].as_ref());
            self.emitter.emit(Event::BuildStepStarted {
                run_id: self.options.run_id.clone(),
                step: summary.clone(),
                order: order + 1,
            });
            let mut finisher =
                Finisher::new(&self.emitter, &self.options.run_id, &summary, order + 1);

            let mut env = pipeline.env.clone();
            match self
                .run_one_step(
                    pipeline.after_steps[order].as_mut(),
                    &step_ctx,
                    shared,
                    session.clone(),
                    &mut env,
                )
                .await
            {
                Ok(outcome) => finisher.finish(outcome.success(), &outcome.message),
                Err(e) => {
                    self.emit_error(&e.to_string());
                    finisher.finish(false, &e.to_string());
                }
            }
        }

        Ok(())
    }

    /// Emit the error text on stderr before surfacing it
    fn phase_error(&self, err: RunnerError) -> RunnerError {
        self.emit_error(&err.to_string());
        err
    }

    fn emit_error(&self, message: &str) {
        self.emitter.emit_log(
            &self.options.run_id,
            "",
            LogStream::Stderr,
            format!("{}\n", message),
            false,
        );
    }
}

fn summary_of(step: &dyn Step) -> StepSummary {
    StepSummary {
        id: step.id().to_string(),
        safe_id: step.safe_id().to_string(),
        display_name: step.display_name().to_string(),
    }
}

/// Mutable envelope passed between runner phases
pub struct RunnerShared {
    pub client: DockerClient,
    pub container_id: String,
    pub session: Arc<Session>,
    pub ctx: CancellationToken,
    pub artificer: Arc<Artificer>,
    pub pipeline_box: Arc<Mutex<PipelineBox>>,
    pub cleanup_guard: crate::signals::SignalGuard,
}

