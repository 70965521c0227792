//! One pipeline: its box, services, steps, and environment
//!
//! Build and deploy pipelines share this struct; the differences (image
//! tag, commit message, env var names, symlink) live in behavior fields
//! chosen at construction.

use std::path::Path;

use tracing::{debug, warn};

use crate::archive::CACHE_SIZE_CAP;
use crate::artifact::{Artifact, Artificer, CollectError};
use crate::config::{BoxDefinition, Config, ConfigError, PipelineDefinition};
use crate::core::{Environment, PipelineKind, PipelineOptions};
use crate::events::{Emitter, LogStream};
use crate::session::{Session, SessionError};
use crate::step::{self, Step, StepError};

/// Chooses the committed image tag for a run
type Tagger = Box<dyn Fn(&PipelineOptions) -> String + Send + Sync>;

/// Chooses the commit message for a run
type Messager = Box<dyn Fn(&PipelineOptions) -> String + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Outcome of a whole pipeline, exported into after-steps
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub success: bool,
    pub failed_step_name: String,
    pub failed_step_message: String,
}

impl PipelineResult {
    /// Env pairs after-steps receive
    pub fn export(&self) -> Vec<(String, String)> {
        let mut pairs = vec![(
            "WERCKER_RESULT".to_string(),
            if self.success { "passed" } else { "failed" }.to_string(),
        )];
        if !self.success {
            pairs.push((
                "WERCKER_FAILED_STEP_DISPLAY_NAME".to_string(),
                self.failed_step_name.clone(),
            ));
            pairs.push((
                "WERCKER_FAILED_STEP_MESSAGE".to_string(),
                self.failed_step_message.clone(),
            ));
        }
        pairs
    }
}

/// A fully constructed pipeline, ready for the runner
pub struct Pipeline {
    pub options: PipelineOptions,
    pub env: Environment,

    pub box_definition: BoxDefinition,
    pub service_definitions: Vec<BoxDefinition>,
    pub docker_access: bool,
    pub base_path: Option<String>,

    pub steps: Vec<Box<dyn Step>>,
    pub after_steps: Vec<Box<dyn Step>>,

    image_tagger: Tagger,
    commit_messager: Messager,
}

impl Pipeline {
    /// Select and build the named pipeline from parsed configuration
    pub fn from_config(config: &Config, options: &PipelineOptions) -> Result<Self, PipelineError> {
        let definition = config.pipeline(&options.pipeline_name)?;

        let box_definition = definition
            .box_entry
            .as_ref()
            .or(config.box_entry.as_ref())
            .map(|b| b.definition())
            .ok_or_else(|| {
                PipelineError::Other(format!(
                    "Pipeline {:?} has no box",
                    options.pipeline_name
                ))
            })?;

        let service_entries = if definition.services.is_empty() {
            &config.services
        } else {
            &definition.services
        };
        let service_definitions = service_entries.iter().map(|s| s.definition()).collect();

        let steps = Self::build_steps(&definition, options)?;
        let after_steps = Self::build_after_steps(&definition, options)?;

        let (image_tagger, commit_messager): (Tagger, Messager) = match options.kind {
            PipelineKind::Build => (
                Box::new(|o: &PipelineOptions| format!("build-{}", o.run_id)),
                Box::new(|o: &PipelineOptions| format!("Build {}", o.run_id)),
            ),
            PipelineKind::Deploy => (
                Box::new(|o: &PipelineOptions| format!("deploy-{}", o.run_id)),
                Box::new(|o: &PipelineOptions| format!("Deploy {}", o.run_id)),
            ),
        };

        Ok(Self {
            options: options.clone(),
            env: Environment::new(),
            box_definition,
            service_definitions,
            docker_access: definition.docker,
            base_path: definition.base_path.clone(),
            steps,
            after_steps,
            image_tagger,
            commit_messager,
        })
    }

    fn build_steps(
        definition: &PipelineDefinition,
        options: &PipelineOptions,
    ) -> Result<Vec<Box<dyn Step>>, PipelineError> {
        definition
            .steps
            .iter()
            .map(|entry| {
                let normalized = entry.normalize()?;
                Ok(step::from_definition(&normalized, options)?)
            })
            .collect()
    }

    fn build_after_steps(
        definition: &PipelineDefinition,
        options: &PipelineOptions,
    ) -> Result<Vec<Box<dyn Step>>, PipelineError> {
        definition
            .after_steps
            .iter()
            .map(|entry| {
                let normalized = entry.normalize()?;
                Ok(step::from_definition(&normalized, options)?)
            })
            .collect()
    }

    /// The tag a commit of this run gets
    pub fn image_tag(&self) -> String {
        (self.image_tagger)(&self.options)
    }

    /// The message a commit of this run gets
    pub fn commit_message(&self) -> String {
        (self.commit_messager)(&self.options)
    }

    /// Repository committed images land in
    pub fn image_repository(&self) -> String {
        if self.options.application_id.is_empty() {
            format!("run/{}", self.options.pipeline_name)
        } else {
            self.options.application_id.to_lowercase()
        }
    }

    /// Seed the pipeline environment: documented vars, passthru from the
    /// host, and the optional env file.
    pub fn init_env<I>(&mut self, host_env: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let options = &self.options;
        let infix = options.kind.env_infix();
        let env = &mut self.env;

        env.add("WERCKER", "true");
        env.add("WERCKER_RUN_ID", &options.run_id);
        env.add("WERCKER_RUN_URL", &options.run_url());
        env.add(&format!("WERCKER_{}_ID", infix), &options.run_id);
        env.add(&format!("WERCKER_{}_URL", infix), &options.run_url());

        env.add("WERCKER_ROOT", &options.guest_path(&["source"]));
        env.add("WERCKER_SOURCE_DIR", &options.source_path());
        env.add("WERCKER_CACHE_DIR", &options.guest_path(&["cache"]));
        env.add("WERCKER_OUTPUT_DIR", &options.guest_path(&["output"]));
        env.add("WERCKER_PIPELINE_DIR", &options.guest_root);
        env.add("WERCKER_REPORT_DIR", &options.report_root);

        env.add("WERCKER_APPLICATION_ID", &options.application_id);
        env.add("WERCKER_APPLICATION_NAME", &options.application_name);
        env.add(
            "WERCKER_APPLICATION_OWNER_NAME",
            &options.application_owner_name,
        );
        env.add("WERCKER_APPLICATION_URL", &options.application_url);

        env.add("WERCKER_GIT_DOMAIN", &options.git_domain);
        env.add("WERCKER_GIT_OWNER", &options.git_owner);
        env.add("WERCKER_GIT_REPOSITORY", &options.git_repository);
        env.add("WERCKER_GIT_BRANCH", &options.git_branch);
        env.add("WERCKER_GIT_TAG", &options.git_tag);
        env.add("WERCKER_GIT_COMMIT", &options.git_commit);

        env.add("TERM", "xterm-256color");

        env.load_passthru(host_env);

        if let Some(env_file) = &options.env_file {
            let pairs = crate::fsutil::load_env_file(env_file)
                .map_err(|e| PipelineError::Other(e.to_string()))?;
            env.update(&pairs);
        }

        Ok(())
    }

    /// Prepare the guest: pipeline directories, then (for indirect
    /// mounts) copy the staged source and cache into place.
    pub async fn setup_guest(&self, session: &Session) -> Result<(), PipelineError> {
        session.hide_logs();
        let result = self.setup_guest_inner(session).await;
        session.show_logs();
        result
    }

    async fn setup_guest_inner(&self, session: &Session) -> Result<(), PipelineError> {
        let options = &self.options;

        let mkdirs = format!(
            "mkdir -p \"{}\" \"{}\" \"{}\" \"{}\"",
            options.guest_root,
            options.guest_path(&["output"]),
            options.report_path(&["artifacts"]),
            options.guest_path(&["cache"]),
        );
        let result = session.send_checked(&[&mkdirs]).await?;
        if !result.success() {
            return Err(PipelineError::Other(format!(
                "Failed to create pipeline directories: {}",
                result.error().unwrap_or_default()
            )));
        }

        if !options.direct_mount {
            let copy_source = format!(
                "cp -r \"{}/.\" \"{}\"",
                options.mnt_path(&["build"]),
                options.guest_root
            );
            let result = session.send_checked(&[&copy_source]).await?;
            if !result.success() {
                return Err(PipelineError::Other(format!(
                    "Failed to copy source into the pipeline directory: {}",
                    result.error().unwrap_or_default()
                )));
            }

            // Cache may legitimately be empty on a first run
            let copy_cache = format!(
                "if [ -d \"{mnt}\" ]; then cp -r \"{mnt}/.\" \"{guest}\"; fi",
                mnt = options.mnt_path(&["cache"]),
                guest = options.guest_path(&["cache"])
            );
            let result = session.send_checked(&[&copy_cache]).await?;
            if !result.success() {
                warn!("Cache copy failed, continuing without cache");
            }
        }

        Ok(())
    }

    /// Export the pipeline environment into the session
    pub async fn export_environment(&self, session: &Session) -> Result<(), PipelineError> {
        let lines = self.env.export();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        session.hide_logs();
        let result = session.send_checked(&refs).await;
        session.show_logs();
        let result = result?;
        if !result.success() {
            return Err(PipelineError::Other(format!(
                "Failed to export environment: {}",
                result.error().unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Round-trip the container's environment back into the runner.
    ///
    /// Prefers `env --null`; a container without it falls back to the
    /// newline-split form, where values with embedded newlines are lost
    /// (a warning event is emitted).
    pub async fn sync_environment(
        &mut self,
        session: &Session,
        emitter: &Emitter,
    ) -> Result<(), PipelineError> {
        session.hide_logs();
        let result = session.send_checked(&["env --null || env"]).await;
        session.show_logs();
        let result = result?;
        if !result.success() {
            return Err(PipelineError::Other(format!(
                "Failed to read container environment: {}",
                result.error().unwrap_or_default()
            )));
        }

        let mut pairs: Vec<(String, String)> = Vec::new();
        let null_separated = result.output.iter().any(|l| l.contains('\0'));
        if null_separated {
            for line in &result.output {
                for piece in line.split('\0') {
                    if let Some((k, v)) = piece.split_once('=') {
                        pairs.push((k.to_string(), v.to_string()));
                    }
                }
            }
        } else {
            emitter.emit_log(
                &self.options.run_id,
                "",
                LogStream::Stderr,
                "Warning: env sync fell back to newline splitting; multi-line values are dropped\n",
                false,
            );
            for line in &result.output {
                if let Some((k, v)) = line.split_once('=') {
                    pairs.push((k.to_string(), v.to_string()));
                }
            }
        }

        debug!("Synced {} env vars from the container", pairs.len());
        self.env.update(&pairs);
        Ok(())
    }

    /// The pipeline-level artifact: the output dir, or the source dir
    /// when the output dir came back empty.
    pub async fn collect_artifact(
        &self,
        artificer: &Artificer,
        container_id: &str,
    ) -> Result<Artifact, PipelineError> {
        let options = &self.options;
        let artifact = Artifact {
            container_id: container_id.to_string(),
            guest_path: options.guest_path(&["output"]),
            host_path: options.output_dir(),
            host_tar_path: options.host_path(&["output.tar"]),
            application_id: options.application_id.clone(),
            run_id: options.run_id.clone(),
            step_safe_id: None,
            bucket: "artifacts".to_string(),
            content_type: "application/x-tar".to_string(),
            ..Default::default()
        };

        artificer
            .collect_with_fallback(&artifact, &options.source_path())
            .await?;
        Ok(artifact)
    }

    /// Export the guest cache back to the host cache directory
    pub async fn collect_cache(
        &self,
        artificer: &Artificer,
        container_id: &str,
    ) -> Result<(), PipelineError> {
        let options = &self.options;
        let artifact = Artifact {
            container_id: container_id.to_string(),
            guest_path: options.guest_path(&["cache"]),
            host_path: options.cache_path(),
            host_tar_path: options.host_path(&["cache.tar"]),
            application_id: options.application_id.clone(),
            run_id: options.run_id.clone(),
            ..Default::default()
        };

        match artificer.collect_capped(&artifact, CACHE_SIZE_CAP).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_empty_tarball() => {
                debug!("No cache to collect");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Log the collected artifact's file listing and total size,
    /// skipping dependency dirs nobody wants to scroll past.
    pub fn emit_artifact_listing(&self, emitter: &Emitter, host_dir: &Path) {
        const IGNORED: &[&str] = &[".git", "node_modules", "vendor", "site-packages"];

        let mut total: u64 = 0;
        for entry in walkdir::WalkDir::new(host_dir)
            .into_iter()
            .filter_entry(|e| {
                !IGNORED
                    .iter()
                    .any(|skip| e.file_name().to_string_lossy() == *skip)
            })
            .flatten()
        {
            if entry.file_type().is_file() {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                total += size;
                if let Ok(relative) = entry.path().strip_prefix(host_dir) {
                    emitter.emit_log(
                        &self.options.run_id,
                        "",
                        LogStream::Stdout,
                        format!("{}\n", relative.display()),
                        false,
                    );
                }
            }
        }

        emitter.emit_log(
            &self.options.run_id,
            "",
            LogStream::Stdout,
            format!("Artifact size: {} bytes\n", total),
            false,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
box: ubuntu:22.04
build:
  steps:
    - script:
        name: tests
        code: make test
deploy:
  box: alpine
  docker: true
  steps:
    - script:
        code: ./ship.sh
"#;

    fn options(kind: PipelineKind, name: &str) -> PipelineOptions {
        PipelineOptions {
            run_id: "r1".to_string(),
            pipeline_name: name.to_string(),
            kind,
            application_id: "acme/app".to_string(),
            git_branch: "main".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_from_config_uses_box_override() {
        let config = Config::from_str(YAML).unwrap();

        let build =
            Pipeline::from_config(&config, &options(PipelineKind::Build, "build")).unwrap();
        assert_eq!(build.box_definition.id, "ubuntu:22.04");
        assert!(!build.docker_access);
        assert_eq!(build.steps.len(), 1);

        let deploy =
            Pipeline::from_config(&config, &options(PipelineKind::Deploy, "deploy")).unwrap();
        assert_eq!(deploy.box_definition.id, "alpine");
        assert!(deploy.docker_access);
    }

    #[test]
    fn test_behavior_fields_differ_by_kind() {
        let config = Config::from_str(YAML).unwrap();

        let build =
            Pipeline::from_config(&config, &options(PipelineKind::Build, "build")).unwrap();
        assert_eq!(build.image_tag(), "build-r1");
        assert_eq!(build.commit_message(), "Build r1");

        let deploy =
            Pipeline::from_config(&config, &options(PipelineKind::Deploy, "deploy")).unwrap();
        assert_eq!(deploy.image_tag(), "deploy-r1");
        assert_eq!(deploy.image_repository(), "acme/app");
    }

    #[test]
    fn test_init_env_injects_documented_vars() {
        let config = Config::from_str(YAML).unwrap();
        let mut pipeline =
            Pipeline::from_config(&config, &options(PipelineKind::Build, "build")).unwrap();

        pipeline
            .init_env(vec![
                ("X_FROM_HOST".to_string(), "yes".to_string()),
                ("UNRELATED".to_string(), "no".to_string()),
            ])
            .unwrap();

        let env = &pipeline.env;
        assert_eq!(env.get("WERCKER"), Some("true"));
        assert_eq!(env.get("WERCKER_RUN_ID"), Some("r1"));
        assert_eq!(env.get("WERCKER_BUILD_ID"), Some("r1"));
        assert_eq!(env.get("WERCKER_SOURCE_DIR"), Some("/pipeline/source"));
        assert_eq!(env.get("WERCKER_OUTPUT_DIR"), Some("/pipeline/output"));
        assert_eq!(env.get("WERCKER_GIT_BRANCH"), Some("main"));
        assert_eq!(env.get("TERM"), Some("xterm-256color"));
        assert_eq!(env.get("FROM_HOST"), Some("yes"));
        assert_eq!(env.get("UNRELATED"), None);
    }

    #[test]
    fn test_pipeline_result_export() {
        let passed = PipelineResult {
            success: true,
            ..Default::default()
        };
        assert_eq!(
            passed.export(),
            vec![("WERCKER_RESULT".to_string(), "passed".to_string())]
        );

        let failed = PipelineResult {
            success: false,
            failed_step_name: "tests".to_string(),
            failed_step_message: "boom".to_string(),
        };
        let pairs = failed.export();
        assert_eq!(pairs[0].1, "failed");
        assert_eq!(pairs[1].1, "tests");
        assert_eq!(pairs[2].1, "boom");
    }
}
