//! Script and registry steps, executed through the shell session

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::registry::{PropertyDefinition, StepManifest};
use super::{
    parse_step_id, safe_id_for, ExecContext, Step, StepContext, StepError, StepId, StepOutcome,
    StepResult, RUNNER_VERSION,
};
use crate::artifact::Artifact;
use crate::config::StepDefinition;
use crate::core::{Environment, PipelineOptions};

/// Where a step's files come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    /// Inline code written to `run.sh`
    Script,
    /// Local directory referenced by a `file://` url (dev mode only)
    File,
    /// Package fetched from the step registry
    Registry,
}

/// A step defined in the pipeline configuration
pub struct ExternalStep {
    step_id: StepId,
    kind: StepKind,
    safe_id: String,
    display_name: String,
    cwd: Option<String>,
    checkpoint: Option<String>,
    data: BTreeMap<String, String>,
    version: String,
    properties: BTreeMap<String, PropertyDefinition>,
    sync_environment: bool,
}

impl ExternalStep {
    pub fn from_definition(
        definition: &StepDefinition,
        _options: &PipelineOptions,
    ) -> StepResult<Self> {
        let step_id = parse_step_id(&definition.id);

        let kind = if step_id.name == "script" {
            StepKind::Script
        } else if step_id
            .url
            .as_deref()
            .map(|u| u.starts_with("file://"))
            .unwrap_or(false)
        {
            StepKind::File
        } else {
            StepKind::Registry
        };

        let version = match kind {
            // Synthesized: scripts have no registry version
            StepKind::Script => RUNNER_VERSION.to_string(),
            _ => step_id.version.clone(),
        };

        let display_name = definition
            .name
            .clone()
            .unwrap_or_else(|| step_id.name.clone());

        Ok(Self {
            safe_id: safe_id_for(&step_id.name),
            step_id,
            kind,
            display_name,
            cwd: definition.cwd.clone(),
            checkpoint: definition.checkpoint.clone(),
            data: definition.data.clone(),
            version,
            properties: BTreeMap::new(),
            sync_environment: false,
        })
    }

    /// Resolved version: pinned, registry-resolved, or the runner's own
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Per-run host directory holding this step's files
    fn host_root(&self, options: &PipelineOptions) -> PathBuf {
        options.host_path(&[&self.safe_id])
    }

    /// The same directory as seen from inside the container
    fn guest_root(&self, options: &PipelineOptions) -> String {
        options.guest_path(&[&self.safe_id])
    }

    fn env_var_name(&self, key: &str) -> String {
        format!(
            "WERCKER_{}_{}",
            self.step_id.name.to_uppercase().replace('-', "_"),
            key.to_uppercase().replace('-', "_")
        )
    }

    async fn fetch_script(&self, ctx: &StepContext) -> StepResult<()> {
        let code = self
            .data
            .get("code")
            .ok_or_else(|| StepError::Config("script step has no code".to_string()))?;

        let mut content = if code.starts_with("#!") {
            code.clone()
        } else {
            format!("set -e\n{}", code)
        };
        if !content.ends_with('\n') {
            content.push('\n');
        }

        let root = self.host_root(&ctx.options);
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::write(root.join("run.sh"), content).await?;
        Ok(())
    }

    async fn fetch_file(&mut self, ctx: &StepContext) -> StepResult<()> {
        if !ctx.options.enable_dev_steps {
            return Err(StepError::Fetch(
                "file:// steps are only allowed in dev mode".to_string(),
            ));
        }

        let url = self.step_id.url.as_deref().unwrap_or_default();
        let source = PathBuf::from(url.trim_start_matches("file://"));
        if !source.is_dir() {
            return Err(StepError::Fetch(format!(
                "step directory {} does not exist",
                source.display()
            )));
        }

        // Link into the shared cache so repeated runs resolve instantly
        let cache_link = ctx
            .options
            .step_path()
            .join(format!("{}-{}", self.step_id.owner, self.step_id.name));
        std::fs::create_dir_all(ctx.options.step_path())?;
        if cache_link.symlink_metadata().is_err() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(&source, &cache_link)?;
        }

        let root = self.host_root(&ctx.options);
        crate::fsutil::copy_tree(&source, &root)
            .map_err(|e| StepError::Fetch(e.to_string()))?;

        self.apply_manifest(&root)?;
        Ok(())
    }

    async fn fetch_registry(&mut self, ctx: &StepContext) -> StepResult<()> {
        let info = ctx
            .registry
            .resolve(&self.step_id.owner, &self.step_id.name, &self.step_id.version)
            .await?;

        let cached = ctx
            .registry
            .fetch_tarball(
                &info,
                &ctx.options.step_path(),
                &self.step_id.owner,
                &self.step_id.name,
            )
            .await?;

        self.version = info.version.number.clone();

        let root = self.host_root(&ctx.options);
        crate::fsutil::copy_tree(&cached, &root)
            .map_err(|e| StepError::Fetch(e.to_string()))?;

        self.apply_manifest(&root)?;
        Ok(())
    }

    fn apply_manifest(&mut self, step_dir: &std::path::Path) -> StepResult<()> {
        if let Some(manifest) = StepManifest::load(step_dir)? {
            self.properties = manifest.properties;
            self.sync_environment = manifest.sync_environment;
            if self.display_name == self.step_id.name {
                if let Some(name) = manifest.name {
                    self.display_name = name;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step for ExternalStep {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn id(&self) -> &str {
        &self.step_id.name
    }

    fn owner(&self) -> &str {
        &self.step_id.owner
    }

    fn safe_id(&self) -> &str {
        &self.safe_id
    }

    fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    fn checkpoint(&self) -> Option<&str> {
        self.checkpoint.as_deref()
    }

    fn should_sync_env(&self) -> bool {
        self.sync_environment
    }

    async fn fetch(&mut self, ctx: &StepContext) -> StepResult<()> {
        match self.kind {
            StepKind::Script => self.fetch_script(ctx).await,
            StepKind::File => self.fetch_file(ctx).await,
            StepKind::Registry => self.fetch_registry(ctx).await,
        }
    }

    fn init_env(&mut self, ctx: &StepContext, env: &mut Environment) -> StepResult<()> {
        let options = &ctx.options;

        env.add("WERCKER_STEP_ROOT", &self.guest_root(options));
        env.add("WERCKER_STEP_ID", &self.safe_id);
        env.add("WERCKER_STEP_OWNER", &self.step_id.owner);
        env.add("WERCKER_STEP_NAME", &self.step_id.name);
        env.add(
            "WERCKER_REPORT_NUMBERS_FILE",
            &options.report_path(&["numbers.ini"]),
        );
        env.add(
            "WERCKER_REPORT_MESSAGE_FILE",
            &options.report_path(&["message.txt"]),
        );
        env.add(
            "WERCKER_REPORT_ARTIFACTS_DIR",
            &options.report_path(&["artifacts"]),
        );

        for (key, property) in &self.properties {
            if let Some(default) = &property.default {
                env.add(&self.env_var_name(key), default);
            }
        }

        for (key, value) in &self.data {
            if self.kind == StepKind::Script && key == "code" {
                continue;
            }
            env.add(&self.env_var_name(key), value);
        }

        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        let session = &ctx.session;
        let options = &ctx.options;

        // Exports never show up in user logs
        let export_lines = ctx.env.export();
        let refs: Vec<&str> = export_lines.iter().map(String::as_str).collect();
        session.send_with_hidden(true, &refs).await?;

        let workdir = match &self.cwd {
            Some(cwd) if cwd.starts_with('/') => cwd.clone(),
            Some(cwd) => format!("{}/{}", options.source_path(), cwd),
            None => options.source_path(),
        };
        let cd = session
            .send_checked(&[&format!("cd \"{}\"", workdir)])
            .await?;
        if let Some(failure) = &cd.failure {
            return Err(StepError::Session(failure.clone()));
        }
        if !cd.success() {
            warn!("Could not enter {}", workdir);
            return Ok(cd.exit_code);
        }

        let guest_root = self.guest_root(options);
        let host_root = self.host_root(options);

        if host_root.join("init.sh").is_file() {
            let init = session
                .send_checked(&[&format!("source \"{}/init.sh\"", guest_root)])
                .await?;
            if let Some(failure) = &init.failure {
                return Err(StepError::Session(failure.clone()));
            }
            if !init.success() {
                debug!("init.sh failed with exit {}", init.exit_code);
                return Ok(init.exit_code);
            }
        }

        if host_root.join("run.sh").is_file() {
            let run = session
                .send_checked(&[&format!("source \"{}/run.sh\" < /dev/null", guest_root)])
                .await?;
            if let Some(failure) = &run.failure {
                return Err(StepError::Session(failure.clone()));
            }
            return Ok(run.exit_code);
        }

        Ok(0)
    }

    async fn collect(&self, ctx: &ExecContext, outcome: &mut StepOutcome) -> StepResult<()> {
        let container_id = ctx.container_id().await?;
        let options = &ctx.options;

        // The message file is optional; an empty tarball is not a failure
        match ctx
            .artificer
            .read_file(&container_id, &options.report_path(&["message.txt"]))
            .await
        {
            Ok(bytes) => outcome.message = String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.is_empty_tarball() => {}
            Err(e) => return Err(e.into()),
        }

        if options.should_artifacts {
            let artifact = Artifact {
                container_id: container_id.clone(),
                guest_path: options.report_path(&["artifacts"]),
                host_path: options.host_path(&["artifacts", &self.safe_id]),
                host_tar_path: options.host_path(&[
                    "artifacts",
                    &self.safe_id,
                    "artifacts.tar",
                ]),
                application_id: options.application_id.clone(),
                run_id: options.run_id.clone(),
                step_safe_id: Some(self.safe_id.clone()),
                bucket: "step-artifacts".to_string(),
                content_type: "application/x-tar".to_string(),
                ..Default::default()
            };

            match ctx.artificer.collect(&artifact).await {
                Ok(()) => {
                    if let Some(store) = &ctx.store {
                        ctx.artificer.upload(store.as_ref(), &artifact).await?;
                    }
                    outcome.artifact = Some(artifact);
                }
                Err(e) if e.is_empty_tarball() => {
                    debug!("Step {} produced no artifacts", self.safe_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    async fn clean(&self, ctx: &StepContext) {
        let root = self.host_root(&ctx.options);
        if root.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&root).await {
                debug!("Step cleanup of {} failed: {}", root.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepRegistry;
    use tempfile::TempDir;

    fn context(tmp: &TempDir) -> StepContext {
        StepContext {
            options: PipelineOptions {
                run_id: "run1".to_string(),
                working_dir: tmp.path().to_path_buf(),
                ..Default::default()
            },
            registry: StepRegistry::new("http://registry.invalid"),
        }
    }

    fn script_definition(code: &str) -> StepDefinition {
        let mut data = BTreeMap::new();
        data.insert("code".to_string(), code.to_string());
        StepDefinition {
            id: "script".to_string(),
            data,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_script_fetch_prefixes_set_e() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut step =
            ExternalStep::from_definition(&script_definition("echo hi"), &ctx.options).unwrap();

        step.fetch(&ctx).await.unwrap();

        let run_sh = ctx
            .options
            .host_path(&[step.safe_id()])
            .join("run.sh");
        let content = std::fs::read_to_string(run_sh).unwrap();
        assert_eq!(content, "set -e\necho hi\n");
    }

    #[tokio::test]
    async fn test_script_fetch_keeps_shebang() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut step = ExternalStep::from_definition(
            &script_definition("#!/bin/sh\necho hi"),
            &ctx.options,
        )
        .unwrap();

        step.fetch(&ctx).await.unwrap();

        let content = std::fs::read_to_string(
            ctx.options.host_path(&[step.safe_id()]).join("run.sh"),
        )
        .unwrap();
        assert!(content.starts_with("#!/bin/sh\n"));
    }

    #[test]
    fn test_init_env_sets_step_vars() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let mut definition = script_definition("echo hi");
        definition.id = "acme/deploy-tool@2.0".to_string();
        definition
            .data
            .insert("target".to_string(), "prod".to_string());
        let mut step = ExternalStep::from_definition(&definition, &ctx.options).unwrap();
        step.properties.insert(
            "region".to_string(),
            PropertyDefinition {
                default: Some("us-east".to_string()),
                required: false,
            },
        );

        let mut env = Environment::new();
        step.init_env(&ctx, &mut env).unwrap();

        assert_eq!(env.get("WERCKER_STEP_OWNER"), Some("acme"));
        assert_eq!(env.get("WERCKER_STEP_NAME"), Some("deploy-tool"));
        assert_eq!(
            env.get("WERCKER_REPORT_MESSAGE_FILE"),
            Some("/report/message.txt")
        );
        assert_eq!(env.get("WERCKER_DEPLOY_TOOL_REGION"), Some("us-east"));
        assert_eq!(env.get("WERCKER_DEPLOY_TOOL_TARGET"), Some("prod"));
        assert!(env.get("WERCKER_STEP_ROOT").unwrap().starts_with("/pipeline/"));
    }

    #[test]
    fn test_file_step_requires_dev_mode() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let definition = StepDefinition {
            id: "acme/local-step \"file:///tmp/steps/local\"".to_string(),
            ..Default::default()
        };
        let mut step = ExternalStep::from_definition(&definition, &ctx.options).unwrap();
        assert_eq!(step.kind, StepKind::File);

        let err = tokio_test::block_on(step.fetch(&ctx)).unwrap_err();
        assert!(matches!(err, StepError::Fetch(_)));
    }
}
