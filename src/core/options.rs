//! Resolved per-run options and path derivations

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;

/// Which flavor of pipeline a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Build,
    Deploy,
}

impl PipelineKind {
    /// Env var infix (`WERCKER_BUILD_ID` vs `WERCKER_DEPLOY_ID`)
    pub fn env_infix(&self) -> &'static str {
        match self {
            PipelineKind::Build => "BUILD",
            PipelineKind::Deploy => "DEPLOY",
        }
    }

    /// Name of the `latest` symlink maintained under the working dir
    pub fn symlink_name(&self) -> &'static str {
        match self {
            PipelineKind::Build => "latest",
            PipelineKind::Deploy => "latest_deploy",
        }
    }
}

/// Resolved options for a single pipeline run.
///
/// Built once from external configuration, immutable afterwards. All path
/// helpers are pure derivations from the fields.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Opaque unique token for this run
    pub run_id: String,

    /// Which pipeline in the definition file to execute
    pub pipeline_name: String,

    /// Pipeline flavor (drives env var names and symlinks)
    pub kind: PipelineKind,

    pub application_id: String,
    pub application_name: String,
    pub application_owner_name: String,
    pub application_url: String,

    /// Host root under which builds/, cache/, steps/, projects/ live
    pub working_dir: PathBuf,

    /// Pipeline directory inside the container (default `/pipeline`)
    pub guest_root: String,

    /// Read-only staging root inside the container (default `/mnt`)
    pub mnt_root: String,

    /// Report root inside the container (default `/report`)
    pub report_root: String,

    /// Local source checkout to copy into the run
    pub project_path: PathBuf,

    /// Remote tarball to download instead of copying `project_path`
    pub project_url: Option<String>,

    /// Workflow fan-in: upstream pipeline name -> its output directory
    pub project_paths_by_pipeline: HashMap<String, PathBuf>,

    /// Bound on a single command inside the session, in milliseconds
    pub command_timeout_ms: u64,

    /// Bound on silence between two session reads, in milliseconds
    pub no_response_timeout_ms: u64,

    pub should_artifacts: bool,
    pub should_store: bool,
    pub should_commit: bool,
    /// Remove the base container during clean
    pub should_remove: bool,

    /// Mount step/source/cache read-write at the guest path directly
    pub direct_mount: bool,

    /// Publish the box's exposed ports on the host
    pub expose_ports: bool,

    /// Resume from this checkpoint name ("" = disabled)
    pub checkpoint: String,

    /// Commit a checkpoint image after steps that declare one
    pub checkpoint_commit: bool,

    /// Extra env file loaded into the pipeline environment
    pub env_file: Option<PathBuf>,

    /// Allow `file://` steps and checkpoint skipping
    pub enable_dev_steps: bool,

    /// Resolve images against the local daemon only, never pull
    pub local_only: bool,

    /// Explicit docker daemon endpoint ("" = local defaults)
    pub docker_host: String,

    /// Externally supplied docker network name ("" = create per run)
    pub network_name: String,

    /// Memory limit for the run in MiB (0 = unlimited); split 75/25
    /// between the base container and its services
    pub memory_mb: u64,

    /// Source subdirectory inside the checkout ("" = repo root)
    pub source_dir: String,

    /// Ignore file consulted when copying the project ("" = .gitignore)
    pub ignore_file: String,

    pub git_domain: String,
    pub git_owner: String,
    pub git_repository: String,
    pub git_branch: String,
    pub git_commit: String,
    pub git_tag: String,

    /// Base URL reported in WERCKER_*_URL vars
    pub base_url: String,
}

impl PipelineOptions {
    /// Root of all build run directories: `<workingDir>/builds`
    pub fn build_path(&self) -> PathBuf {
        self.working_dir.join("builds")
    }

    /// Shared cache surviving across runs: `<workingDir>/cache`
    pub fn cache_path(&self) -> PathBuf {
        self.working_dir.join("cache")
    }

    /// Step cache: `<workingDir>/steps`
    pub fn step_path(&self) -> PathBuf {
        self.working_dir.join("steps")
    }

    /// Exported container images: `<workingDir>/containers`
    pub fn container_path(&self) -> PathBuf {
        self.working_dir.join("containers")
    }

    /// Downloaded project tarballs: `<workingDir>/projects`
    pub fn project_download_path(&self) -> PathBuf {
        self.working_dir.join("projects")
    }

    /// Host path inside this run's build dir
    pub fn host_path(&self, parts: &[&str]) -> PathBuf {
        let mut p = self.build_path().join(&self.run_id);
        for part in parts {
            p = p.join(part);
        }
        p
    }

    /// Guest path under the pipeline root
    pub fn guest_path(&self, parts: &[&str]) -> String {
        join_guest(&self.guest_root, parts)
    }

    /// Guest path under the read-only staging root
    pub fn mnt_path(&self, parts: &[&str]) -> String {
        join_guest(&self.mnt_root, parts)
    }

    /// Guest path under the report root
    pub fn report_path(&self, parts: &[&str]) -> String {
        join_guest(&self.report_root, parts)
    }

    /// Host directory the project is materialized into
    pub fn project_dir(&self) -> PathBuf {
        self.host_path(&["source"])
    }

    /// Host directory step artifacts and reports land in
    pub fn output_dir(&self) -> PathBuf {
        self.host_path(&["output"])
    }

    /// Guest source directory, honoring `source-dir`
    pub fn source_path(&self) -> String {
        if self.source_dir.is_empty() {
            self.guest_path(&["source"])
        } else {
            self.guest_path(&["source", &self.source_dir])
        }
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.command_timeout_ms)
    }

    pub fn no_response_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.no_response_timeout_ms)
    }

    /// Pipeline run URL reported to steps
    pub fn run_url(&self) -> String {
        format!("{}/runs/{}", self.base_url.trim_end_matches('/'), self.run_id)
    }
}

fn join_guest(root: &str, parts: &[&str]) -> String {
    let mut s = root.trim_end_matches('/').to_string();
    for part in parts {
        s.push('/');
        s.push_str(part.trim_matches('/'));
    }
    s
}

/// Split an `owner/name` application id into its parts
pub fn parse_application_id(value: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = value.split('/').collect();
    if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
        Ok((parts[0].to_string(), parts[1].to_string()))
    } else {
        Err(format!("Unable to parse application id: {}", value))
    }
}

/// Whether a string looks like a 24-hex-digit build id
pub fn is_build_id(value: &str) -> bool {
    let re = Regex::new(r"^[0-9a-fA-F]{24}$").unwrap();
    re.is_match(value)
}

/// Default guest pipeline root
pub fn default_guest_root() -> String {
    "/pipeline".to_string()
}

/// Default read-only staging root
pub fn default_mnt_root() -> String {
    "/mnt".to_string()
}

/// Default report root
pub fn default_report_root() -> String {
    "/report".to_string()
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            pipeline_name: "build".to_string(),
            kind: PipelineKind::Build,
            application_id: String::new(),
            application_name: String::new(),
            application_owner_name: String::new(),
            application_url: String::new(),
            working_dir: PathBuf::from(".wercker"),
            guest_root: default_guest_root(),
            mnt_root: default_mnt_root(),
            report_root: default_report_root(),
            project_path: PathBuf::from("."),
            project_url: None,
            project_paths_by_pipeline: HashMap::new(),
            command_timeout_ms: 25 * 60 * 1000,
            no_response_timeout_ms: 5 * 60 * 1000,
            should_artifacts: false,
            should_store: false,
            should_commit: false,
            should_remove: true,
            direct_mount: false,
            expose_ports: false,
            checkpoint: String::new(),
            checkpoint_commit: false,
            env_file: None,
            enable_dev_steps: false,
            local_only: false,
            docker_host: String::new(),
            network_name: String::new(),
            memory_mb: 0,
            source_dir: String::new(),
            ignore_file: String::new(),
            git_domain: String::new(),
            git_owner: String::new(),
            git_repository: String::new(),
            git_branch: String::new(),
            git_commit: String::new(),
            git_tag: String::new(),
            base_url: "http://localhost".to_string(),
        }
    }
}

/// Host symlink maintenance: `latest -> builds/<runID>`
pub fn update_symlink(options: &PipelineOptions) -> std::io::Result<()> {
    let link = options.working_dir.join(options.kind.symlink_name());
    let target = Path::new("builds").join(&options.run_id);
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(&link)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, &link)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> PipelineOptions {
        PipelineOptions {
            run_id: "abc123".to_string(),
            working_dir: PathBuf::from("/work"),
            ..Default::default()
        }
    }

    #[test]
    fn test_host_path_nests_under_run() {
        let opts = options();
        assert_eq!(
            opts.host_path(&["source", "app"]),
            PathBuf::from("/work/builds/abc123/source/app")
        );
    }

    #[test]
    fn test_guest_paths() {
        let opts = options();
        assert_eq!(opts.guest_path(&["source"]), "/pipeline/source");
        assert_eq!(opts.mnt_path(&["cache"]), "/mnt/cache");
        assert_eq!(opts.report_path(&["artifacts"]), "/report/artifacts");
    }

    #[test]
    fn test_source_path_honors_source_dir() {
        let mut opts = options();
        assert_eq!(opts.source_path(), "/pipeline/source");
        opts.source_dir = "app".to_string();
        assert_eq!(opts.source_path(), "/pipeline/source/app");
    }

    #[test]
    fn test_parse_application_id() {
        assert_eq!(
            parse_application_id("a/b").unwrap(),
            ("a".to_string(), "b".to_string())
        );
        assert!(parse_application_id("nope").is_err());
        assert!(parse_application_id("a/b/c").is_err());
        assert!(parse_application_id("/b").is_err());
    }

    #[test]
    fn test_is_build_id() {
        assert!(is_build_id("54e5dde34e104f675e007e3b"));
        assert!(is_build_id("ABCDEFABCDEFABCDEFABCDEF"));
        assert!(!is_build_id("54e5dde34e104f675e007e3"));
        assert!(!is_build_id("not-hex-at-all-but-24chr"));
    }

    #[test]
    fn test_kind_helpers() {
        assert_eq!(PipelineKind::Build.env_infix(), "BUILD");
        assert_eq!(PipelineKind::Deploy.symlink_name(), "latest_deploy");
    }
}
