//! CLI subcommands

pub mod root;
pub mod workflow;

use std::path::PathBuf;

use clap::{Args, Subcommand};

pub use workflow::WorkflowArgs;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a build pipeline
    Build(RunArgs),

    /// Run a deploy pipeline
    Deploy(RunArgs),

    /// Run a workflow of pipelines
    Workflow(WorkflowArgs),
}

/// Options shared by build and deploy
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Project directory to run against
    #[arg(default_value = ".")]
    pub target: PathBuf,

    /// Pipeline definition file
    #[arg(short = 'f', long, default_value = "wercker.yml")]
    pub config: PathBuf,

    /// Pipeline section to execute (defaults to build/deploy)
    #[arg(long)]
    pub pipeline: Option<String>,

    /// Host directory for builds, cache, and steps
    #[arg(long, default_value = ".wercker")]
    pub working_dir: PathBuf,

    /// Docker daemon endpoint
    #[arg(long, env = "DOCKER_HOST", default_value = "")]
    pub docker_host: String,

    /// Commit the box when the pipeline passes
    #[arg(long)]
    pub commit: bool,

    /// Collect and keep pipeline artifacts
    #[arg(long)]
    pub artifacts: bool,

    /// Upload collected artifacts to the store
    #[arg(long)]
    pub store: bool,

    /// Root of the filesystem artifact store
    #[arg(long)]
    pub store_path: Option<PathBuf>,

    /// Mount the project read-write instead of copying it
    #[arg(long)]
    pub direct_mount: bool,

    /// Publish the box's exposed ports on the host
    #[arg(long)]
    pub expose_ports: bool,

    /// Only use locally available images, never pull
    #[arg(long)]
    pub docker_local: bool,

    /// Enable dev-only behavior (file:// steps, checkpoints)
    #[arg(long)]
    pub enable_dev_steps: bool,

    /// Resume from this checkpoint
    #[arg(long, default_value = "")]
    pub checkpoint: String,

    /// Commit a checkpoint image after steps that declare one
    #[arg(long)]
    pub commit_checkpoints: bool,

    /// Extra environment file for the pipeline
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Memory limit for the run, MiB (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub memory: u64,

    /// Application id as owner/name
    #[arg(long)]
    pub application_id: Option<String>,

    /// Step registry endpoint
    #[arg(long, default_value = "https://steps.wercker.com")]
    pub step_registry: String,

    /// Existing docker network to join instead of creating one
    #[arg(long)]
    pub network: Option<String>,

    /// Subdirectory of the checkout to treat as the source
    #[arg(long)]
    pub source_dir: Option<String>,

    /// Ignore file consulted when copying the project
    #[arg(long)]
    pub ignore_file: Option<String>,

    /// Remote docker daemon endpoint for pipelines with docker access
    #[arg(long)]
    pub rdd: Option<String>,
}
