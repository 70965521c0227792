//! CLI entrypoint for the pipeline runner

use anyhow::Result;
use clap::Parser;
use tracing::error;

use wercker::cmd::{self, Commands};
use wercker::core::PipelineKind;

#[derive(Parser)]
#[command(name = "wercker")]
#[command(about = "Container-based CI/CD pipeline runner")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("wercker={}", log_level).into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match &cli.command {
        Commands::Build(args) => cmd::root::run(PipelineKind::Build, args).await,
        Commands::Deploy(args) => cmd::root::run(PipelineKind::Deploy, args).await,
        Commands::Workflow(args) => cmd::workflow::run(args).await,
    };

    match exit_code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
