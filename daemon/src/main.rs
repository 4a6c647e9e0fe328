//! sandbox-runner daemon
//!
//! MCP server that runs untrusted code in locked-down containers.
//! Configuration comes from `--config` or the `SANDBOX_RUNNER_CONFIG`
//! env var (JSON); with neither, built-in defaults apply.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbox_runner_daemon::{
    backend::DockerBackend, config::Config, mcp, orchestrator::Orchestrator,
};

#[derive(Parser, Debug)]
#[command(name = "sandbox-runner-daemon")]
#[command(about = "MCP server for running untrusted code in resource-limited containers")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    info!(
        runtime = %config.runtime.binary,
        max_parallel = config.admission.max_parallel,
        max_queued = ?config.admission.max_queued,
        log_path = %config.log_path.display(),
        "Loaded configuration"
    );

    let backend = DockerBackend::from_config(&config.runtime);
    let orchestrator = Orchestrator::new(&config, backend)?;

    if args.stdio {
        mcp::serve_stdio(orchestrator).await?;
    } else {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    Ok(())
}
