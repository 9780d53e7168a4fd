//! wincage-host - privileged side of a container
//!
//! Started once per container by the runtime. It opens the container's
//! resource group, listens on the container's named pipe and serves the
//! supervisor's `CreateProcess`, `FindProcessById` and `StopAllProcesses`
//! requests until the supervisor disconnects.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

/// Serve process requests for one container
#[derive(Parser, Debug)]
#[command(name = "wincage-host")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Privileged process host for a wincage container", long_about = None)]
struct Cli {
    /// Named pipe to listen on (\\.\pipe\...)
    #[arg(long)]
    pipe: String,

    /// Name of the container's resource group
    #[arg(long)]
    group: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log directory override
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(windows)]
async fn run(cli: Cli) -> Result<()> {
    use std::sync::Arc;

    use anyhow::Context;
    use tokio::net::windows::named_pipe::ServerOptions;
    use tracing::{info, warn};

    use wincage::config::AppConfig;
    use wincage::host::launcher::JobProcessLauncher;
    use wincage::host::HostServer;
    use wincage::job::ResourceGroup;
    use wincage::logging::init_logging;

    let config = AppConfig::load()?;
    let log_level = cli.log_level.unwrap_or(config.log_level);
    let log_dir = cli.log_dir.unwrap_or(config.log_dir);
    init_logging(&log_level, &log_dir, &format!("{}.log", cli.group))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pipe = %cli.pipe,
        group = %cli.group,
        "Starting wincage host"
    );

    let group = Arc::new(
        ResourceGroup::open_existing(&cli.group)
            .with_context(|| format!("Failed to open resource group {}", cli.group))?,
    );

    let pipe = ServerOptions::new()
        .first_pipe_instance(true)
        .create(&cli.pipe)
        .with_context(|| format!("Failed to create pipe {}", cli.pipe))?;
    pipe.connect()
        .await
        .context("Supervisor failed to connect")?;
    info!("Supervisor connected");

    let (reader, writer) = tokio::io::split(pipe);
    let server = Arc::new(HostServer::new(JobProcessLauncher::new(group.clone())));

    tokio::select! {
        result = server.serve(reader, writer) => {
            result.context("Host connection failed")?;
            info!("Supervisor disconnected");
        }
        _ = shutdown_signal() => {
            warn!("Shutdown signal received");
        }
    }

    group.dispose();
    info!("wincage host stopped");
    Ok(())
}

#[cfg(not(windows))]
async fn run(cli: Cli) -> Result<()> {
    anyhow::bail!(
        "wincage-host needs Windows Job Objects (pipe {}, group {})",
        cli.pipe,
        cli.group
    )
}

/// Resolve on Ctrl+C; never resolves when the handler cannot be installed
#[cfg(windows)]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}
