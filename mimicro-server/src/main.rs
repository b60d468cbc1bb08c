//! Mimicro - configuration-driven HTTP mock servers with request statistics

mod coordinator;
mod endpoint;
mod listener;
mod management;
mod response;
mod server;
mod stats;
mod template;

#[cfg(test)]
mod test_client;

use anyhow::Result;
use clap::Parser;
use coordinator::Coordinator;
use mimicro_common::MimicroConfig;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "mimicro", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mimicro_server=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Relative file bodies are resolved against the directory of the config
    let base_dir = config_dir(&cli.config);
    let config = match load_config(&cli.config, &base_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config is not valid. See errors below:\n {:#}", e);
            std::process::exit(1);
        }
    };

    if cli.check {
        println!("Config is valid");
        return Ok(());
    }

    info!("Starting Mimicro v{}", env!("CARGO_PKG_VERSION"));
    let coordinator = Coordinator::bind(&config, &base_dir).await?;
    for server in &config.servers {
        if let Some(addr) = coordinator.server_addr(&server.name) {
            info!(
                "[{}] {} endpoints on http://{}",
                server.name,
                server.endpoints.len(),
                addr
            );
        }
    }
    if config.collect_statistics {
        info!(
            "Statistics available at http://{}/statistics/get",
            coordinator.management_addr()?
        );
    }
    coordinator.run(shutdown_signal()).await
}

fn load_config(path: &Path, base_dir: &Path) -> Result<MimicroConfig> {
    let config = MimicroConfig::load(path)?;
    coordinator::check(&config, base_dir)?;
    Ok(config)
}

fn config_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
