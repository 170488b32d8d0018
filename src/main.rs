// ABOUTME: Main entry point for the sandbox-hub session manager
// Parses the CLI, sets up logging, connects to Docker and serves HTTP/WebSocket until shutdown

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandbox_hub::config::{AppConfig, LoggingConfig};
use sandbox_hub::docker::ContainerManager;
use sandbox_hub::server;
use sandbox_hub::services::Services;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sandbox-hub", version, about = "Interactive shells in isolated Docker workspaces")]
struct Cli {
    /// Config file (defaults to $SANDBOX_HUB_CONFIG or ~/.sandbox-hub/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the terminal socket and file API (default)
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Remove every container left behind by a previous run, then exit
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;

    setup_logging(&config.logging);
    setup_panic_handler();

    match cli.command.unwrap_or(Command::Serve { host: None, port: None }) {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            run_server(config).await
        }
        Command::Cleanup => run_cleanup(&config).await,
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    let manager = ContainerManager::new(&config.docker, &config.sandbox)
        .await
        .context("Failed to connect to Docker")?;

    let shutdown_timeout = config.lifecycle.shutdown_timeout();
    let reaper_interval = config.lifecycle.reaper_interval();
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let services = Arc::new(Services::new(config, Arc::new(manager)));
    services.lifecycle.reap_stale_environments().await;
    let reaper = services.lifecycle.spawn_idle_reaper(reaper_interval);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let result = server::serve(listener, services.clone(), shutdown_signal()).await;

    reaper.abort();
    services.lifecycle.shutdown(shutdown_timeout).await;
    info!("Shutdown complete");

    result
}

async fn run_cleanup(config: &AppConfig) -> Result<()> {
    let manager = ContainerManager::new(&config.docker, &config.sandbox)
        .await
        .context("Failed to connect to Docker")?;

    let removed = manager.reap_managed().await?;
    info!("Removed {} managed container(s)", removed);
    println!("Removed {} managed container(s)", removed);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn setup_logging(logging: &LoggingConfig) {
    use tracing_subscriber::prelude::*;

    let log_dir = logging.resolve_dir();
    let (file_layer, file_error) = match open_log_file(&log_dir) {
        Ok(file) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(Arc::new(file))
                .with_ansi(false); // No ANSI colors in log file
            (Some(layer), None)
        }
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandbox_hub=info,tower_http=info".into()),
        )
        .init();

    if let Some(e) = file_error {
        warn!("File logging disabled ({}): {}", log_dir.display(), e);
    }
}

fn open_log_file(log_dir: &Path) -> std::io::Result<std::fs::File> {
    std::fs::create_dir_all(log_dir)?;
    let log_file = log_dir.join(format!(
        "sandbox-hub-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));
    std::fs::OpenOptions::new().create(true).append(true).open(log_file)
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
