//! Fileward server
//!
//! Password-protected web file manager.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use guard::SetupState;
use server::config::default_config_path;
use server::{build_router, AppState, Config, LogFormat};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// How often idle sessions and stale login failure records are swept.
const SESSION_SWEEP_INTERVAL_SECS: u64 = 60;

/// Fileward - password-protected web file manager.
#[derive(Parser, Debug)]
#[command(name = "fileward")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the web server
    Serve,

    /// Show setup state and storage locations
    Status,

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Commands::InitConfig { force } = cli.command {
        return init_config(&config_path, force);
    }

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log.level.clone()
    };
    let _log_guard = init_logging(&level, config.log.format);

    match cli.command {
        Commands::Serve => serve(config, &config_path).await,
        Commands::Status => status(config, &config_path),
        Commands::InitConfig { .. } => Ok(()),
    }
}

/// Install the global subscriber. The returned guard flushes buffered
/// lines on drop and must live until exit.
fn init_logging(level: &str, format: LogFormat) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Plain => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init(),
    }

    guard
}

async fn serve(config: Config, config_path: &Path) -> anyhow::Result<()> {
    let listen: SocketAddr = config.server.listen.parse()?;
    let state = AppState::from_config(config, Some(config_path))?;
    state.sessions.start_sweep_task(SESSION_SWEEP_INTERVAL_SECS);
    state.authenticator.start_sweep_task(SESSION_SWEEP_INTERVAL_SECS);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("Fileward listening on http://{}", listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn status(config: Config, config_path: &Path) -> anyhow::Result<()> {
    let state = AppState::from_config(config, Some(config_path))?;
    let setup = match state.credentials.state() {
        SetupState::Unconfigured => "not configured (open the web page to set a password)",
        SetupState::Configured => "configured",
        SetupState::ConfigMissing => "ERROR: credential missing after setup",
    };

    println!("Setup:       {}", setup);
    println!("Config file: {}", config_path.display());
    println!("Root:        {}", state.resolver.root().as_path().display());
    println!("Data dir:    {}", state.config.storage.data_dir.display());
    println!("Credential:  {}", state.credentials.credential_path().display());
    println!(
        "Audit log:   {}",
        state
            .config
            .storage
            .audit_dir()
            .join(guard::AUDIT_LOG_FILE)
            .display()
    );
    println!("Listen:      {}", state.config.server.listen);
    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            tracing::warn!("Failed to register signal handlers; falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl-C");
}
