//! NxShell session daemon
//!
//! Sidecar process that owns local and SSH sessions for the desktop shell.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sessiond::config::Config;
use sessiond::ipc::IpcClient;
use sessiond::service::{shutdown_signal, SessionService};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// NxShell session daemon - local and SSH sessions for the desktop shell.
#[derive(Parser, Debug)]
#[command(name = "nxshell-sessiond")]
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
    /// Serve one consumer on stdin/stdout (sidecar mode)
    Stdio,

    /// Serve consumers on a Unix socket until SIGINT/SIGTERM
    Serve {
        /// Socket path (defaults to the runtime directory)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// List the sessions of a running `serve` daemon
    List {
        /// Socket path (defaults to the runtime directory)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// Install the tracing subscriber.
///
/// stdout carries the protocol in stdio mode, so logs go to stderr or to a
/// daily rolling file when `daemon.log_dir` is set.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sessiond.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let _log_guard = init_logging(&config, cli.verbose)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "NxShell session daemon starting");

    match cli.command {
        Commands::Stdio => {
            SessionService::new(&config).run_stdio().await?;
        }
        Commands::Serve { socket } => {
            let path = socket.unwrap_or_else(|| config.socket_path());
            SessionService::new(&config)
                .run_serve(&path, shutdown_signal())
                .await?;
        }
        Commands::List { socket, json } => {
            let path = socket.unwrap_or_else(|| config.socket_path());
            list_sessions(&path, json).await?;
        }
    }

    Ok(())
}

/// Print the sessions of a running daemon.
async fn list_sessions(path: &std::path::Path, json: bool) -> anyhow::Result<()> {
    let mut client = IpcClient::connect(path)
        .await
        .with_context(|| format!("Daemon is not running at {}", path.display()))?;
    let sessions = client.list_sessions().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    println!("{:<38} {:<8} STATE", "ID", "KIND");
    for session in sessions {
        let state = serde_json::to_value(session.state)?;
        println!(
            "{:<38} {:<8} {}",
            session.id,
            session.kind,
            state.as_str().unwrap_or("-")
        );
    }
    Ok(())
}
