//! Ticksink CLI - operator tool for the tick persistence engine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use ticksink_core::config::LogFormat;
use ticksink_core::Config;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default config file looked up in the working directory.
const DEFAULT_CONFIG: &str = "ticksink.toml";

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, out-of-range values)
    ConfigError = 1,
    /// Store error (unreachable, missing tables, failed statement)
    StoreError = 2,
    /// Session lifecycle error
    SessionError = 3,
    /// Health check failure
    HealthCheckError = 6,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code, preferring the typed core error.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(core) = error.downcast_ref::<ticksink_core::Error>() {
            return match core {
                ticksink_core::Error::Config(_) | ticksink_core::Error::Serialization(_) => {
                    ExitCode::ConfigError
                }
                ticksink_core::Error::Store(_) | ticksink_core::Error::Pool(_) => {
                    ExitCode::StoreError
                }
                ticksink_core::Error::Session(_) => ExitCode::SessionError,
                ticksink_core::Error::Shutdown => ExitCode::SignalInterrupt,
                ticksink_core::Error::Io(_) => ExitCode::RuntimeError,
            };
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") {
            ExitCode::ConfigError
        } else if error_str.contains("health") {
            ExitCode::HealthCheckError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "ticksink")]
#[command(about = "Batching multi-table persistence for game tick snapshots", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one session from JSON-lines input
    Ingest {
        /// Input file, or '-' for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Player name stored on the session
        #[arg(long)]
        player: Option<String>,

        /// Activity type stored on the session
        #[arg(long)]
        activity: Option<String>,
    },

    /// Create missing tables in the configured store
    InitSchema,

    /// Validate configuration file
    Validate,

    /// Show status and health of a running instance
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,

        /// Metrics endpoint URL
        #[arg(long, default_value = "http://localhost:9090")]
        metrics_url: String,
    },

    /// List recent sessions
    Sessions {
        /// Number of sessions to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log settings come from the config file when it parses
    let monitoring = config_path(&cli.config)
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.log_level.as_directive()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ingest {
            input,
            player,
            activity,
        } => {
            let config = load_config(&cli.config)?;
            commands::ingest::run(config, input, player, activity).await?;
        }

        Commands::InitSchema => {
            let config = load_config(&cli.config)?;
            commands::schema::init(config).await?;
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config.validate()?;
            println!("Configuration is valid");
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, &metrics_url).await?;
        }

        Commands::Sessions { limit } => {
            let config = load_config(&cli.config)?;
            commands::sessions::list(config, limit).await?;
        }
    }

    Ok(())
}

/// Explicit path, else `ticksink.toml` when present.
fn config_path(path: &Option<PathBuf>) -> Option<PathBuf> {
    match path {
        Some(path) => Some(path.clone()),
        None => Some(PathBuf::from(DEFAULT_CONFIG)).filter(|p| p.exists()),
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match config_path(path) {
        Some(path) => Ok(Config::from_file(&path)?),
        None => {
            tracing::info!("No config file found, using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
