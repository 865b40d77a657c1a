//! Parley CLI — the main entry point.
//!
//! Commands:
//! - `run`     — Serve the Telegram bot (long polling)
//! - `chat`    — Interactive or single-message chat in the terminal
//! - `doctor`  — Diagnose configuration and connectivity
//! - `config`  — Print the default configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley — a streaming, tool-using chat bot",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.parley/config.toml)
    #[arg(short, long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the Telegram bot
    Run,

    /// Chat in the terminal
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Diagnose system health
    Doctor,

    /// Print the default configuration (or the config path)
    Config {
        /// Print the config file path instead
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Run => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::run::run(config).await?
        }
        Commands::Chat { message } => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::chat::run(config, message).await?
        }
        Commands::Doctor => commands::doctor::run(cli.config.as_deref()).await?,
        Commands::Config { path } => commands::config_cmd::run(cli.config.as_deref(), path),
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
/// Logs go to stderr so they never mix with a terminal answer.
fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
