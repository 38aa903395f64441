//! ActionGuard CLI — the main entry point.
//!
//! Commands:
//! - `check`          — Evaluate one intent (or a JSON array of them)
//! - `explain`        — Show how each layer sees an intent
//! - `validate`       — Load a config and report policy problems
//! - `default-config` — Print the default configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;

#[derive(Parser)]
#[command(
    name = "actionguard",
    about = "ActionGuard — gate agent actions before they run",
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
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate an intent and print the decision as JSON
    ///
    /// Exits 0 for ALLOW/WARN, 2 when review is required, 3 for BLOCK.
    Check {
        /// Guard configuration (TOML)
        #[arg(short, long, env = "ACTIONGUARD_CONFIG", default_value = "actionguard.toml")]
        config: PathBuf,

        /// Intent file (JSON object or array), `-` for stdin
        #[arg(short, long)]
        intent: PathBuf,
    },

    /// Dry-run an intent and show evaluator order, results and policy trace
    ///
    /// Takes no rate-limit or delegation slot, so repeated runs see the same state.
    Explain {
        #[arg(short, long, env = "ACTIONGUARD_CONFIG", default_value = "actionguard.toml")]
        config: PathBuf,

        #[arg(short, long)]
        intent: PathBuf,
    },

    /// Load a configuration and report rejected and shadowed policies
    Validate {
        #[arg(short, long, env = "ACTIONGUARD_CONFIG", default_value = "actionguard.toml")]
        config: PathBuf,
    },

    /// Print the default configuration
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the command's output.
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if cli.json {
        fmt.json().init();
    } else {
        fmt.init();
    }

    match cli.command {
        Commands::Check { config, intent } => commands::check::run(&config, &intent).await,
        Commands::Explain { config, intent } => commands::explain::run(&config, &intent),
        Commands::Validate { config } => commands::validate::run(&config),
        Commands::DefaultConfig => {
            print!("{}", actionguard_config::GuardConfig::default_toml());
            Ok(ExitCode::SUCCESS)
        }
    }
}
