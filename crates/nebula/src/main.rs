//! Nebula - execution orchestration engine
//!
//! Main entry point for the Nebula CLI.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use nebula_config::ConfigLoader;
use tracing_appender::non_blocking::WorkerGuard;

mod capabilities;
mod commands;

use commands::{config, run, validate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Nebula - execution orchestration engine
#[derive(Parser)]
#[command(name = "nebula")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// User config directory (default: platform config dir)
    #[arg(long, global = true, env = "NEBULA_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a plan file
    Run(run::RunArgs),

    /// Check a plan file without running it
    Validate(validate::ValidateArgs),

    /// Show or initialize configuration
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(dir) = &cli.config_dir {
        loader = loader.with_user_dir(dir);
    }
    let loaded = loader.load();
    loaded
        .config
        .validate()
        .context("Invalid configuration")?;

    let _guard = init_tracing(&loaded.config.logging(), cli.verbose, loader.user_dir());

    for warning in loaded.warnings() {
        tracing::warn!("{}", warning);
    }

    let ctx = commands::Context {
        config: loaded,
        loader,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}

/// Console (human-readable, stderr) + optional rotating JSON file.
///
/// The returned guard must live until exit so buffered file logs are flushed.
fn init_tracing(
    logging: &nebula_config::LoggingSection,
    verbose: bool,
    user_dir: Option<&std::path::Path>,
) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let level = if verbose { "debug" } else { logging.level.as_str() };
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "nebula={level},nebula_engine={level},nebula_config={level},warn"
        ))
    });

    let (file_layer, guard) = if logging.file {
        let log_dir = logging
            .dir
            .clone()
            .or_else(|| user_dir.map(|d| d.join("logs")))
            .unwrap_or_else(|| PathBuf::from("logs"));
        let file_appender = tracing_appender::rolling::daily(&log_dir, "nebula.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new(
                "nebula=trace,nebula_engine=trace,nebula_config=trace,info",
            ));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .init();

    guard
}
