//! Config command - show the effective configuration or write a starter file.

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use console::{Style, style};
use nebula_config::{Layer, LayerStatus};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: Option<ConfigCommand>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show resolved configuration (default)
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Show the user config file path
    Path,

    /// Write a config file with the default sections
    Init {
        /// Create the project config (./nebula.toml) instead of the user config
        #[arg(long)]
        project: bool,
    },
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command.unwrap_or(ConfigCommand::Show) {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Path => cmd_path(ctx),
        ConfigCommand::Init { project } => cmd_init(ctx, project),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.config;
    let config = &loaded.config;
    let dim = Style::new().dim();

    println!("{}", style("# Nebula Configuration").bold());
    println!();

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("{}", dim.apply_to("# No config files loaded (using defaults)"));
    } else {
        for path in sources {
            println!("{} {}", dim.apply_to("# Loaded from:"), path.display());
        }
    }
    for warning in loaded.warnings() {
        println!("{} {}", style("# Warning:").yellow(), warning);
    }
    println!();

    let engine = config.engine();
    println!("[engine]");
    println!("worker_pool_size = {}", engine.worker_pool_size);
    println!("approval_timeout_secs = {}", engine.approval_timeout_secs);
    println!(
        "default_step_timeout_secs = {}",
        engine.default_step_timeout_secs
    );
    println!();

    let store = config.store();
    println!("[store]");
    println!("kind = {:?}", format!("{:?}", store.kind).to_lowercase());
    if let Some(path) = &store.path {
        println!("path = {:?}", path.display().to_string());
    }
    println!();

    if let Some(http) = config.http_invoker() {
        println!("[invoker.http]");
        println!("base_url = {:?}", http.base_url);
        println!("capabilities = {:?}", http.capabilities);
        println!();
    }

    let logging = config.logging();
    println!("[logging]");
    println!("level = {:?}", logging.level);
    println!("file = {}", logging.file);
    if let Some(dir) = &logging.dir {
        println!("dir = {:?}", dir.display().to_string());
    }

    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    let green = Style::new().green();
    let dim = Style::new().dim();

    println!("{}", style("Config layers (lowest precedence first)").bold());
    for (i, report) in ctx.config.layers.iter().enumerate() {
        let marker = match &report.status {
            LayerStatus::Missing => dim.apply_to("not found".to_string()).to_string(),
            LayerStatus::Loaded { sections } if sections.is_empty() => {
                green.apply_to("loaded, empty".to_string()).to_string()
            }
            LayerStatus::Loaded { sections } => green
                .apply_to(format!("loaded: {}", sections.join(", ")))
                .to_string(),
            LayerStatus::Malformed { .. } => style("ignored, malformed").yellow().to_string(),
        };
        println!(
            "  {}. {:<8} {} [{}]",
            i + 1,
            report.layer,
            report.path.display(),
            marker
        );
    }
    Ok(())
}

fn cmd_path(ctx: &Context) -> Result<()> {
    match ctx.loader.layer_path(Layer::User) {
        Some(path) => println!("{}", path.display()),
        None => println!("No user config directory available"),
    }
    Ok(())
}

fn cmd_init(ctx: &Context, project: bool) -> Result<()> {
    let layer = if project { Layer::Project } else { Layer::User };
    let path = ctx
        .loader
        .init(layer)
        .with_context(|| format!("Failed to initialize {} config", layer))?;
    println!("Wrote {} config: {}", layer, path.display());
    Ok(())
}
