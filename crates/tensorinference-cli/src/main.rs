//! tensorinference CLI - exact inference on UAI models from the command line
//!
//! Runs the partition function (PR), marginal (MAR), MAP and marginal MAP
//! (MMAP) tasks on `.uai` files with optional `.uai.evid` evidence.

mod cli;
mod config;
mod output;
mod tasks;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Commands, ConfigCommand};
use config::Config;
use output::{enable_colors, print_error, print_success};
use tasks::Problem;

fn main() {
    if let Err(e) = run() {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if cli.no_config {
        Config::default()
    } else if let Some(path) = &cli.config {
        Config::load(path)?
    } else {
        Config::load_default()
    };

    // Override config with CLI options
    if let Some(format) = cli.output_format {
        config.output_format = format;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level.as_str().to_string();
    }
    if cli.no_color {
        config.colored = false;
    }

    enable_colors(config.colored);
    init_logging(&config.log_level, config.colored)?;

    let report = match &cli.command {
        Commands::Pr { problem } => Problem::load(problem, &config)?.run_pr()?,
        Commands::Mar { problem, mar } => Problem::load(problem, &config)?.run_mar(mar.as_deref())?,
        Commands::Map { problem } => Problem::load(problem, &config)?.run_map()?,
        Commands::Mmap { problem, query } => Problem::load(problem, &config)?.run_mmap(query)?,
        Commands::Config { command } => return handle_config_command(command, &config),
    };
    print!("{}", report.render(config.output_format)?);
    if config.output_format == cli::OutputFormat::Json {
        println!();
    }
    Ok(())
}

/// Install the stderr subscriber; RUST_LOG overrides `level`.
fn init_logging(level: &str, ansi: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("Invalid log level '{}': {}", level, e))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(ansi),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize tracing: {}", e))
}

fn handle_config_command(command: &ConfigCommand, config: &Config) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
        }
        ConfigCommand::Path => {
            let path = Config::config_path();
            println!("{}", path.display());
        }
        ConfigCommand::Init => {
            let path = Config::create_default()?;
            print_success(&format!("Created config file: {}", path.display()));
        }
    }

    Ok(())
}
