//! Command-line interface for the Waypost tracking engine.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `simulate` | Run a tracking session over a recorded trace |
//! | `replay` | List, count, or clear the persisted replay buffer |
//! | `status` | Show the persisted session state and cache |
//! | `config` | Show, validate, or create the configuration file |

mod cli;
mod commands;
mod config;
mod script;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use commands::{cmd_config, cmd_replay, cmd_simulate, cmd_status};
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // When quiet mode is enabled, suppress info-level logging
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::path);
    let output = cli.output.as_ref();

    match cli.command {
        Commands::Simulate(args) => {
            let config = Config::load_from(&config_path);
            cmd_simulate(args, &config, output).await?;
        }
        Commands::Replay { action } => {
            let config = Config::load_from(&config_path);
            cmd_replay(action, &config, output)?;
        }
        Commands::Status { output: args } => {
            let config = Config::load_from(&config_path);
            cmd_status(args.format, &config, output)?;
        }
        Commands::Config { action } => {
            cmd_config(action, &config_path, output)?;
        }
    }

    Ok(())
}
