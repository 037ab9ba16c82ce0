//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "waypost")]
#[command(author, version, about = "Simulate and inspect the Waypost tracking engine", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Use this config file instead of the default location
    #[arg(short, long, global = true, env = "WAYPOST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write output to file instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Reusable output arguments
#[derive(Debug, Clone, Args)]
pub struct OutputArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a tracking session over a recorded trace
    Simulate(SimulateArgs),

    /// Inspect or clear the persisted replay buffer
    Replay {
        #[command(subcommand)]
        action: ReplayAction,
    },

    /// Show the persisted session state
    Status {
        #[command(flatten)]
        output: OutputArgs,
    },

    /// Manage CLI configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments for `waypost simulate`
#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Trace file: a JSON array of steps
    #[arg(short, long)]
    pub trace: PathBuf,

    /// Scripted server replies (JSON). Without it the mock server echoes
    #[arg(short, long, conflicts_with_all = ["endpoint", "remote"])]
    pub server: Option<PathBuf>,

    /// Sync against the endpoint from the config file instead of the mock
    #[arg(short, long)]
    pub remote: bool,

    /// Sync against this server URL instead of the mock (implies --remote)
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Tracking preset to start with (continuous, responsive, efficient)
    #[arg(short, long)]
    pub preset: Option<String>,

    /// Keep state in the configured database instead of in memory
    #[arg(long)]
    pub persist: bool,

    /// Database path (implies --persist)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Do not wait between retry attempts
    #[arg(long)]
    pub no_delay: bool,

    /// Print session events as they happen
    #[arg(long)]
    pub events: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ReplayAction {
    /// List buffered observations, oldest first
    List {
        /// Database path
        #[arg(long)]
        db: Option<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Show buffer size, capacity, and eviction count
    Stats {
        /// Database path
        #[arg(long)]
        db: Option<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Drop every buffered observation
    Clear {
        /// Database path
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show config file path
    Path,

    /// Check the configuration and report the effective tracking config
    Validate,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "waypost",
            "simulate",
            "--trace",
            "fixes.json",
            "--server",
            "script.json",
            "--no-delay",
            "--format",
            "json",
        ])
        .unwrap();
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.trace, PathBuf::from("fixes.json"));
        assert_eq!(args.server, Some(PathBuf::from("script.json")));
        assert!(args.no_delay);
        assert_eq!(args.output.format, OutputFormat::Json);
    }

    #[test]
    fn test_server_conflicts_with_endpoint() {
        let result = Cli::try_parse_from([
            "waypost",
            "simulate",
            "--trace",
            "t.json",
            "--server",
            "s.json",
            "--endpoint",
            "https://api.example.com",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_replay_clear() {
        let cli = Cli::try_parse_from(["waypost", "replay", "clear", "--db", "state.db"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Replay {
                action: ReplayAction::Clear { db: Some(_) }
            }
        ));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["waypost", "status", "-q"]).unwrap();
        assert!(cli.quiet);
    }
}
