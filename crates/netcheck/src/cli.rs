use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use netcheck_config::DEFAULT_CONFIG_PATH;

/// Keeps this host online by managing a prioritized set of NetworkManager
/// connections and checking each one with real DNS queries.
#[derive(Parser, Debug)]
#[command(name = "netcheck", version, about)]
pub struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "NETCHECK_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    pub config: PathBuf,

    /// Increase log verbosity above the configured level (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon in the foreground (default)
    #[default]
    Run,
    /// Validate the configuration and print the effective settings
    CheckConfig,
}
