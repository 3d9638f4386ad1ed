//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// Groupchat session - real-time group messaging session from the terminal
///
/// Keeps a reconnecting WebSocket session to a group-messaging server,
/// joins groups, prints what happens in them and sends what you type.
#[derive(Parser, Debug)]
#[command(name = "groupchat-session")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect and chat (stdin lines are sent to the first group)
    Run(RunArgs),

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Options for `run`; each overrides the matching config value
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Path to configuration file
    #[arg(short, long, env = "GROUPCHAT_CONFIG")]
    pub config: Option<String>,

    /// Server WebSocket URL
    #[arg(long)]
    pub url: Option<String>,

    /// User id to announce
    #[arg(long)]
    pub user_id: Option<String>,

    /// Display name to announce
    #[arg(long)]
    pub name: Option<String>,

    /// Group to join (repeatable); the first one receives typed messages
    #[arg(short, long = "group")]
    pub groups: Vec<String>,

    /// Status to announce once connected (online, offline)
    #[arg(long)]
    pub status: Option<String>,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
