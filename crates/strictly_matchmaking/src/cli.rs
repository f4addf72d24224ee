//! Command-line interface for strictly_matchmaking.

use clap::{Parser, Subcommand};

/// Strictly Matchmaking - networked three-piece morris client
#[derive(Parser, Debug)]
#[command(name = "strictly_matchmaking")]
#[command(about = "Queue for and play three-piece morris against a remote opponent", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "MORRIS_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    /// Game server URL, overriding the config file
    #[arg(long, env = "MORRIS_SERVER_URL")]
    pub server_url: Option<String>,

    /// SQLite file for queue persistence, overriding the config file
    #[arg(long, env = "MORRIS_STORE")]
    pub store: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join the matchmaking queue and play from stdin
    Play {
        /// Player identifier
        #[arg(long, env = "MORRIS_PLAYER_ID")]
        player_id: String,

        /// Device identifier
        #[arg(long, env = "MORRIS_DEVICE_ID")]
        device_id: String,
    },

    /// Resume a persisted queue session
    Resume,

    /// Print recorded queue outcomes
    Stats {
        /// Number of history entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the board and its adjacency graph
    Board,
}
