use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

#[derive(Parser)]
#[command(name = "burrow", about = "Inspect and maintain a burrow key/value store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path of the store's log file (overrides the config file)
    #[arg(short, long, global = true)]
    pub store: Option<PathBuf>,

    /// TOML file with store settings
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Compact the log while opening the store
    #[arg(long, global = true)]
    pub compact_on_open: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a JSON value under a key
    Set {
        /// Key
        key: String,
        /// Value as JSON text (bare words are stored as strings)
        value: String,
    },
    /// Print the value stored under a key
    Get {
        /// Key
        key: String,
    },
    /// Remove a key
    Delete {
        /// Key
        key: String,
    },
    /// List all keys
    Keys,
    /// Print the size of the log file in bytes
    Size,
    /// Rewrite the log down to live keys
    Compact,
    /// Print every record in the log, in file order
    Dump,
}
