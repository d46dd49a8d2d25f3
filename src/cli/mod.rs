//! CLI command definitions and handlers

use clap::{Parser, Subcommand};

use mediashelf::ResultKind;

pub mod cache;
pub mod config;
pub mod context;

pub use context::CommandContext;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Pretty format - human-optimized rich formatting
    #[default]
    Pretty,
    /// JSON format - structured for scripts
    Json,
}

/// mediashelf - inspect and manage the local result cache
#[derive(Parser, Debug)]
#[command(name = "mediashelf")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (pretty, json); falls back to the configured preference
    #[arg(
        long,
        global = true,
        env = "MEDIASHELF_FORMAT",
        hide_env = true,
        hide_possible_values = true
    )]
    pub format: Option<OutputFormat>,

    /// Override config file location
    #[arg(long, global = true, env = "MEDIASHELF_CONFIG", hide_env = true)]
    pub config: Option<String>,

    /// Override cache directory
    #[arg(long, global = true, env = "MEDIASHELF_CACHE_DIR", hide_env = true)]
    pub cache_dir: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true, env = "MEDIASHELF_DEBUG", hide_env = true)]
    pub debug: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Display version information
    Version,

    /// Show the effective configuration
    Config,

    /// Manage the local result cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

/// Cache management subcommands
#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show cache statistics
    Status,
    /// Clear cached results
    #[command(after_help = "\
Examples:
  mediashelf cache clear
  mediashelf cache clear --kind manga
  mediashelf cache clear --prefix browse:anime")]
    Clear {
        /// Only clear results of this media kind
        #[arg(long, value_enum, conflicts_with = "prefix")]
        kind: Option<ResultKind>,

        /// Only clear keys starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Print cache directory path
    Path,
    /// Print one cached entry and whether it is fresh
    Show {
        /// Cache key
        key: String,

        /// Judge freshness against this TTL in seconds instead of the stored one
        #[arg(long)]
        ttl: Option<u64>,
    },
}
