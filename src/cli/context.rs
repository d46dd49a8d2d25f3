//! Command execution context
//!
//! Resolves the config file, output format, and cache directory once so
//! handlers only deal with their own work.

use clap::ValueEnum;
use std::path::{Path, PathBuf};

use mediashelf::cache::CacheStorage;
use mediashelf::config::Config;
use mediashelf::error::Result;

use crate::cli::{Cli, OutputFormat};

/// Context for command execution.
///
/// Precedence for format and cache directory: CLI flag > environment
/// variable > config file > default.
pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
    pub cache_dir: PathBuf,
}

impl CommandContext {
    pub fn new(cli: &Cli) -> Result<Self> {
        let config = Config::load_or_default(cli.config.as_deref().map(Path::new))?;

        let format = cli
            .format
            .or_else(|| {
                config
                    .preferences
                    .format
                    .as_deref()
                    .and_then(|f| OutputFormat::from_str(f, true).ok())
            })
            .unwrap_or_default();

        let cache_dir = match cli
            .cache_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| config.cache_dir.clone())
        {
            Some(dir) => dir,
            None => CacheStorage::cache_dir()?,
        };

        log::debug!("Using cache directory {}", cache_dir.display());

        Ok(Self {
            config,
            format,
            cache_dir,
        })
    }

    /// Open the SQLite cache in the resolved directory
    pub fn open_storage(&self) -> Result<CacheStorage> {
        Ok(CacheStorage::open_at(&self.cache_dir)?)
    }
}
