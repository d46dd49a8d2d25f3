//! Effective configuration display

use colored::Colorize;

use crate::cli::{CommandContext, OutputFormat};
use mediashelf::error::Result;

/// Print the configuration after defaults and overrides are applied
pub fn show(ctx: &CommandContext) -> Result<()> {
    let config = &ctx.config;

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "cache_dir": ctx.cache_dir.display().to_string(),
                "batch": { "debounce_ms": config.batch.debounce_ms },
                "rate_limit": { "enabled": config.rate_limit.enabled },
                "preferences": { "format": config.preferences.format },
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => {
            let rate_limit = if config.rate_limit.enabled {
                "enabled".green()
            } else {
                "disabled".yellow()
            };
            println!("{}", "Configuration".bold());
            println!("────────────────────────────────────────");
            println!("Cache dir:      {}", ctx.cache_dir.display());
            println!("Batch window:   {:?}", config.batch.debounce());
            println!("Rate limiting:  {}", rate_limit);
        }
    }

    Ok(())
}
