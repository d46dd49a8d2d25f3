//! Cache management commands

use chrono::Utc;
use colored::Colorize;
use std::time::Duration;

use mediashelf::ResultKind;
use mediashelf::error::{Error, Result};

use crate::cli::{CommandContext, OutputFormat};

/// Show cache status/statistics
pub fn status(ctx: &CommandContext) -> Result<()> {
    let cache = ctx.open_storage()?;
    let stats = cache.stats()?;
    let path = ctx.cache_dir.display().to_string();

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "total_entries": stats.total_entries,
                "fresh_entries": stats.fresh_entries,
                "stale_entries": stats.stale_entries,
                "total_size_bytes": stats.total_size_bytes,
                "total_size_human": format_size(stats.total_size_bytes),
                "oldest_entry_timestamp": stats.oldest_entry,
                "newest_entry_timestamp": stats.newest_entry,
                "path": path,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => {
            println!("{}", "Cache Status".bold());
            println!("────────────────────────────────────────");
            println!("Location:       {}", path);
            println!("Entries:        {}", stats.total_entries);
            println!("Fresh:          {}", stats.fresh_entries.to_string().green());
            println!("Stale:          {}", stats.stale_entries.to_string().yellow());
            println!("Total size:     {}", format_size(stats.total_size_bytes));

            if let Some(oldest) = stats.oldest_entry {
                println!("Oldest entry:   {}", format_timestamp(oldest));
            }

            if let Some(newest) = stats.newest_entry {
                println!("Newest entry:   {}", format_timestamp(newest));
            }
        }
    }

    Ok(())
}

/// Clear cache entries, optionally limited to one kind or key prefix
pub fn clear(ctx: &CommandContext, kind: Option<ResultKind>, prefix: Option<&str>) -> Result<()> {
    let cache = ctx.open_storage()?;
    let removed = match (kind, prefix) {
        (Some(kind), _) => cache.delete_by_kind(kind)?,
        (None, Some(prefix)) => cache.delete_by_prefix(prefix)?,
        (None, None) => cache.clear_all()?.entries_removed,
    };

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "entries_removed": removed,
                "kind": kind.map(|k| k.as_str()),
                "prefix": prefix,
                "success": true,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => {
            if removed > 0 {
                println!("{} Cleared {} cache entries", "✓".green(), removed);
            } else {
                println!("Nothing to clear");
            }
        }
    }

    Ok(())
}

/// Show cache path
pub fn path(ctx: &CommandContext) -> Result<()> {
    println!("{}", ctx.cache_dir.display());
    Ok(())
}

/// Print one stored entry
pub fn show(ctx: &CommandContext, key: &str, ttl: Option<u64>) -> Result<()> {
    let cache = ctx.open_storage()?;
    let row = cache
        .read_entry(key)?
        .ok_or_else(|| Error::Other(format!("No cache entry for key '{}'", key)))?;

    let ttl = Duration::from_secs(ttl.unwrap_or(row.ttl_secs.max(0) as u64));
    let now = Utc::now().timestamp();
    let fresh = row.is_fresh_at(now, ttl);
    let items: serde_json::Value = serde_json::from_str(&row.data)?;
    let count = items.as_array().map(Vec::len).unwrap_or(0);

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "key": key,
                "kind": row.kind,
                "saved_at": row.saved_at,
                "age_secs": (now - row.saved_at).max(0),
                "ttl_secs": ttl.as_secs(),
                "fresh": fresh,
                "items": count,
                "data": items,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Pretty => {
            let state = if fresh {
                "fresh".green()
            } else {
                "stale".yellow()
            };
            println!("{}", key.bold());
            println!("Kind:       {}", row.kind);
            println!("Saved:      {}", format_timestamp(row.saved_at));
            println!("TTL:        {}s ({})", ttl.as_secs(), state);
            println!("Items:      {}", count);
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }

    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|d| {
            d.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Format bytes as human-readable size
fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
