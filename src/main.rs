//! mediashelf CLI - inspect and manage the local result cache

use clap::Parser;

mod cli;

use cli::{CacheCommands, Cli, CommandContext, Commands};
use mediashelf::error::Result;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(err) = run(cli).await {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

/// `--debug` forces debug output; otherwise `RUST_LOG` applies, defaulting to warnings
fn init_logging(debug: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.format_timestamp(None).init();
    log::debug!("Debug mode enabled");
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Version = cli.command {
        println!("mediashelf version {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let ctx = CommandContext::new(&cli)?;

    match cli.command {
        Commands::Version => Ok(()),
        Commands::Config => cli::config::show(&ctx),
        Commands::Cache(cache_cmd) => match cache_cmd {
            CacheCommands::Status => cli::cache::status(&ctx),
            CacheCommands::Clear { kind, prefix } => {
                cli::cache::clear(&ctx, kind, prefix.as_deref())
            }
            CacheCommands::Path => cli::cache::path(&ctx),
            CacheCommands::Show { key, ttl } => cli::cache::show(&ctx, &key, ttl),
        },
    }
}
