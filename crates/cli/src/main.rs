//! Appdex CLI - Main Entry Point
//!
//! Scans folders for Python web apps and standalone HTML pages, keeps the
//! index current and captures thumbnails without the web API running.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{capture, config, items, scan, Context};

/// Appdex CLI - index and preview local web apps
#[derive(Parser)]
#[command(name = "appdex")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(long, env = "APPDEX_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a folder and update the index
    Scan(scan::ScanArgs),

    /// List indexed items
    List(items::ListArgs),

    /// Capture thumbnails
    Capture(capture::CaptureArgs),

    /// Remove an item by numeric or simple id
    Remove {
        /// Item id, e.g. 12 or p003
        id: String,
    },

    /// Drop index entries whose files no longer exist
    Cleanup,

    /// Show or initialise the configuration
    Config(config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(appdex_common::default_config_path);
    let ctx = Context::open(&config_path)?;

    match cli.command {
        Commands::Scan(args) => scan::execute(&ctx, args, cli.format).await?,
        Commands::List(args) => items::list(&ctx, args, cli.format)?,
        Commands::Capture(args) => capture::execute(&ctx, args).await?,
        Commands::Remove { id } => items::remove(&ctx, &id)?,
        Commands::Cleanup => items::cleanup(&ctx)?,
        Commands::Config(args) => config::execute(&ctx, args, &config_path, cli.format)?,
    }

    Ok(())
}
