//! Appdex web API
//!
//! Indexes folders, launches discovered apps and captures thumbnails on
//! behalf of the dashboard.

use appdex_common::{AppdexConfig, Database};
use appdex_web::{AppState, WebServer};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "appdex-web")]
#[command(about = "Appdex web API")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "APPDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides web.listen)
    #[arg(short, long, env = "APPDEX_WEB_ADDR")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Appdex web v{}", appdex_common::VERSION);

    let config_path = cli.config.unwrap_or_else(appdex_common::default_config_path);
    let config = AppdexConfig::load(&config_path)?;
    let addr: SocketAddr = cli
        .listen
        .unwrap_or_else(|| config.web.listen.clone())
        .parse()?;

    std::fs::create_dir_all(config.thumbnails_dir())?;
    std::fs::create_dir_all(config.scratch_dir())?;
    let db = Database::open(config.db_path())?;

    let browser = appdex_launcher::system_browser(&config.capture);
    let server = WebServer::new(AppState::new(config, db, browser));

    server
        .serve(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await
}
