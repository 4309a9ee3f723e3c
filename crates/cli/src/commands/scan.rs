//! Folder scanning

use anyhow::Result;
use appdex_scanner::{index_folder, ScanOptions};
use clap::Args;
use std::path::PathBuf;

use super::Context;
use crate::output::{print_summary, OutputFormat};

#[derive(Args)]
pub struct ScanArgs {
    /// Folder to scan
    pub path: PathBuf,

    /// Capture thumbnails for new and changed items afterwards
    #[arg(short, long)]
    pub capture: bool,
}

pub async fn execute(ctx: &Context, args: ScanArgs, format: OutputFormat) -> Result<()> {
    let options = ScanOptions::from_config(&ctx.config.scan);
    let db = ctx.db.clone();
    let root = args.path.clone();
    let report = tokio::task::spawn_blocking(move || index_folder(&db, &root, &options)).await??;

    print_summary(
        &serde_json::json!({
            "root": report.root,
            "python_apps": report.stats.python_apps,
            "html_files": report.stats.html_files,
            "inserted": report.inserted,
            "updated": report.updated,
            "unchanged": report.unchanged,
            "excluded_dirs": report.stats.excluded_dirs,
            "rejected": report.stats.rejected,
            "unreadable": report.stats.unreadable,
        }),
        format,
    );

    if args.capture {
        super::capture::capture_items(ctx, report.needs_capture()).await?;
    }
    Ok(())
}
