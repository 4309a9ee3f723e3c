//! Thumbnail capture from the terminal

use anyhow::Result;
use appdex_common::IndexedItem;
use appdex_launcher::{system_browser, CaptureQueue, Capturer, Registry};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tracing::debug;

use super::Context;
use crate::output::{print_success, print_warning};

#[derive(Args)]
pub struct CaptureArgs {
    /// Recapture every item, not just those missing a thumbnail
    #[arg(short, long)]
    pub all: bool,
}

pub async fn execute(ctx: &Context, args: CaptureArgs) -> Result<()> {
    let items = if args.all {
        ctx.db.list_items()?
    } else {
        ctx.db.list_missing_thumbnails()?
    };
    capture_items(ctx, items).await
}

/// Capture `items` with a progress bar, then stop everything that was launched
pub async fn capture_items(ctx: &Context, items: Vec<IndexedItem>) -> Result<()> {
    if items.is_empty() {
        print_success("All thumbnails are up to date");
        return Ok(());
    }

    let config = &ctx.config;
    let registry = Registry::new(config.launch.clone(), config.scratch_dir());
    let capturer = Capturer::new(
        registry.clone(),
        system_browser(&config.capture),
        &config.capture,
    );
    let queue = CaptureQueue::start(
        capturer,
        ctx.db.clone(),
        config.thumbnails_dir(),
        config.capture.workers,
    );

    let total = queue.enqueue(items)?;
    debug!("Queued {} items for capture", total);
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    let idle = queue.wait_idle();
    tokio::pin!(idle);
    loop {
        tokio::select! {
            _ = &mut idle => break,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                let progress = queue.progress();
                bar.set_position((progress.completed + progress.failed) as u64);
                bar.set_message(progress.current.join(", "));
            }
        }
    }

    let progress = queue.progress();
    bar.finish_and_clear();
    queue.shutdown().await;
    registry.stop_all().await;

    print_success(&format!(
        "Captured {} of {} thumbnails",
        progress.completed, progress.total
    ));
    for failure in &progress.errors {
        print_warning(&format!(
            "{} ({}): {}",
            failure.name, failure.simple_id, failure.error
        ));
    }
    Ok(())
}
