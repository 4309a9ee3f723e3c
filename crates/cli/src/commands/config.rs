//! Configuration inspection

use anyhow::Result;
use clap::Args;
use std::path::Path;

use super::Context;
use crate::output::{print_success, OutputFormat};

#[derive(Args)]
pub struct ConfigArgs {
    /// Write the effective configuration to the config file
    #[arg(long)]
    pub init: bool,
}

pub fn execute(ctx: &Context, args: ConfigArgs, config_path: &Path, format: OutputFormat) -> Result<()> {
    if args.init {
        ctx.config.save(config_path)?;
        print_success(&format!("Wrote {}", config_path.display()));
        return Ok(());
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ctx.config)?),
        _ => print!("{}", toml::to_string_pretty(&ctx.config)?),
    }
    Ok(())
}
