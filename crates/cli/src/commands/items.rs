//! Listing and pruning indexed items

use anyhow::{bail, Result};
use appdex_common::{IndexedItem, ItemKind};
use clap::Args;
use serde::Serialize;

use super::Context;
use crate::output::{format_size, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ListArgs {
    /// Only items whose name, description, dependencies or path match
    #[arg(short, long)]
    pub search: Option<String>,

    /// Only favourites
    #[arg(short, long)]
    pub favourites: bool,
}

/// Item display wrapper for serialization
#[derive(Serialize)]
pub struct ItemDisplay {
    pub id: i64,
    pub simple_id: String,
    pub kind: ItemKind,
    pub name: String,
    pub port: Option<u16>,
    pub framework: Option<String>,
    pub size: u64,
    pub thumbnail: bool,
    pub favourite: bool,
    pub path: String,
}

impl From<IndexedItem> for ItemDisplay {
    fn from(item: IndexedItem) -> Self {
        Self {
            thumbnail: item.has_thumbnail(),
            id: item.id,
            simple_id: item.simple_id,
            kind: item.kind,
            name: item.name,
            port: item.port,
            framework: item.framework.map(|f| f.to_string()),
            size: item.file_size,
            favourite: item.is_favourite,
            path: item.main_file_path,
        }
    }
}

impl TableDisplay for ItemDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Ref", "Kind", "Name", "Port", "Size", "Thumb", "Fav", "Path"]
    }

    fn row(&self) -> Vec<String> {
        let kind = match self.kind {
            ItemKind::PythonApp => match &self.framework {
                Some(framework) => format!("python/{}", framework),
                None => "python".to_string(),
            },
            ItemKind::StandaloneHtml => "html".to_string(),
        };
        vec![
            self.id.to_string(),
            self.simple_id.clone(),
            kind,
            self.name.clone(),
            self.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            format_size(self.size),
            if self.thumbnail { "yes" } else { "no" }.to_string(),
            if self.favourite { "★" } else { "" }.to_string(),
            self.path.clone(),
        ]
    }
}

pub fn list(ctx: &Context, args: ListArgs, format: OutputFormat) -> Result<()> {
    let mut items = match args.search.as_deref().map(str::trim) {
        Some(q) if !q.is_empty() => ctx.db.search_items(q)?,
        _ if args.favourites => ctx.db.list_favourites()?,
        _ => ctx.db.list_items()?,
    };
    if args.favourites {
        items.retain(|item| item.is_favourite);
    }

    let display: Vec<ItemDisplay> = items.into_iter().map(ItemDisplay::from).collect();
    print_list(&display, format);
    Ok(())
}

/// Remove by numeric id or simple id (`p001`)
pub fn remove(ctx: &Context, id: &str) -> Result<()> {
    let item = match id.parse::<i64>() {
        Ok(numeric) => ctx.db.get_item(numeric)?,
        Err(_) => ctx
            .db
            .list_items()?
            .into_iter()
            .find(|item| item.simple_id.eq_ignore_ascii_case(id)),
    };
    let Some(item) = item else {
        bail!("no item with id {}", id);
    };

    let removed = ctx.db.remove_item(item.id)?;
    print_success(&format!("Removed {} ({})", removed.name, removed.simple_id));
    Ok(())
}

pub fn cleanup(ctx: &Context) -> Result<()> {
    let removed = ctx.db.cleanup_missing()?;
    print_success(&format!("Removed {} records whose files no longer exist", removed));
    Ok(())
}
