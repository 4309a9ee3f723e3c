//! Persist a folder scan into the item index

use crate::facts::file_facts;
use crate::walker::{ScanOptions, Scanner};
use appdex_common::{Database, Error, FileFacts, IndexedItem, Result, ScanStats, UpsertOutcome};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of indexing one folder
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub root: PathBuf,
    pub stats: ScanStats,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub items: Vec<IndexedItem>,
    /// Ids inserted or updated by this pass
    #[serde(skip)]
    changed: Vec<i64>,
}

impl ScanReport {
    /// Items that should get a fresh screenshot: new, changed, or missing one
    pub fn needs_capture(&self) -> Vec<IndexedItem> {
        self.items
            .iter()
            .filter(|item| self.changed.contains(&item.id) || !item.has_thumbnail())
            .cloned()
            .collect()
    }
}

/// Walk `root`, upsert every discovered item and report what changed
pub fn index_folder(db: &Database, root: &Path, options: &ScanOptions) -> Result<ScanReport> {
    if !root.is_dir() {
        return Err(Error::NotFound {
            kind: "folder".to_string(),
            id: root.display().to_string(),
        });
    }

    let mut scan = Scanner::new(options.clone()).scan(root);
    let mut report = ScanReport {
        root: scan.root().to_path_buf(),
        ..Default::default()
    };

    for discovered in scan.by_ref() {
        let facts = file_facts(&discovered.main_path).unwrap_or_else(|e| {
            warn!("Could not stat {}: {}", discovered.main_path.display(), e);
            FileFacts::default()
        });

        let (item, outcome) = db.upsert_item(&discovered, &facts)?;
        match outcome {
            UpsertOutcome::Inserted => {
                report.inserted += 1;
                report.changed.push(item.id);
            }
            UpsertOutcome::Updated => {
                report.updated += 1;
                report.changed.push(item.id);
            }
            UpsertOutcome::Unchanged => report.unchanged += 1,
        }
        report.items.push(item);
    }
    report.stats = scan.stats();

    info!(
        "Indexed {}: {} found ({} new, {} updated), {} excluded, {} rejected, {} unreadable",
        report.root.display(),
        report.stats.found(),
        report.inserted,
        report.updated,
        report.stats.excluded_dirs,
        report.stats.rejected,
        report.stats.unreadable
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reindex_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("app.py"),
            "import flask\nif __name__ == '__main__':\n    app.run(port=5002)\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("page.html"), "<html></html>").unwrap();

        let db = Database::open_memory().unwrap();
        let first = index_folder(&db, tmp.path(), &ScanOptions::default()).unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.needs_capture().len(), 2);

        let second = index_folder(&db, tmp.path(), &ScanOptions::default()).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(db.list_items().unwrap().len(), 2);

        let app = db
            .get_item_by_path(&tmp.path().join("app.py").to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(app.port, Some(5002));
        assert_eq!(app.dependencies.as_deref(), Some("flask"));
    }

    #[test]
    fn test_missing_root() {
        let db = Database::open_memory().unwrap();
        let err = index_folder(&db, Path::new("/no/such/dir"), &ScanOptions::default());
        assert!(matches!(err, Err(Error::NotFound { .. })));
    }
}
