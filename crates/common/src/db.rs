//! SQLite index of discovered items

use crate::types::{DiscoveredItem, FileFacts, Framework, IndexedItem, ItemKind};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Database wrapper for the item index
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// What an upsert did to the stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

const ITEM_COLUMNS: &str = "id, simple_id, item_type, name, folder_path, main_file_path, \
     html_interface_path, port, framework, thumbnail_path, description, file_size, \
     last_modified, dependencies, is_favourite, created_at, last_scanned";

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS indexed_items (
                id INTEGER PRIMARY KEY,
                simple_id TEXT NOT NULL UNIQUE,
                item_type TEXT NOT NULL,
                name TEXT NOT NULL,
                folder_path TEXT NOT NULL,
                main_file_path TEXT NOT NULL UNIQUE,
                html_interface_path TEXT,
                port INTEGER,
                framework TEXT,
                thumbnail_path TEXT,
                description TEXT,
                file_size INTEGER NOT NULL DEFAULT 0,
                last_modified TEXT,
                dependencies TEXT,
                is_favourite INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_scanned TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_items_folder ON indexed_items(folder_path);
            CREATE INDEX IF NOT EXISTS idx_items_name ON indexed_items(name);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Scan results
    // ========================================================================

    /// Insert or refresh an item keyed by its main file path.
    ///
    /// An existing record is only rewritten when a modification time was
    /// read and differs from the stored one; otherwise just `last_scanned`
    /// moves.
    pub fn upsert_item(
        &self,
        item: &DiscoveredItem,
        facts: &FileFacts,
    ) -> Result<(IndexedItem, UpsertOutcome)> {
        let main_file_path = item.main_path.to_string_lossy().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let outcome = {
            let conn = self.conn.lock();
            let existing: Option<(i64, Option<String>)> = conn
                .query_row(
                    "SELECT id, last_modified FROM indexed_items WHERE main_file_path = ?1",
                    params![main_file_path],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((id, stored_mtime))
                    if facts.last_modified.is_some() && stored_mtime != facts.last_modified =>
                {
                    conn.execute(
                        "UPDATE indexed_items SET item_type = ?1, name = ?2, folder_path = ?3,
                             html_interface_path = ?4, port = ?5, framework = ?6, file_size = ?7,
                             last_modified = ?8, dependencies = ?9, last_scanned = ?10
                         WHERE id = ?11",
                        params![
                            item.kind.as_str(),
                            item.name,
                            item.folder_path().to_string_lossy(),
                            item.interface_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                            item.declared_port,
                            item.framework.map(|f| f.as_str()),
                            facts.size as i64,
                            facts.last_modified,
                            facts.dependencies,
                            now,
                            id,
                        ],
                    )?;
                    UpsertOutcome::Updated
                }
                Some((id, _)) => {
                    conn.execute(
                        "UPDATE indexed_items SET last_scanned = ?1 WHERE id = ?2",
                        params![now, id],
                    )?;
                    UpsertOutcome::Unchanged
                }
                None => {
                    let simple_id = next_simple_id(&conn, item.kind)?;
                    conn.execute(
                        "INSERT INTO indexed_items (simple_id, item_type, name, folder_path,
                             main_file_path, html_interface_path, port, framework, file_size,
                             last_modified, dependencies, created_at, last_scanned)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                        params![
                            simple_id,
                            item.kind.as_str(),
                            item.name,
                            item.folder_path().to_string_lossy(),
                            main_file_path,
                            item.interface_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                            item.declared_port,
                            item.framework.map(|f| f.as_str()),
                            facts.size as i64,
                            facts.last_modified,
                            facts.dependencies,
                            now,
                        ],
                    )?;
                    UpsertOutcome::Inserted
                }
            }
        };

        debug!("Upserted {} ({:?})", main_file_path, outcome);

        let stored = self
            .get_item_by_path(&main_file_path)?
            .ok_or_else(|| Error::Internal(format!("item vanished after upsert: {}", main_file_path)))?;
        Ok((stored, outcome))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get an item by ID
    pub fn get_item(&self, id: i64) -> Result<Option<IndexedItem>> {
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                &format!("SELECT {} FROM indexed_items WHERE id = ?1", ITEM_COLUMNS),
                params![id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Get an item by its main file path
    pub fn get_item_by_path(&self, main_file_path: &str) -> Result<Option<IndexedItem>> {
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                &format!("SELECT {} FROM indexed_items WHERE main_file_path = ?1", ITEM_COLUMNS),
                params![main_file_path],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// List all items ordered by name
    pub fn list_items(&self) -> Result<Vec<IndexedItem>> {
        self.query_items(
            &format!("SELECT {} FROM indexed_items ORDER BY name, id", ITEM_COLUMNS),
            params![],
        )
    }

    /// List favourite items ordered by name
    pub fn list_favourites(&self) -> Result<Vec<IndexedItem>> {
        self.query_items(
            &format!(
                "SELECT {} FROM indexed_items WHERE is_favourite = 1 ORDER BY name, id",
                ITEM_COLUMNS
            ),
            params![],
        )
    }

    /// Search name, description, dependencies and path
    pub fn search_items(&self, query: &str) -> Result<Vec<IndexedItem>> {
        let pattern = format!("%{}%", query);
        self.query_items(
            &format!(
                "SELECT {} FROM indexed_items
                 WHERE name LIKE ?1 OR description LIKE ?1 OR dependencies LIKE ?1
                    OR main_file_path LIKE ?1
                 ORDER BY name, id",
                ITEM_COLUMNS
            ),
            params![pattern],
        )
    }

    /// Items with no thumbnail or whose thumbnail file has gone missing
    pub fn list_missing_thumbnails(&self) -> Result<Vec<IndexedItem>> {
        Ok(self
            .list_items()?
            .into_iter()
            .filter(|item| !item.has_thumbnail())
            .collect())
    }

    fn query_items(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<IndexedItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, item_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Record where an item's thumbnail was written
    pub fn set_thumbnail(&self, id: i64, thumbnail_path: &str) -> Result<()> {
        self.update_one(
            id,
            "UPDATE indexed_items SET thumbnail_path = ?1 WHERE id = ?2",
            params![thumbnail_path, id],
        )
    }

    /// Set the free-text description of an item
    pub fn set_description(&self, id: i64, description: &str) -> Result<()> {
        self.update_one(
            id,
            "UPDATE indexed_items SET description = ?1 WHERE id = ?2",
            params![description, id],
        )
    }

    /// Flip the favourite flag, returning the new value
    pub fn toggle_favourite(&self, id: i64) -> Result<bool> {
        self.update_one(
            id,
            "UPDATE indexed_items SET is_favourite = NOT is_favourite WHERE id = ?1",
            params![id],
        )?;
        let conn = self.conn.lock();
        let value: bool = conn.query_row(
            "SELECT is_favourite FROM indexed_items WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    fn update_one(&self, id: i64, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(sql, params)?;
        if rows == 0 {
            return Err(Error::item_not_found(id));
        }
        Ok(())
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove an item and its thumbnail file
    pub fn remove_item(&self, id: i64) -> Result<IndexedItem> {
        let item = self.get_item(id)?.ok_or_else(|| Error::item_not_found(id))?;
        {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM indexed_items WHERE id = ?1", params![id])?;
        }
        remove_thumbnail(&item);
        debug!("Removed item {} ({})", item.simple_id, item.main_file_path);
        Ok(item)
    }

    /// Items indexed directly in a folder
    pub fn list_folder_items(&self, folder_path: &str) -> Result<Vec<IndexedItem>> {
        self.query_items(
            &format!(
                "SELECT {} FROM indexed_items WHERE folder_path = ?1 ORDER BY name, id",
                ITEM_COLUMNS
            ),
            params![folder_path],
        )
    }

    /// Remove every item indexed from a folder
    pub fn remove_folder_items(&self, folder_path: &str) -> Result<usize> {
        let items = self.list_folder_items(folder_path)?;
        {
            let conn = self.conn.lock();
            conn.execute(
                "DELETE FROM indexed_items WHERE folder_path = ?1",
                params![folder_path],
            )?;
        }
        for item in &items {
            remove_thumbnail(item);
        }
        Ok(items.len())
    }

    /// Delete every record and its thumbnail file
    pub fn purge(&self) -> Result<usize> {
        let items = self.list_items()?;
        {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM indexed_items", [])?;
        }
        for item in &items {
            remove_thumbnail(item);
        }
        info!("Purged {} records", items.len());
        Ok(items.len())
    }

    /// Drop records whose main file no longer exists
    pub fn cleanup_missing(&self) -> Result<usize> {
        let dead: Vec<IndexedItem> = self
            .list_items()?
            .into_iter()
            .filter(|item| !Path::new(&item.main_file_path).exists())
            .collect();

        for item in &dead {
            self.remove_item(item.id)?;
        }
        if !dead.is_empty() {
            info!("Removed {} dead records", dead.len());
        }
        Ok(dead.len())
    }
}

/// Next `p001`-style id for a kind, one past the highest existing number
fn next_simple_id(conn: &Connection, kind: ItemKind) -> Result<String> {
    let prefix = kind.id_prefix();
    let highest: Option<i64> = conn.query_row(
        "SELECT MAX(CAST(SUBSTR(simple_id, 2) AS INTEGER)) FROM indexed_items
         WHERE simple_id LIKE ?1",
        params![format!("{}%", prefix)],
        |row| row.get(0),
    )?;
    Ok(format!("{}{:03}", prefix, highest.unwrap_or(0) + 1))
}

fn remove_thumbnail(item: &IndexedItem) {
    if let Some(path) = &item.thumbnail_path {
        let path = Path::new(path);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to delete thumbnail {}: {}", path.display(), e);
            }
        }
    }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<IndexedItem> {
    let kind: String = row.get(2)?;
    let kind = kind.parse::<ItemKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let framework: Option<String> = row.get(8)?;
    let file_size: i64 = row.get(11)?;

    Ok(IndexedItem {
        id: row.get(0)?,
        simple_id: row.get(1)?,
        kind,
        name: row.get(3)?,
        folder_path: row.get(4)?,
        main_file_path: row.get(5)?,
        html_interface_path: row.get(6)?,
        port: row.get(7)?,
        framework: framework.as_deref().map(Framework::parse),
        thumbnail_path: row.get(9)?,
        description: row.get(10)?,
        file_size: file_size.max(0) as u64,
        last_modified: row.get(12)?,
        dependencies: row.get(13)?,
        is_favourite: row.get(14)?,
        created_at: row.get(15)?,
        last_scanned: row.get(16)?,
    })
}
