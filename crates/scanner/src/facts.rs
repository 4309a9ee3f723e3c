//! File facts recorded alongside each indexed item

use appdex_common::{FileFacts, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;

/// Standard-library modules too common to be worth listing
const TRIVIAL_IMPORTS: [&str; 6] = ["os", "sys", "json", "time", "datetime", "pathlib"];

/// Size, modification time and (for Python sources) imported modules
pub fn file_facts(path: &Path) -> Result<FileFacts> {
    let metadata = std::fs::metadata(path)?;
    let last_modified = metadata
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

    let dependencies = if path.extension().map(|e| e == "py").unwrap_or(false) {
        let text = std::fs::read_to_string(path)?;
        extract_dependencies(&text)
    } else {
        None
    };

    Ok(FileFacts {
        size: metadata.len(),
        last_modified,
        dependencies,
    })
}

/// Root module names from `import` and `from ... import` lines, sorted and comma-joined
pub fn extract_dependencies(text: &str) -> Option<String> {
    let mut modules = BTreeSet::new();

    for line in text.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("import ") {
            for part in rest.split(',') {
                let name = part.split_whitespace().next().unwrap_or("");
                insert_root(&mut modules, name);
            }
        } else if let Some(rest) = line.strip_prefix("from ") {
            if let Some(name) = rest.split_whitespace().next() {
                insert_root(&mut modules, name);
            }
        }
    }

    if modules.is_empty() {
        None
    } else {
        Some(modules.into_iter().collect::<Vec<_>>().join(", "))
    }
}

fn insert_root(modules: &mut BTreeSet<String>, name: &str) {
    // relative imports (`from . import x`) name no package
    let root = name.split('.').next().unwrap_or("");
    if root.is_empty() || TRIVIAL_IMPORTS.contains(&root) {
        return;
    }
    if root.chars().all(|c| c.is_alphanumeric() || c == '_') {
        modules.insert(root.to_string());
    }
}
