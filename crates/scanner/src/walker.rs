//! Recursive folder walk producing discovered items
//!
//! A scan makes two passes over the tree. The first classifies `.py` files
//! and resolves each app's interface; the second reports every `.html` file
//! that was not claimed as an interface during the first.

use crate::classify::{classify, Classification};
use crate::interface;
use appdex_common::{DiscoveredItem, ScanConfig, ScanStats};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Directory fragments never descended into
pub const DEFAULT_EXCLUDES: [&str; 6] = [
    "node_modules",
    ".venv",
    "site-packages",
    "__pycache__",
    ".git",
    ".svn",
];

/// Scanner options
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Path fragments; a directory whose path below the root contains one is pruned
    pub excludes: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ScanOptions {
    /// Built-in exclusions plus the configured extras
    pub fn from_config(config: &ScanConfig) -> Self {
        let mut options = Self::default();
        for extra in &config.extra_excludes {
            if !extra.is_empty() && !options.excludes.contains(extra) {
                options.excludes.push(extra.clone());
            }
        }
        options
    }
}

/// Folder walker
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    options: ScanOptions,
}

impl Scanner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Start an independent scan of `root`
    pub fn scan(&self, root: impl AsRef<Path>) -> Scan {
        let root = absolute(root.as_ref());
        debug!("Scanning {}", root.display());
        Scan {
            walker: walk(&root),
            root,
            excludes: self.options.excludes.clone(),
            pass: Pass::Apps,
            claimed: HashSet::new(),
            stats: ScanStats::default(),
        }
    }
}

/// Scan with the default exclusions
pub fn scan(root: impl AsRef<Path>) -> Scan {
    Scanner::default().scan(root)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Apps,
    Pages,
    Done,
}

/// Lazy sequence of items found under one root
pub struct Scan {
    root: PathBuf,
    excludes: Vec<String>,
    walker: walkdir::IntoIter,
    pass: Pass,
    claimed: HashSet<PathBuf>,
    stats: ScanStats,
}

impl Scan {
    /// Counters so far; final once the iterator is exhausted
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let relative = match entry.path().strip_prefix(&self.root) {
            Ok(rel) => rel.to_string_lossy(),
            Err(_) => return false,
        };
        self.excludes
            .iter()
            .any(|fragment| relative.contains(fragment.as_str()))
    }

    fn inspect_python(&mut self, path: &Path) -> Option<DiscoveredItem> {
        let text = match std::fs::read(path) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Skipping {}: not valid UTF-8", path.display());
                    self.stats.unreadable += 1;
                    return None;
                }
            },
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                self.stats.unreadable += 1;
                return None;
            }
        };

        match classify(&text) {
            Classification::App(sig) => {
                let app_dir = path.parent().unwrap_or(self.root.as_path());
                let interface_path = interface::resolve(app_dir);
                if let Some(html) = &interface_path {
                    self.claimed.insert(html.clone());
                }
                self.stats.python_apps += 1;
                Some(DiscoveredItem::python_app(
                    path.to_path_buf(),
                    interface_path,
                    sig.port,
                    sig.framework,
                ))
            }
            Classification::Reject(reason) => {
                debug!("Rejected {}: {:?}", path.display(), reason);
                self.stats.rejected += 1;
                None
            }
        }
    }
}

impl Iterator for Scan {
    type Item = DiscoveredItem;

    fn next(&mut self) -> Option<DiscoveredItem> {
        loop {
            if self.pass == Pass::Done {
                return None;
            }

            let entry = match self.walker.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    // Errors repeat on the second pass; count them once
                    if self.pass == Pass::Apps {
                        warn!("Skipping unreadable entry: {}", e);
                        self.stats.unreadable += 1;
                    }
                    continue;
                }
                None => {
                    self.pass = match self.pass {
                        Pass::Apps => {
                            self.walker = walk(&self.root);
                            Pass::Pages
                        }
                        _ => Pass::Done,
                    };
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                if entry.depth() > 0 && self.is_excluded(&entry) {
                    self.walker.skip_current_dir();
                    if self.pass == Pass::Apps {
                        debug!("Excluded {}", entry.path().display());
                        self.stats.excluded_dirs += 1;
                    }
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            match (self.pass, extension(path)) {
                (Pass::Apps, Some("py")) => {
                    if let Some(item) = self.inspect_python(path) {
                        return Some(item);
                    }
                }
                (Pass::Pages, Some("html")) => {
                    if !self.claimed.contains(path) {
                        self.stats.html_files += 1;
                        return Some(DiscoveredItem::standalone_html(path.to_path_buf()));
                    }
                }
                _ => {}
            }
        }
    }
}

fn walk(root: &Path) -> walkdir::IntoIter {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
