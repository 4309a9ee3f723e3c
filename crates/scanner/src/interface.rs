//! Locate the HTML front-end that belongs to a Python app

use std::path::{Path, PathBuf};

/// Candidate locations relative to the app directory, highest priority first
pub const INTERFACE_CANDIDATES: [&str; 5] = [
    "index.html",
    "templates/index.html",
    "static/index.html",
    "public/index.html",
    "frontend/index.html",
];

/// First candidate that exists as a regular file
pub fn resolve(app_dir: &Path) -> Option<PathBuf> {
    INTERFACE_CANDIDATES
        .iter()
        .map(|rel| app_dir.join(rel))
        .find(|path| path.is_file())
}
