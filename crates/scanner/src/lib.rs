//! Appdex Scanner
//!
//! Finds Python web apps and standalone HTML files under a folder and
//! records them in the index.

pub mod classify;
pub mod facts;
pub mod index;
pub mod interface;
pub mod walker;

pub use classify::{classify, AppSignature, Classification, RejectReason};
pub use facts::file_facts;
pub use index::{index_folder, ScanReport};
pub use walker::{scan, Scan, ScanOptions, Scanner, DEFAULT_EXCLUDES};
