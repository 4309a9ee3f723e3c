//! Core types for Appdex

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Port assumed for a Python app whose source does not declare one
pub const DEFAULT_APP_PORT: u16 = 5000;

/// What kind of thing a scan found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    PythonApp,
    StandaloneHtml,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::PythonApp => "python_app",
            ItemKind::StandaloneHtml => "standalone_html",
        }
    }

    /// Prefix used for simple ids (`p001`, `h001`)
    pub fn id_prefix(&self) -> char {
        match self {
            ItemKind::PythonApp => 'p',
            ItemKind::StandaloneHtml => 'h',
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "python_app" => Ok(ItemKind::PythonApp),
            "standalone_html" => Ok(ItemKind::StandaloneHtml),
            other => Err(crate::Error::Internal(format!("unknown item kind: {}", other))),
        }
    }
}

/// Web framework a Python app imports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Flask,
    Django,
    Unknown,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Flask => "flask",
            Framework::Django => "django",
            Framework::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "flask" => Framework::Flask,
            "django" => Framework::Django,
            _ => Framework::Unknown,
        }
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One application or HTML file found by a scan pass.
///
/// A `PythonApp` always carries a resolved `declared_port` and a `framework`;
/// a `StandaloneHtml` never does (its port is assigned when it is served).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredItem {
    pub kind: ItemKind,
    pub main_path: PathBuf,
    pub interface_path: Option<PathBuf>,
    pub declared_port: Option<u16>,
    pub framework: Option<Framework>,
    pub name: String,
}

impl DiscoveredItem {
    pub fn python_app(
        main_path: PathBuf,
        interface_path: Option<PathBuf>,
        declared_port: u16,
        framework: Framework,
    ) -> Self {
        Self {
            kind: ItemKind::PythonApp,
            name: display_name(&main_path),
            main_path,
            interface_path,
            declared_port: Some(declared_port),
            framework: Some(framework),
        }
    }

    pub fn standalone_html(main_path: PathBuf) -> Self {
        Self {
            kind: ItemKind::StandaloneHtml,
            name: display_name(&main_path),
            main_path,
            interface_path: None,
            declared_port: None,
            framework: None,
        }
    }

    /// Directory holding the entry file
    pub fn folder_path(&self) -> &Path {
        self.main_path.parent().unwrap_or(Path::new("/"))
    }
}

/// Counters reported by a scan pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub python_apps: usize,
    pub html_files: usize,
    pub excluded_dirs: usize,
    pub rejected: usize,
    pub unreadable: usize,
}

impl ScanStats {
    pub fn found(&self) -> usize {
        self.python_apps + self.html_files
    }
}

/// Size, mtime and imports of an entry file, recorded alongside the item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFacts {
    pub size: u64,
    pub last_modified: Option<String>,
    pub dependencies: Option<String>,
}

/// A persisted item in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedItem {
    pub id: i64,
    pub simple_id: String,
    pub kind: ItemKind,
    pub name: String,
    pub folder_path: String,
    pub main_file_path: String,
    pub html_interface_path: Option<String>,
    pub port: Option<u16>,
    pub framework: Option<Framework>,
    pub thumbnail_path: Option<String>,
    pub description: Option<String>,
    pub file_size: u64,
    pub last_modified: Option<String>,
    pub dependencies: Option<String>,
    pub is_favourite: bool,
    pub created_at: String,
    pub last_scanned: String,
}

impl IndexedItem {
    /// Rebuild the scan-time view of this record, e.g. to capture it again
    pub fn to_discovered(&self) -> DiscoveredItem {
        DiscoveredItem {
            kind: self.kind,
            main_path: PathBuf::from(&self.main_file_path),
            interface_path: self.html_interface_path.as_ref().map(PathBuf::from),
            declared_port: match self.kind {
                ItemKind::PythonApp => Some(self.port.unwrap_or(DEFAULT_APP_PORT)),
                ItemKind::StandaloneHtml => None,
            },
            framework: match self.kind {
                ItemKind::PythonApp => Some(self.framework.unwrap_or(Framework::Unknown)),
                ItemKind::StandaloneHtml => None,
            },
            name: self.name.clone(),
        }
    }

    /// Whether a usable thumbnail file exists on disk
    pub fn has_thumbnail(&self) -> bool {
        self.thumbnail_path
            .as_deref()
            .map(|p| Path::new(p).is_file())
            .unwrap_or(false)
    }
}

/// Derive a display name from a file stem: `my_cool_app.py` -> `My Cool App`
pub fn display_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().replace('_', " "))
        .unwrap_or_default();
    title_case(&stem)
}

/// Uppercase the first letter of every run of letters, lowercase the rest
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_is_letter = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_is_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_is_letter = true;
        } else {
            out.push(c);
            prev_is_letter = false;
        }
    }
    out
}

/// Thumbnail file name for a simple id: `p001` -> `p00001.png`
pub fn thumbnail_file_name(simple_id: &str) -> String {
    let mut chars = simple_id.chars();
    match (chars.next(), chars.as_str().parse::<u32>()) {
        (Some(prefix @ ('p' | 'h')), Ok(number)) if simple_id.len() >= 4 => {
            format!("{}{:05}.png", prefix, number)
        }
        _ => format!("{}.png", simple_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(Path::new("/x/my_cool_app.py")), "My Cool App");
        assert_eq!(display_name(Path::new("/x/INDEX.html")), "Index");
        assert_eq!(display_name(Path::new("/x/web-ui2go.html")), "Web-Ui2Go");
    }

    #[test]
    fn test_thumbnail_file_name() {
        assert_eq!(thumbnail_file_name("p001"), "p00001.png");
        assert_eq!(thumbnail_file_name("h1234"), "h01234.png");
        assert_eq!(thumbnail_file_name("unknown"), "unknown.png");
    }

    #[test]
    fn test_item_invariants() {
        let app = DiscoveredItem::python_app(
            PathBuf::from("/srv/demo/app.py"),
            None,
            DEFAULT_APP_PORT,
            Framework::Flask,
        );
        assert_eq!(app.declared_port, Some(5000));
        assert_eq!(app.folder_path(), Path::new("/srv/demo"));

        let page = DiscoveredItem::standalone_html(PathBuf::from("/srv/demo/page.html"));
        assert_eq!(page.declared_port, None);
        assert_eq!(page.framework, None);
    }
}
