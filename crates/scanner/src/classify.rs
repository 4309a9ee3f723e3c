//! Source-text heuristics deciding whether a Python file is a runnable web app

use appdex_common::{Framework, DEFAULT_APP_PORT};
use once_cell::sync::Lazy;
use regex::Regex;

static SERVER_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"app\.run\(").unwrap());

// `.` stops at newlines, so the port must sit on the same line as the call
static RUN_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"app\.run\(.*?port\s*=\s*(\d+)").unwrap());

static MAIN_FUNCTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:async\s+)?def\s+main\s*\(\s*\)\s*:").unwrap());

static MAIN_GUARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"if\s+__name__\s*==\s*(?:"__main__"|'__main__')\s*:"#).unwrap()
});

/// What a positive classification extracted from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppSignature {
    pub port: u16,
    pub framework: Framework,
}

/// Why a file is not treated as an app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    Binary,
    NoServerStart,
    UtilityScript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    App(AppSignature),
    Reject(RejectReason),
}

impl Classification {
    pub fn is_app(&self) -> bool {
        matches!(self, Classification::App(_))
    }
}

/// Classify the contents of a `.py` file.
///
/// A file is an app when it calls `app.run(` and is not shaped like a
/// command-line utility (a `def main():` with no `__main__` guard).
pub fn classify(text: &str) -> Classification {
    if text.trim().is_empty() {
        return Classification::Reject(RejectReason::Empty);
    }
    if text.contains('\0') {
        return Classification::Reject(RejectReason::Binary);
    }
    if !SERVER_START.is_match(text) {
        return Classification::Reject(RejectReason::NoServerStart);
    }
    if MAIN_FUNCTION.is_match(text) && !MAIN_GUARD.is_match(text) {
        return Classification::Reject(RejectReason::UtilityScript);
    }

    Classification::App(AppSignature {
        port: declared_port(text),
        framework: detect_framework(text),
    })
}

/// Port passed to the first `app.run(... port=N` call, or the default
fn declared_port(text: &str) -> u16 {
    RUN_PORT
        .captures(text)
        .and_then(|caps| caps[1].parse::<u16>().ok())
        .filter(|port| *port != 0)
        .unwrap_or(DEFAULT_APP_PORT)
}

fn detect_framework(text: &str) -> Framework {
    if text.contains("from flask") || text.contains("import flask") {
        Framework::Flask
    } else if text.contains("from django") || text.contains("import django") {
        Framework::Django
    } else {
        Framework::Unknown
    }
}
