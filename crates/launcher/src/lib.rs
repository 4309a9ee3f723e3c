//! Appdex Launcher
//!
//! Owns every server Appdex starts: Python apps as child processes and
//! standalone HTML files behind an in-process static server. Screenshots
//! are taken through the same registry so a warm server is reused.

pub mod browser;
pub mod capture;
mod process;
pub mod registry;
mod static_server;
pub mod worker;

pub use browser::{system_browser, Browser, HeadlessChrome, Unavailable};
pub use capture::Capturer;
pub use registry::{LaunchSpec, Lease, Registry, ServerHandle};
pub use worker::{CaptureFailure, CaptureQueue, Progress};
