//! Appdex Web
//!
//! JSON API over the item index, the process/port registry and the capture
//! queue.

pub mod server;

pub use server::{AppState, WebServer};
