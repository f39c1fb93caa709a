//! SetuHub - central message hub for the Setu robotics framework
//!
//! Applications connect over TCP, authenticate with a shared password, and
//! then use one framed channel to:
//!
//! - publish and subscribe broadcast notifications, filtered per client
//! - read and write a fixed set of typed variables, optionally persisted
//!   to disk, with push updates on change
//! - ship log records to the framework's central log sink
//!
//! The hub is thread-per-client: one accept loop, one reader thread per
//! connection, a background database flusher, and a signal watcher.

pub mod app;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod net;
pub mod registry;
pub mod router;
pub mod vars;
pub mod wire;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
