//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! The configuration file is TOML-formatted with a flat key set:
//!
//! ```toml
//! bind_address = "127.0.0.1"
//! bind_port = 31427
//! password = "secret"
//!
//! var_defs = "/etc/setu/setu_var.defs"
//! var_db = "/var/lib/setu/setu_var.db"
//!
//! log_file = "/var/log/setu-hub.log"
//! log_level = "NORMAL"
//! log_replicate_stdout = true
//! ```
//!
//! Every key is optional; a missing configuration file is not an error and
//! the hub proceeds with the defaults above (empty password, no log file).
//! An empty password refuses all authentication, so a usable deployment
//! always sets one.

use crate::error::{Error, Result};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Hub configuration
///
/// Defaults match a localhost development deployment; see module docs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IPv4 address the server socket binds to.
    pub bind_address: String,

    /// TCP port the server socket binds to. 0 lets the OS pick a port
    /// (useful in tests; the bound address is logged).
    pub bind_port: u16,

    /// Shared password clients authenticate with. Empty refuses all
    /// authentication attempts.
    pub password: String,

    /// Path to the variable definitions file (required to exist).
    pub var_defs: String,

    /// Path to the persistent variable database (created when missing).
    pub var_db: String,

    /// Path of the hub log file. Empty logs to standard output only.
    pub log_file: String,

    /// Minimum level written to the log sink: one of DEBUG, INFO, NORMAL,
    /// WARNING, ERROR, CRITICAL.
    pub log_level: String,

    /// Replicate log lines to standard output even when a log file is set.
    pub log_replicate_stdout: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 31427,
            password: String::new(),
            var_defs: "setu_var.defs".to_string(),
            var_db: "setu_var.db".to_string(),
            log_file: String::new(),
            log_level: "NORMAL".to_string(),
            log_replicate_stdout: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file logs a warning and yields the built-in defaults; a
    /// file that exists but fails to parse is a fatal error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "Could not find configuration file {}! Continuing with default configuration!",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Bind address in `host:port` form.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}
