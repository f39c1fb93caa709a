//! Typed variable table with subscriptions and persistence
//!
//! The variable set is fixed at startup from the definitions file; clients
//! read and write values, and may subscribe to a variable to be pushed its
//! new value on every write. Variables flagged persistent are mirrored to
//! an on-disk database by a background flusher thread.
//!
//! Variables reference their subscribers by client id only, and each
//! client's subscription set holds variable names only, so either side can
//! disappear without dangling the other. The store keeps the two sets
//! mirrored: a client id appears in a variable's subscriber set exactly
//! when the variable's name appears in that client's subscription set.

pub mod defs;
mod flusher;

pub use defs::VarDef;

use crate::client::Client;
use crate::error::{Error, Result};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Why a variable operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VarError {
    #[error("no such variable")]
    NotFound,
    #[error("variable is read-only")]
    ReadOnly,
    #[error("not subscribed")]
    NotSubscribed,
}

/// Everything the dispatcher needs to push WATCH updates after a write:
/// the subscriber ids snapshotted atomically with the write itself.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchUpdate {
    pub name: String,
    pub value: f64,
    pub subscribers: Vec<u32>,
}

struct Variable {
    value: RwLock<f64>,
    default: f64,
    persistent: bool,
    readonly: bool,
    subscribers: Mutex<HashSet<u32>>,
}

struct StoreInner {
    vars: HashMap<String, Variable>,
    /// Persistent variable names in definition order; fixes the database
    /// line order across flushes.
    persistent_order: Vec<String>,
    db_path: PathBuf,
    flush: flusher::FlushSignal,
}

pub struct VarStore {
    inner: Arc<StoreInner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl VarStore {
    /// Load the definitions file, seed persistent values from the database
    /// (creating it when missing), and start the flusher if any variable
    /// is persistent.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(defs_path: P, db_path: Q) -> Result<Self> {
        let definitions = defs::load_defs(&defs_path)?;
        let db_path = db_path.as_ref().to_path_buf();

        let mut vars = HashMap::with_capacity(definitions.len());
        let mut persistent_order = Vec::new();
        for def in definitions {
            if def.persistent {
                persistent_order.push(def.name.clone());
            }
            let variable = Variable {
                value: RwLock::new(def.default),
                default: def.default,
                persistent: def.persistent,
                readonly: def.readonly,
                subscribers: Mutex::new(HashSet::new()),
            };
            if vars.insert(def.name.clone(), variable).is_some() {
                return Err(Error::Schema(format!(
                    "duplicate variable definition '{}'",
                    def.name
                )));
            }
        }

        if !persistent_order.is_empty() {
            seed_persistent(&vars, &db_path)?;
        }

        info!(
            "Loaded {} variable definitions ({} persistent)",
            vars.len(),
            persistent_order.len()
        );

        let inner = Arc::new(StoreInner {
            vars,
            persistent_order,
            db_path,
            flush: flusher::FlushSignal::new(),
        });

        let flusher = if inner.persistent_order.is_empty() {
            None
        } else {
            let thread_inner = Arc::clone(&inner);
            Some(
                thread::Builder::new()
                    .name("db-flusher".to_string())
                    .spawn(move || flusher::run(&thread_inner))?,
            )
        };

        Ok(Self {
            inner,
            flusher: Mutex::new(flusher),
        })
    }

    /// Current value and read-only flag.
    pub fn get(&self, name: &str) -> Option<(f64, bool)> {
        let var = self.inner.vars.get(name)?;
        Some((*var.value.read(), var.readonly))
    }

    /// Default value from the definitions file.
    pub fn default_of(&self, name: &str) -> Option<f64> {
        self.inner.vars.get(name).map(|var| var.default)
    }

    /// Write a value.
    ///
    /// The subscriber snapshot in the returned [`WatchUpdate`] is taken
    /// while the value lock is still held, so every write's fan-out sees
    /// the subscriber set as of exactly that write. Sending the updates is
    /// the caller's job, after all locks are released.
    pub fn set(&self, name: &str, value: f64) -> std::result::Result<WatchUpdate, VarError> {
        let var = self.inner.vars.get(name).ok_or(VarError::NotFound)?;
        if var.readonly {
            return Err(VarError::ReadOnly);
        }

        let subscribers = {
            let mut slot = var.value.write();
            *slot = value;
            if var.persistent {
                self.inner.flush.request();
            }
            var.subscribers.lock().iter().copied().collect()
        };

        Ok(WatchUpdate {
            name: name.to_string(),
            value,
            subscribers,
        })
    }

    /// Add `client` to the variable's subscribers and mirror the variable
    /// name into the client's subscription set. Idempotent.
    pub fn subscribe(&self, client: &Client, name: &str) -> std::result::Result<(), VarError> {
        let var = self.inner.vars.get(name).ok_or(VarError::NotFound)?;
        client.subscriptions().lock().insert(name.to_string());
        var.subscribers.lock().insert(client.id());
        debug!("Client {} subscribed to '{}'", client.id(), name);
        Ok(())
    }

    /// Symmetric removal.
    pub fn unsubscribe(&self, client: &Client, name: &str) -> std::result::Result<(), VarError> {
        let var = self.inner.vars.get(name).ok_or(VarError::NotFound)?;
        if !client.subscriptions().lock().remove(name) {
            return Err(VarError::NotSubscribed);
        }
        var.subscribers.lock().remove(&client.id());
        debug!("Client {} unsubscribed from '{}'", client.id(), name);
        Ok(())
    }

    /// Remove the client from every variable's subscriber set. Called once
    /// while the client is being reaped.
    pub fn drop_client(&self, client: &Client) {
        let names: Vec<String> = client.subscriptions().lock().drain().collect();
        for name in names {
            if let Some(var) = self.inner.vars.get(&name) {
                var.subscribers.lock().remove(&client.id());
            }
        }
    }

    /// Stop the flusher after one final flush. Idempotent.
    pub fn shutdown(&self) {
        if let Some(handle) = self.flusher.lock().take() {
            self.inner.flush.stop();
            let _ = handle.join();
        }
    }
}

impl Drop for VarStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Seed current values from the on-disk database, creating an empty file
/// when none exists yet. Names missing from the definitions are fatal;
/// values for non-persistent variables are ignored with a warning.
fn seed_persistent(vars: &HashMap<String, Variable>, db_path: &Path) -> Result<()> {
    if !db_path.exists() {
        File::create(db_path).map_err(|e| {
            Error::Db(format!(
                "unable to create variable database {}: {}",
                db_path.display(),
                e
            ))
        })?;
        return Ok(());
    }

    for (name, value) in defs::load_db(db_path)? {
        match vars.get(&name) {
            None => {
                return Err(Error::Db(format!(
                    "variable '{}' found in database but not in variable definitions",
                    name
                )));
            }
            Some(var) if !var.persistent => {
                warn!(
                    "Ignoring database value for non-persistent variable '{}'",
                    name
                );
            }
            Some(var) => *var.value.write() = value,
        }
    }

    Ok(())
}
