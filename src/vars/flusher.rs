//! Background database writer
//!
//! A single flusher thread owns the on-disk database. Writers signal it
//! through [`FlushSignal`]; multiple requests between two flushes coalesce
//! into one (at most one flush is ever pending). Each flush writes a
//! scratch file next to the database and atomically renames it into place,
//! so a crash leaves at worst a stale but consistent previous version.

use super::StoreInner;
use crate::error::Result;
use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Default)]
struct FlushState {
    pending: bool,
    stop: bool,
}

pub(super) struct FlushSignal {
    state: Mutex<FlushState>,
    cond: Condvar,
}

impl FlushSignal {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(FlushState::default()),
            cond: Condvar::new(),
        }
    }

    /// Ask the flusher to write the database out.
    pub(super) fn request(&self) {
        let mut state = self.state.lock();
        state.pending = true;
        self.cond.notify_one();
    }

    /// Stop the flusher after one final flush.
    pub(super) fn stop(&self) {
        let mut state = self.state.lock();
        state.pending = true;
        state.stop = true;
        self.cond.notify_one();
    }
}

/// Flusher thread body.
pub(super) fn run(inner: &StoreInner) {
    loop {
        let stop = {
            let mut state = inner.flush.state.lock();
            while !state.pending && !state.stop {
                inner.flush.cond.wait(&mut state);
            }
            state.pending = false;
            state.stop
        };

        // A failure leaves the previous database untouched on disk.
        if let Err(e) = write_db(inner) {
            error!("Unable to flush variable database: {}", e);
        }

        if stop {
            break;
        }
    }
    debug!("Database flusher exiting");
}

fn write_db(inner: &StoreInner) -> Result<()> {
    let scratch = PathBuf::from(format!("{}.0", inner.db_path.display()));

    {
        let mut file = BufWriter::new(File::create(&scratch)?);
        writeln!(file, "# {:<18} = {}", "VARIABLE", "VALUE")?;
        for name in &inner.persistent_order {
            if let Some(var) = inner.vars.get(name) {
                writeln!(file, "{:<20} = {:.4}", name, *var.value.read())?;
            }
        }
        file.flush()?;
    }

    fs::rename(&scratch, &inner.db_path)?;
    Ok(())
}
