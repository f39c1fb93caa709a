//! Hub supervisor
//!
//! Owns startup and shutdown sequencing: configuration in, log sink up,
//! variable store loaded (schema, then persisted values, then flusher),
//! then the network engine runs on the calling thread until a signal or a
//! stop request drains everything back down. Shutdown kicks all clients,
//! joins their reader threads, and forces one final database flush.

use crate::config::Config;
use crate::error::Result;
use crate::logging;
use crate::net::NetEngine;
use crate::registry::ClientRegistry;
use crate::vars::VarStore;
use log::info;
use parking_lot::Mutex;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Shared hub state handed to the network engine and the dispatcher.
pub struct Hub {
    pub config: Config,
    pub vars: VarStore,
    pub clients: ClientRegistry,
    stop: AtomicBool,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl Hub {
    pub fn new(config: Config, vars: VarStore) -> Self {
        Self {
            config,
            vars,
            clients: ClientRegistry::new(),
            stop: AtomicBool::new(false),
            bound_addr: Mutex::new(None),
        }
    }

    /// Cooperative stop flag, checked by the accept loop and every reader.
    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Raise the stop flag. The accept loop notices within its poll
    /// interval and begins the drain.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Address the server socket actually bound, once listening. With
    /// `bind_port = 0` this is where the OS-assigned port shows up.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub(crate) fn set_bound_addr(&self, addr: SocketAddr) {
        *self.bound_addr.lock() = Some(addr);
    }
}

pub struct HubApp {
    hub: Arc<Hub>,
}

impl HubApp {
    /// Bring the subsystems up. Fails (and the process exits nonzero) on
    /// schema or database errors; a missing configuration file is fine.
    pub fn new(config: Config) -> Result<Self> {
        logging::install();
        logging::configure(&config);

        info!("SetuHub v{} starting", env!("CARGO_PKG_VERSION"));

        let vars = VarStore::open(&config.var_defs, &config.var_db)?;

        Ok(Self {
            hub: Arc::new(Hub::new(config, vars)),
        })
    }

    /// Shared handle, mainly for embedding the hub in tests.
    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Serve until a termination signal or a stop request, then shut down
    /// in order. Runs the accept loop on the calling thread.
    pub fn run(&self) -> Result<()> {
        self.install_signal_handler()?;

        let engine = NetEngine::new(Arc::clone(&self.hub));
        let result = engine.run();

        self.hub.vars.shutdown();
        info!("SetuHub stopped");
        result
    }

    fn install_signal_handler(&self) -> Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        let hub = Arc::clone(&self.hub);
        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!("Caught signal {}! Shutting down...", signal);
                    hub.request_stop();
                }
            })?;
        Ok(())
    }
}
