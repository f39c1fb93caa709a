//! Live client set
//!
//! Owns the `Arc<Client>` handles for every accepted connection. Reader
//! threads remove their client on exit; everyone else (router, WATCH
//! fan-out) works from snapshots or id lookups so no lock is held across a
//! socket write.

use crate::client::Client;
use crate::error::Result;
use parking_lot::Mutex;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Maximum simultaneous client connections.
pub const MAX_CLIENTS: usize = 128;

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<Client>>>,
    next_id: AtomicU32,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// Allocate a client record for an accepted stream and add it to the
    /// live set.
    pub fn register(&self, stream: &TcpStream) -> Result<Arc<Client>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(Client::new(id, stream)?);
        self.clients.lock().push(Arc::clone(&client));
        Ok(client)
    }

    /// Look a client up by id. Used to resolve variable subscriber ids;
    /// returns None for clients that have since disconnected.
    pub fn get(&self, id: u32) -> Option<Arc<Client>> {
        self.clients.lock().iter().find(|c| c.id() == id).cloned()
    }

    /// Clone of the current live set.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.lock().clone()
    }

    /// Drop a client from the live set. The record itself is freed when
    /// the last in-flight handle goes away.
    pub fn remove(&self, client: &Client) {
        self.clients.lock().retain(|c| c.id() != client.id());
    }
}
