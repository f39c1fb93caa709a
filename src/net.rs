//! Network engine: listener and per-client reader threads
//!
//! One non-blocking accept loop runs on the calling thread; every accepted
//! connection gets its own reader thread that decodes frames and hands
//! them to the dispatcher. Reader threads own their client's cleanup: on
//! exit they drop its variable subscriptions, clear its filters, and
//! remove it from the registry, so the record is freed when the last
//! in-flight handle drops.
//!
//! Shutdown: the supervisor raises the stop flag, the accept loop exits,
//! every live client is kicked with "Hub closing" (which also shuts their
//! sockets down and wakes blocked reads), and every reader thread is
//! joined before the engine returns.

use crate::app::Hub;
use crate::client::Client;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::registry::MAX_CLIENTS;
use crate::wire::{self, Message};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Idle sleep between accept polls while no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

pub struct NetEngine {
    hub: Arc<Hub>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl NetEngine {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Bind, accept, and serve until the stop flag rises, then drain every
    /// client connection before returning.
    pub fn run(&self) -> Result<()> {
        let addr = self.hub.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .map_err(|e| Error::Net(format!("error binding socket to {}: {}", addr, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Net(format!("error configuring server socket: {}", e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Net(format!("error reading bound address: {}", e)))?;
        self.hub.set_bound_addr(local_addr);
        info!("Accepting client connections on {}", local_addr);

        while !self.hub.stopping() {
            match listener.accept() {
                Ok((stream, peer)) => self.accept_client(stream, peer),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    self.reap_finished_readers();
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => error!("Error accepting new client connection: {}", e),
            }
        }

        drop(listener);
        self.drain_clients();
        Ok(())
    }

    fn accept_client(&self, stream: TcpStream, peer: SocketAddr) {
        if self.hub.clients.len() >= MAX_CLIENTS {
            error!(
                "Unable to accept new client connection from {}! Maximum clients ({}) exceeded",
                peer, MAX_CLIENTS
            );
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        let client = match self.hub.clients.register(&stream) {
            Ok(client) => client,
            Err(e) => {
                error!("Error setting up client connection from {}: {}", peer, e);
                return;
            }
        };
        debug!("Accepted new client connection from {}", peer);

        let hub = Arc::clone(&self.hub);
        let reader_client = Arc::clone(&client);
        let spawned = thread::Builder::new()
            .name(format!("client-{}", client.id()))
            .spawn(move || reader_loop(hub, reader_client, stream));

        match spawned {
            Ok(handle) => self.readers.lock().push(handle),
            Err(e) => {
                error!("Error spawning reader thread: {}", e);
                client.mark_closed();
                self.hub.vars.drop_client(&client);
                self.hub.clients.remove(&client);
            }
        }
    }

    /// Join reader threads that already exited, so the handle list does
    /// not grow for the hub's whole lifetime.
    fn reap_finished_readers(&self) {
        let mut readers = self.readers.lock();
        let mut index = 0;
        while index < readers.len() {
            if readers[index].is_finished() {
                let _ = readers.swap_remove(index).join();
            } else {
                index += 1;
            }
        }
    }

    /// Kick every live client and join every reader thread.
    fn drain_clients(&self) {
        let clients = self.hub.clients.snapshot();
        if !clients.is_empty() {
            info!("Closing {} client connections", clients.len());
        }
        let kick = wire::encode(&Message::new(["COMM", "KICKING", "Hub closing"])).ok();
        for client in clients {
            if client.is_connected() {
                if let Some(frame) = &kick {
                    let _ = client.send_packed(frame);
                }
            }
            client.mark_closed();
        }

        let readers: Vec<JoinHandle<()>> = self.readers.lock().drain(..).collect();
        for handle in readers {
            let _ = handle.join();
        }
    }
}

/// Per-client reader: decode one message at a time and dispatch it, until
/// the connection dies, the client is closed, or the hub stops. Cleanup
/// runs here, exactly once, whatever the exit path.
fn reader_loop(hub: Arc<Hub>, client: Arc<Client>, mut stream: TcpStream) {
    while !client.is_closed() && !hub.stopping() {
        match wire::read_message(&mut stream) {
            Ok(Some(message)) => dispatch::dispatch(&hub, &client, &message),
            Ok(None) => {} // idle receive timeout; re-check stop conditions
            Err(e) => {
                debug!("Client {}: {}", client.id(), e);
                client.mark_closed();
            }
        }
    }

    client.mark_closed();
    hub.vars.drop_client(&client);
    client.clear_filters();
    hub.clients.remove(&client);
    info!("Client {} ({}) disconnected", client.id(), client.peer());
}
