//! Notification fan-out
//!
//! A published notification is rebroadcast as `NOTIFY IN` to every
//! connected client whose filters match the payload. Matching happens
//! first over a snapshot of the live set, then the frame is written to the
//! matching clients; a failed write is normal attrition and closes that
//! client only. No registry or filter lock is held across a socket write.

use crate::client::Client;
use crate::error::Result;
use crate::registry::ClientRegistry;
use crate::wire::{self, Message};
use log::debug;
use std::sync::Arc;

/// Deliver `payload` to every matching connected client. Returns how many
/// clients the notification was written to.
pub fn broadcast(registry: &ClientRegistry, payload: &str) -> Result<usize> {
    let message = Message::new(["NOTIFY", "IN", payload]);
    let frame = wire::encode(&message)?;

    let matching: Vec<Arc<Client>> = registry
        .snapshot()
        .into_iter()
        .filter(|client| client.is_connected() && client.check_filters(payload))
        .collect();

    let mut delivered = 0;
    for client in matching {
        if client.send_packed(&frame).is_err() {
            debug!("Client {} disconnected, shutting down client", client.id());
            client.mark_closed();
        } else {
            delivered += 1;
        }
    }

    Ok(delivered)
}
