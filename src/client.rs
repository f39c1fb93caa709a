//! Per-client connection state
//!
//! A [`Client`] is created when a connection is accepted and lives inside an
//! `Arc` shared between its reader thread (which owns the read half of the
//! socket and performs cleanup on exit), the registry, and any thread
//! currently routing a message to it. Writes go through a cloned stream
//! handle behind a mutex so messages to one client never interleave.

use crate::error::Result;
use crate::wire::{self, Message};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Write timeout on client sockets. A peer that cannot take a message
/// within this window is treated as a dead consumer.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Receive timeout on client sockets, so reader threads can observe the
/// stop flag while a peer is idle.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Connection lifecycle. Transitions are strictly forward; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClientState {
    Unauthenticated = 0,
    Connected = 1,
    Closed = 2,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unauthenticated,
            1 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

/// A notification filter. Filters are matched against the full payload of
/// a notification, conventionally of the form `ACTION ARG`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Payload equals the body exactly.
    Match(String),
    /// Body is a literal prefix of the payload.
    Action(String),
    /// Body equals the leading action token: the payload byte immediately
    /// after the body must be a space.
    Prefix(String),
}

impl Filter {
    /// Build a filter from its wire type integer (1 MATCH, 2 ACTION,
    /// 3 PREFIX).
    pub fn from_wire(kind: u8, body: String) -> Option<Self> {
        match kind {
            1 => Some(Self::Match(body)),
            2 => Some(Self::Action(body)),
            3 => Some(Self::Prefix(body)),
            _ => None,
        }
    }

    pub fn matches(&self, payload: &str) -> bool {
        match self {
            Self::Match(body) => payload == body,
            Self::Action(body) => payload.starts_with(body.as_str()),
            Self::Prefix(body) => {
                payload.starts_with(body.as_str())
                    && payload.as_bytes().get(body.len()) == Some(&b' ')
            }
        }
    }
}

/// One connected application.
pub struct Client {
    id: u32,
    peer: SocketAddr,
    state: AtomicU8,
    writer: Mutex<TcpStream>,
    filters: RwLock<Vec<Filter>>,
    subscriptions: Mutex<HashSet<String>>,
}

impl Client {
    /// Wrap an accepted stream. Applies the receive and send timeouts and
    /// clones a write handle; the original stream stays with the caller's
    /// reader thread.
    pub(crate) fn new(id: u32, stream: &TcpStream) -> Result<Self> {
        stream.set_read_timeout(Some(RECV_TIMEOUT))?;
        stream.set_write_timeout(Some(SEND_TIMEOUT))?;
        Ok(Self {
            id,
            peer: stream.peer_addr()?,
            state: AtomicU8::new(ClientState::Unauthenticated as u8),
            writer: Mutex::new(stream.try_clone()?),
            filters: RwLock::new(Vec::new()),
            subscriptions: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ClientState::Closed
    }

    /// Advance the connection state. States only move forward, so a racing
    /// close always wins over a racing authentication.
    pub fn advance_state(&self, to: ClientState) {
        self.state.fetch_max(to as u8, Ordering::SeqCst);
    }

    /// Terminal close: flips the state and shuts the socket down so a
    /// blocked reader wakes immediately. Idempotent.
    pub fn mark_closed(&self) {
        let prev = self.state.fetch_max(ClientState::Closed as u8, Ordering::SeqCst);
        if prev != ClientState::Closed as u8 {
            let writer = self.writer.lock();
            let _ = writer.shutdown(Shutdown::Both);
        }
    }

    /// Send a kick notice and close the connection. The notice is
    /// best-effort; the close is not.
    pub fn kick(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        info!("Kicking client {}: {}", self.id, reason);
        let message = Message::new(["COMM", "KICKING", reason]);
        if self.send(&message).is_err() {
            debug!("Client {} kick notice could not be delivered", self.id);
        }
        self.mark_closed();
    }

    /// Encode and send one message, serialized against other senders to
    /// this client.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.send_packed(&wire::encode(message)?)
    }

    /// Send a pre-encoded frame. Fails fast when the peer cannot take the
    /// bytes within the send timeout; the caller decides whether that
    /// closes the client.
    pub fn send_packed(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(frame)?;
        writer.flush()?;
        Ok(())
    }

    pub fn add_filter(&self, filter: Filter) {
        self.filters.write().push(filter);
    }

    pub fn clear_filters(&self) {
        self.filters.write().clear();
    }

    /// True when any of the client's filters matches the payload. A client
    /// with no filters matches nothing.
    pub fn check_filters(&self, payload: &str) -> bool {
        self.filters.read().iter().any(|f| f.matches(payload))
    }

    /// Names of variables this client subscribes to. The variable store
    /// keeps this set mirrored with each variable's subscriber set.
    pub(crate) fn subscriptions(&self) -> &Mutex<HashSet<String>> {
        &self.subscriptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let near = TcpStream::connect(addr).unwrap();
        let (far, _) = listener.accept().unwrap();
        (near, far)
    }

    fn test_client() -> (Client, TcpStream) {
        let (peer, stream) = socket_pair();
        (Client::new(1, &stream).unwrap(), peer)
    }

    #[test]
    fn test_match_filter_is_exact() {
        let filter = Filter::Match("MISSION START".to_string());
        assert!(filter.matches("MISSION START"));
        assert!(!filter.matches("MISSION START NOW"));
        assert!(!filter.matches("MISSION"));
    }

    #[test]
    fn test_action_filter_is_literal_prefix() {
        let filter = Filter::Action("MISSION".to_string());
        assert!(filter.matches("MISSION START"));
        assert!(filter.matches("MISSIONX"));
        assert!(filter.matches("MISSION"));
        assert!(!filter.matches("MISSIO"));
    }

    #[test]
    fn test_prefix_filter_requires_token_boundary() {
        let filter = Filter::Prefix("MISSION".to_string());
        assert!(filter.matches("MISSION START"));
        assert!(!filter.matches("MISSIONX"));
        assert!(!filter.matches("MISSIONX START"));
        // No character after the body at all: not a token boundary.
        assert!(!filter.matches("MISSION"));
    }

    #[test]
    fn test_filter_wire_types() {
        assert_eq!(
            Filter::from_wire(1, "a".into()),
            Some(Filter::Match("a".into()))
        );
        assert_eq!(
            Filter::from_wire(2, "a".into()),
            Some(Filter::Action("a".into()))
        );
        assert_eq!(
            Filter::from_wire(3, "a".into()),
            Some(Filter::Prefix("a".into()))
        );
        assert_eq!(Filter::from_wire(4, "a".into()), None);
        assert_eq!(Filter::from_wire(0, "a".into()), None);
    }

    #[test]
    fn test_no_filters_matches_nothing() {
        let (client, _peer) = test_client();
        assert!(!client.check_filters("MISSION START"));
    }

    #[test]
    fn test_any_filter_may_match() {
        let (client, _peer) = test_client();
        client.add_filter(Filter::Match("EXACT".to_string()));
        client.add_filter(Filter::Prefix("MISSION".to_string()));
        assert!(client.check_filters("EXACT"));
        assert!(client.check_filters("MISSION START"));
        assert!(!client.check_filters("OTHER THING"));

        client.clear_filters();
        assert!(!client.check_filters("EXACT"));
    }

    #[test]
    fn test_state_is_monotone() {
        let (client, _peer) = test_client();
        assert_eq!(client.state(), ClientState::Unauthenticated);

        client.advance_state(ClientState::Connected);
        assert_eq!(client.state(), ClientState::Connected);

        // A stale transition back to Unauthenticated must not regress.
        client.advance_state(ClientState::Unauthenticated);
        assert_eq!(client.state(), ClientState::Connected);

        client.mark_closed();
        assert_eq!(client.state(), ClientState::Closed);

        client.advance_state(ClientState::Connected);
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[test]
    fn test_send_reaches_peer() {
        let (mut peer, stream) = socket_pair();
        let client = Client::new(9, &stream).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        client
            .send(&Message::with_request_id(5, ["COMM", "SUCCESS"]))
            .unwrap();

        let received = wire::read_message(&mut peer).unwrap().unwrap();
        assert_eq!(received.request_id, 5);
        assert_eq!(received.component(1), Some("SUCCESS"));
    }

    #[test]
    fn test_send_after_close_fails() {
        let (_peer, stream) = socket_pair();
        let client = Client::new(2, &stream).unwrap();
        client.mark_closed();
        assert!(client.send(&Message::new(["COMM", "CLOSING"])).is_err());
    }
}
