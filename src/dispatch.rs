//! Inbound message dispatch
//!
//! Classifies one decoded message by namespace and verb and routes it to
//! the owning subsystem. `COMM` is handled in every state so clients can
//! authenticate and part; everything else requires the sender to be
//! authenticated first. Malformed traffic of any shape kicks the sender;
//! a misbehaving client can only ever lose itself.

use crate::app::Hub;
use crate::client::{Client, ClientState, Filter};
use crate::logging::{self, LogLevel};
use crate::router;
use crate::vars::{VarError, WatchUpdate};
use crate::wire::{self, Message};
use log::{error, info, warn};
use std::sync::Arc;

/// Process one message from `client`.
pub fn dispatch(hub: &Hub, client: &Arc<Client>, message: &Message) {
    if message.components.is_empty() {
        client.kick("Illegal message");
        return;
    }

    match message.components[0].as_str() {
        "COMM" => dispatch_comm(hub, client, message),
        _ if client.state() != ClientState::Connected => client.kick("Unauthenticated request"),
        "NOTIFY" => dispatch_notify(hub, client, message),
        "VAR" => dispatch_var(hub, client, message),
        "WATCH" => dispatch_watch(hub, client, message),
        "LOG" => dispatch_log(client, message),
        _ => client.kick("Illegal message"),
    }
}

fn dispatch_comm(hub: &Hub, client: &Arc<Client>, message: &Message) {
    match (message.component(1), message.components.len()) {
        (Some("AUTH"), 3) => {
            let password = &hub.config.password;
            if password.is_empty() {
                logging::critical("No password set! Refusing to authenticate clients!");
                return;
            }

            if message.components[2] == *password {
                client.advance_state(ClientState::Connected);
                info!("Client {} authenticated", client.id());
                let reply = Message::with_request_id(message.request_id, ["COMM", "SUCCESS"]);
                if client.send(&reply).is_err() {
                    client.mark_closed();
                }
            } else {
                let reply = Message::with_request_id(message.request_id, ["COMM", "FAILURE"]);
                let _ = client.send(&reply);
                client.kick("Authentication failure");
            }
        }
        (Some("SHUTDOWN"), 2) => {
            info!("Client {} shutting down", client.id());
            let reply = Message::with_request_id(message.request_id, ["COMM", "CLOSING"]);
            let _ = client.send(&reply);
            client.mark_closed();
        }
        _ => client.kick("Illegal message"),
    }
}

fn dispatch_notify(hub: &Hub, client: &Arc<Client>, message: &Message) {
    match (message.component(1), message.components.len()) {
        (Some("OUT"), 3) => match router::broadcast(&hub.clients, &message.components[2]) {
            Ok(delivered) => {
                if delivered > 0 {
                    log::debug!(
                        "Notification from client {} delivered to {} clients",
                        client.id(),
                        delivered
                    );
                }
            }
            Err(e) => error!("Notification broadcast failed: {}", e),
        },
        (Some("ADD_FILTER"), 4) => {
            let filter = message.components[2]
                .parse::<u8>()
                .ok()
                .and_then(|kind| Filter::from_wire(kind, message.components[3].clone()));
            match filter {
                Some(filter) => client.add_filter(filter),
                None => client.kick("Illegal message"),
            }
        }
        (Some("CLEAR_FILTERS"), 2) => client.clear_filters(),
        _ => client.kick("Illegal message"),
    }
}

fn dispatch_var(hub: &Hub, client: &Arc<Client>, message: &Message) {
    match (message.component(1), message.components.len()) {
        (Some("GET"), 3) => {
            let name = &message.components[2];
            match hub.vars.get(name) {
                Some((value, readonly)) => {
                    let mode = if readonly { "RO" } else { "RW" };
                    let formatted = format!("{:.6}", value);
                    let reply = Message::with_request_id(
                        message.request_id,
                        ["VAR", "VALUE", mode, formatted.as_str()],
                    );
                    if client.send(&reply).is_err() {
                        client.mark_closed();
                    }
                }
                None => {
                    error!("Get attempted on nonexistent variable '{}'", name);
                    client.kick(&format!("Invalid variable access ({})", name));
                }
            }
        }
        (Some("SET"), 4) => {
            let name = &message.components[2];
            let value: f64 = match message.components[3].parse() {
                Ok(value) => value,
                Err(_) => {
                    client.kick("Illegal message");
                    return;
                }
            };
            match hub.vars.set(name, value) {
                Ok(update) => push_watch_updates(hub, &update),
                Err(e) => {
                    error!("Set of variable '{}' rejected: {}", name, e);
                    client.kick(&format!("Invalid variable access ({})", name));
                }
            }
        }
        _ => client.kick("Illegal message"),
    }
}

fn dispatch_watch(hub: &Hub, client: &Arc<Client>, message: &Message) {
    match (message.component(1), message.components.len()) {
        (Some("ADD"), 3) => {
            let name = &message.components[2];
            if let Err(e) = hub.vars.subscribe(client, name) {
                error!("Subscription to '{}' rejected: {}", name, e);
                client.kick(&format!("Invalid variable access ({})", name));
            }
        }
        (Some("DEL"), 3) => {
            let name = &message.components[2];
            match hub.vars.unsubscribe(client, name) {
                Ok(()) => {}
                Err(VarError::NotSubscribed) => warn!(
                    "Client {} dropped a subscription it did not hold on '{}'",
                    client.id(),
                    name
                ),
                Err(e) => {
                    error!("Unsubscription from '{}' rejected: {}", name, e);
                    client.kick(&format!("Invalid variable access ({})", name));
                }
            }
        }
        _ => client.kick("Illegal message"),
    }
}

fn dispatch_log(client: &Arc<Client>, message: &Message) {
    if message.components.len() != 4 {
        client.kick("Illegal message");
        return;
    }
    let level = message.components[2]
        .parse::<u8>()
        .ok()
        .and_then(LogLevel::from_wire);
    match level {
        Some(level) => logging::client_log(&message.components[1], level, &message.components[3]),
        None => client.kick("Illegal message"),
    }
}

/// Push a `WATCH` update to every subscriber snapshotted by the write.
/// Subscribers that have since disconnected resolve to nothing; a failed
/// write closes that subscriber only.
fn push_watch_updates(hub: &Hub, update: &WatchUpdate) {
    if update.subscribers.is_empty() {
        return;
    }

    let formatted = format!("{:.6}", update.value);
    let message = Message::new(["WATCH", update.name.as_str(), formatted.as_str()]);
    let frame = match wire::encode(&message) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Could not encode WATCH update for '{}': {}", update.name, e);
            return;
        }
    };

    for id in &update.subscribers {
        if let Some(subscriber) = hub.clients.get(*id) {
            if subscriber.send_packed(&frame).is_err() {
                subscriber.mark_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Hub;
    use crate::config::Config;
    use crate::vars::VarStore;
    use std::fs;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;
    use tempfile::TempDir;

    const DEFS: &str = "Depth = 0.0000, 0, 0\n\
                        ClockHz = 100, 0, 1\n\
                        PID.p = 0, 1, 0\n";

    struct Fixture {
        hub: Hub,
        listener: TcpListener,
        _dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let defs_path = dir.path().join("var.defs");
            fs::write(&defs_path, DEFS).unwrap();

            let config = Config {
                password: "secret".to_string(),
                var_defs: defs_path.display().to_string(),
                var_db: dir.path().join("var.db").display().to_string(),
                ..Config::default()
            };
            let vars = VarStore::open(&config.var_defs, &config.var_db).unwrap();
            let hub = Hub::new(config, vars);
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();

            Self {
                hub,
                listener,
                _dir: dir,
            }
        }

        /// One registered client plus the peer-side socket to read its
        /// traffic from.
        fn client(&self) -> (Arc<Client>, TcpStream) {
            let near = TcpStream::connect(self.listener.local_addr().unwrap()).unwrap();
            let (far, _) = self.listener.accept().unwrap();
            near.set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            let client = self.hub.clients.register(&far).unwrap();
            (client, near)
        }

        fn connected_client(&self) -> (Arc<Client>, TcpStream) {
            let (client, near) = self.client();
            client.advance_state(ClientState::Connected);
            (client, near)
        }
    }

    fn recv(stream: &mut TcpStream) -> Message {
        for _ in 0..10 {
            if let Some(message) = wire::read_message(stream).unwrap() {
                return message;
            }
        }
        panic!("no message arrived");
    }

    fn recv_nothing(stream: &mut TcpStream) {
        match wire::read_message(stream) {
            Ok(None) => {}
            other => panic!("expected silence, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_message_kicks() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(&f.hub, &client, &Message::default());

        let kick = recv(&mut near);
        assert_eq!(kick.components, vec!["COMM", "KICKING", "Illegal message"]);
        assert!(client.is_closed());
    }

    #[test]
    fn test_auth_success() {
        let f = Fixture::new();
        let (client, mut near) = f.client();

        dispatch(
            &f.hub,
            &client,
            &Message::with_request_id(1, ["COMM", "AUTH", "secret"]),
        );

        let reply = recv(&mut near);
        assert_eq!(reply.request_id, 1);
        assert_eq!(reply.components, vec!["COMM", "SUCCESS"]);
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[test]
    fn test_auth_failure_sends_failure_then_kicks() {
        let f = Fixture::new();
        let (client, mut near) = f.client();

        dispatch(
            &f.hub,
            &client,
            &Message::with_request_id(2, ["COMM", "AUTH", "wrong"]),
        );

        let failure = recv(&mut near);
        assert_eq!(failure.request_id, 2);
        assert_eq!(failure.components, vec!["COMM", "FAILURE"]);

        let kick = recv(&mut near);
        assert_eq!(
            kick.components,
            vec!["COMM", "KICKING", "Authentication failure"]
        );
        assert!(client.is_closed());
    }

    #[test]
    fn test_auth_refused_when_no_password_configured() {
        let dir = TempDir::new().unwrap();
        let defs_path = dir.path().join("var.defs");
        fs::write(&defs_path, DEFS).unwrap();
        let config = Config {
            var_defs: defs_path.display().to_string(),
            var_db: dir.path().join("var.db").display().to_string(),
            ..Config::default()
        };
        let vars = VarStore::open(&config.var_defs, &config.var_db).unwrap();
        let hub = Hub::new(config, vars);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut near = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (far, _) = listener.accept().unwrap();
        near.set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let client = hub.clients.register(&far).unwrap();

        dispatch(
            &hub,
            &client,
            &Message::with_request_id(1, ["COMM", "AUTH", "anything"]),
        );

        // No reply at all, and the client is left unauthenticated.
        recv_nothing(&mut near);
        assert_eq!(client.state(), ClientState::Unauthenticated);
    }

    #[test]
    fn test_shutdown_replies_closing() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(
            &f.hub,
            &client,
            &Message::with_request_id(9, ["COMM", "SHUTDOWN"]),
        );

        let reply = recv(&mut near);
        assert_eq!(reply.request_id, 9);
        assert_eq!(reply.components, vec!["COMM", "CLOSING"]);
        assert!(client.is_closed());
    }

    #[test]
    fn test_unauthenticated_request_kicks() {
        let f = Fixture::new();
        let (client, mut near) = f.client();

        dispatch(
            &f.hub,
            &client,
            &Message::new(["NOTIFY", "OUT", "MISSION START"]),
        );

        let kick = recv(&mut near);
        assert_eq!(
            kick.components,
            vec!["COMM", "KICKING", "Unauthenticated request"]
        );
    }

    #[test]
    fn test_var_get_round_trip() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(
            &f.hub,
            &client,
            &Message::with_request_id(4, ["VAR", "GET", "ClockHz"]),
        );

        let reply = recv(&mut near);
        assert_eq!(reply.request_id, 4);
        assert_eq!(
            reply.components,
            vec!["VAR", "VALUE", "RO", "100.000000"]
        );
    }

    #[test]
    fn test_var_get_unknown_kicks_with_name() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(&f.hub, &client, &Message::new(["VAR", "GET", "Ghost"]));

        let kick = recv(&mut near);
        assert_eq!(
            kick.components,
            vec!["COMM", "KICKING", "Invalid variable access (Ghost)"]
        );
    }

    #[test]
    fn test_var_set_readonly_kicks_with_name() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(
            &f.hub,
            &client,
            &Message::new(["VAR", "SET", "ClockHz", "200"]),
        );

        let kick = recv(&mut near);
        assert_eq!(
            kick.components,
            vec!["COMM", "KICKING", "Invalid variable access (ClockHz)"]
        );
        assert_eq!(f.hub.vars.get("ClockHz"), Some((100.0, true)));
    }

    #[test]
    fn test_var_set_bad_float_kicks() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(
            &f.hub,
            &client,
            &Message::new(["VAR", "SET", "Depth", "deep"]),
        );

        let kick = recv(&mut near);
        assert_eq!(kick.components, vec!["COMM", "KICKING", "Illegal message"]);
        assert_eq!(f.hub.vars.get("Depth"), Some((0.0, false)));
    }

    #[test]
    fn test_watch_add_then_set_pushes_update() {
        let f = Fixture::new();
        let (watcher, mut watcher_near) = f.connected_client();
        let (setter, _setter_near) = f.connected_client();

        dispatch(&f.hub, &watcher, &Message::new(["WATCH", "ADD", "Depth"]));
        dispatch(
            &f.hub,
            &setter,
            &Message::new(["VAR", "SET", "Depth", "1.5"]),
        );

        let push = recv(&mut watcher_near);
        assert_eq!(push.request_id, 0);
        assert_eq!(push.components, vec!["WATCH", "Depth", "1.500000"]);
    }

    #[test]
    fn test_watch_del_stops_updates() {
        let f = Fixture::new();
        let (watcher, mut watcher_near) = f.connected_client();
        let (setter, _setter_near) = f.connected_client();

        dispatch(&f.hub, &watcher, &Message::new(["WATCH", "ADD", "Depth"]));
        dispatch(&f.hub, &watcher, &Message::new(["WATCH", "DEL", "Depth"]));
        dispatch(
            &f.hub,
            &setter,
            &Message::new(["VAR", "SET", "Depth", "2.0"]),
        );

        recv_nothing(&mut watcher_near);
        assert!(!watcher.is_closed());
    }

    #[test]
    fn test_watch_unknown_variable_kicks() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(&f.hub, &client, &Message::new(["WATCH", "ADD", "Ghost"]));

        let kick = recv(&mut near);
        assert_eq!(
            kick.components,
            vec!["COMM", "KICKING", "Invalid variable access (Ghost)"]
        );
    }

    #[test]
    fn test_notify_filter_routing() {
        let f = Fixture::new();
        let (listener_client, mut listener_near) = f.connected_client();
        let (publisher, _publisher_near) = f.connected_client();

        dispatch(
            &f.hub,
            &listener_client,
            &Message::new(["NOTIFY", "ADD_FILTER", "3", "MISSION"]),
        );
        dispatch(
            &f.hub,
            &publisher,
            &Message::new(["NOTIFY", "OUT", "MISSIONX"]),
        );
        dispatch(
            &f.hub,
            &publisher,
            &Message::new(["NOTIFY", "OUT", "MISSION START"]),
        );

        // Only the boundary-respecting payload arrives.
        let delivered = recv(&mut listener_near);
        assert_eq!(
            delivered.components,
            vec!["NOTIFY", "IN", "MISSION START"]
        );
        recv_nothing(&mut listener_near);
    }

    #[test]
    fn test_clear_filters_stops_delivery() {
        let f = Fixture::new();
        let (listener_client, mut listener_near) = f.connected_client();
        let (publisher, _publisher_near) = f.connected_client();

        dispatch(
            &f.hub,
            &listener_client,
            &Message::new(["NOTIFY", "ADD_FILTER", "2", "MISSION"]),
        );
        dispatch(
            &f.hub,
            &listener_client,
            &Message::new(["NOTIFY", "CLEAR_FILTERS"]),
        );
        dispatch(
            &f.hub,
            &publisher,
            &Message::new(["NOTIFY", "OUT", "MISSION START"]),
        );

        recv_nothing(&mut listener_near);
    }

    #[test]
    fn test_bad_filter_type_kicks() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(
            &f.hub,
            &client,
            &Message::new(["NOTIFY", "ADD_FILTER", "9", "MISSION"]),
        );

        let kick = recv(&mut near);
        assert_eq!(kick.components, vec!["COMM", "KICKING", "Illegal message"]);
    }

    #[test]
    fn test_unknown_namespace_kicks() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(&f.hub, &client, &Message::new(["FROB", "NICATE"]));

        let kick = recv(&mut near);
        assert_eq!(kick.components, vec!["COMM", "KICKING", "Illegal message"]);
    }

    #[test]
    fn test_log_message_accepted_silently() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(
            &f.hub,
            &client,
            &Message::new(["LOG", "imu", "3", "gyro saturated"]),
        );

        recv_nothing(&mut near);
        assert!(!client.is_closed());
    }

    #[test]
    fn test_log_bad_level_kicks() {
        let f = Fixture::new();
        let (client, mut near) = f.connected_client();

        dispatch(
            &f.hub,
            &client,
            &Message::new(["LOG", "imu", "high", "gyro saturated"]),
        );

        let kick = recv(&mut near);
        assert_eq!(kick.components, vec!["COMM", "KICKING", "Illegal message"]);
    }
}
