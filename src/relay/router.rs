//! The connection registry and router.
//!
//! One `ChatRelay` instance exists per process. Every mutation happens
//! under a single lock so the connection table and the pastor routing
//! target can never disagree. Handlers never block beyond the lock:
//! deliveries are unbounded-channel sends into each connection's writer.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::events::{InboundMessage, OutboundMessage, PastorStatus, ServerEvent};
use super::EventSender;

/// Per-connection inbox channel for a visitor, derived from the
/// connection id so it can never collide with another live connection.
/// Reported to the pastor console in `user_connected` events; the pastor
/// side has no equivalent, it is addressed through the routing target.
pub fn visitor_room(sid: &str) -> String {
    format!("user_{sid}")
}

/// Connection role, fixed at connect time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Role {
    Pastor,
    #[default]
    Visitor,
}

impl Role {
    /// The literal `pastor` marks the administrator console; any other
    /// marker (or none) is a visitor.
    pub fn from_marker(marker: &str) -> Self {
        if marker == "pastor" {
            Role::Pastor
        } else {
            Role::Visitor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pastor => "pastor",
            Role::Visitor => "user",
        }
    }
}

/// Connect-time parameters. Metadata fields are visitor-supplied,
/// untrusted strings; missing values degrade to defaults rather than
/// failing the connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub role: Role,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// One registered connection.
struct Client {
    role: Role,
    name: String,
    email: String,
    phone: String,
    /// Registration order, used to pick the most recently connected
    /// pastor when the current one disconnects.
    seq: u64,
    tx: EventSender,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Client>,
    /// The current pastor routing target. `Some` iff at least one
    /// pastor connection is registered; always the most recent one.
    pastor_sid: Option<String>,
    next_seq: u64,
}

/// Connection registry and message router.
///
/// The transport layer drives it through exactly three entry points,
/// one per transport event: connect, disconnect, chat message.
#[derive(Default)]
pub struct ChatRelay {
    registry: Mutex<Registry>,
}

impl ChatRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a pastor connection is currently registered.
    pub fn pastor_online(&self) -> bool {
        self.lock().pastor_sid.is_some()
    }

    /// Register a fresh connection. The transport guarantees `sid` is
    /// not already registered.
    ///
    /// A pastor becomes the routing target and their status is
    /// broadcast to every registered connection. A visitor is told the
    /// current pastor status, and the pastor console (if any) is
    /// notified so it can list the visitor.
    pub fn handle_connect(&self, sid: &str, params: ConnectParams, tx: EventSender) {
        let mut reg = self.lock();
        reg.next_seq += 1;
        let seq = reg.next_seq;

        match params.role {
            Role::Pastor => {
                reg.clients.insert(
                    sid.to_string(),
                    Client {
                        role: Role::Pastor,
                        name: String::new(),
                        email: String::new(),
                        phone: String::new(),
                        seq,
                        tx,
                    },
                );
                reg.pastor_sid = Some(sid.to_string());
                broadcast(
                    &reg,
                    &ServerEvent::PastorStatus {
                        status: PastorStatus::Online,
                    },
                );
                tracing::info!(sid = %sid, "pastor connected");
            }
            Role::Visitor => {
                let name = params
                    .name
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| "Anonymous".to_string());
                let email = params.email.unwrap_or_default();
                let phone = params.phone.unwrap_or_default();
                let room = visitor_room(sid);
                let status = if reg.pastor_sid.is_some() {
                    PastorStatus::Online
                } else {
                    PastorStatus::Offline
                };

                reg.clients.insert(
                    sid.to_string(),
                    Client {
                        role: Role::Visitor,
                        name: name.clone(),
                        email: email.clone(),
                        phone: phone.clone(),
                        seq,
                        tx,
                    },
                );

                // Tell the new visitor whether anyone is there to answer.
                send_to(&reg, sid, &ServerEvent::PastorStatus { status });

                if reg.pastor_sid.is_some() {
                    send_to_pastor(
                        &reg,
                        &ServerEvent::UserConnected {
                            user_id: sid.to_string(),
                            name,
                            email,
                            phone,
                            room: room.clone(),
                            status: "connected".to_string(),
                        },
                    );
                }
                tracing::info!(sid = %sid, room = %room, "visitor connected");
            }
        }
    }

    /// Evict a connection. Idempotent: a disconnect for an already
    /// evicted id is a no-op.
    pub fn handle_disconnect(&self, sid: &str) {
        let mut reg = self.lock();
        let Some(client) = reg.clients.remove(sid) else {
            return;
        };

        match client.role {
            Role::Pastor => {
                if reg.pastor_sid.as_deref() == Some(sid) {
                    // The most recently connected surviving pastor takes
                    // over; offline is announced only when none remain.
                    let next = reg
                        .clients
                        .iter()
                        .filter(|(_, c)| c.role == Role::Pastor)
                        .max_by_key(|(_, c)| c.seq)
                        .map(|(id, _)| id.clone());
                    reg.pastor_sid = next;
                    if reg.pastor_sid.is_none() {
                        broadcast(
                            &reg,
                            &ServerEvent::PastorStatus {
                                status: PastorStatus::Offline,
                            },
                        );
                    }
                }
                tracing::info!(sid = %sid, "pastor disconnected");
            }
            Role::Visitor => {
                if reg.pastor_sid.is_some() {
                    send_to_pastor(
                        &reg,
                        &ServerEvent::UserDisconnected {
                            user_id: sid.to_string(),
                            name: client.name,
                            status: "disconnected".to_string(),
                        },
                    );
                }
                tracing::info!(sid = %sid, "visitor disconnected");
            }
        }
    }

    /// Route a chat message.
    ///
    /// Pastor messages must name a registered visitor and are unicast to
    /// that visitor's inbox, with an enriched copy echoed back to the
    /// pastor address. Visitor messages go to the pastor address and are
    /// echoed verbatim to the sender. Anything unroutable is dropped
    /// without feedback: a message can always race a disconnect.
    pub fn handle_chat_message(&self, sid: &str, inbound: InboundMessage) {
        let reg = self.lock();
        let Some(sender) = reg.clients.get(sid) else {
            tracing::debug!(sid = %sid, "message from unregistered connection dropped");
            return;
        };

        match sender.role {
            Role::Pastor => {
                let Some(target_id) = inbound.target_user_id.as_deref() else {
                    tracing::debug!(sid = %sid, "pastor message without target dropped");
                    return;
                };
                let Some(target) = reg
                    .clients
                    .get(target_id)
                    .filter(|c| c.role == Role::Visitor)
                else {
                    tracing::debug!(sid = %sid, target = %target_id, "pastor message to unknown visitor dropped");
                    return;
                };

                let message = OutboundMessage {
                    msg: inbound.msg,
                    timestamp: inbound.timestamp,
                    sender: "Pastor".to_string(),
                    user_type: Role::Pastor.as_str().to_string(),
                    ..Default::default()
                };
                let _ = target.tx.send(ServerEvent::ChatMessage(message.clone()));

                // Echoed copy carries the recipient so the console can
                // attribute it to the right conversation.
                let echo = OutboundMessage {
                    recipient: Some(target.name.clone()),
                    target_user_id: Some(target_id.to_string()),
                    ..message
                };
                send_to_pastor(&reg, &ServerEvent::ChatMessage(echo));
                tracing::debug!(sid = %sid, target = %target_id, "pastor message relayed");
            }
            Role::Visitor => {
                if reg.pastor_sid.is_none() {
                    tracing::debug!(sid = %sid, "visitor message dropped, no pastor online");
                    return;
                }

                let message = OutboundMessage {
                    msg: inbound.msg,
                    timestamp: inbound.timestamp,
                    sender: sender.name.clone(),
                    user_type: Role::Visitor.as_str().to_string(),
                    user_id: Some(sid.to_string()),
                    email: Some(sender.email.clone()),
                    phone: Some(sender.phone.clone()),
                    ..Default::default()
                };
                let event = ServerEvent::ChatMessage(message);
                send_to_pastor(&reg, &event);
                // Identical echo so the sender's UI renders its own
                // message without local-echo logic.
                let _ = sender.tx.send(event);
                tracing::debug!(sid = %sid, "visitor message relayed to pastor");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("registry lock poisoned")
    }
}

/// Deliver an event to every registered connection.
fn broadcast(reg: &Registry, event: &ServerEvent) {
    for client in reg.clients.values() {
        let _ = client.tx.send(event.clone());
    }
}

/// Deliver an event to one connection's inbox, if still registered.
fn send_to(reg: &Registry, sid: &str, event: &ServerEvent) {
    if let Some(client) = reg.clients.get(sid) {
        let _ = client.tx.send(event.clone());
    }
}

/// Deliver an event to the pastor address (the current routing target).
fn send_to_pastor(reg: &Registry, event: &ServerEvent) {
    let Some(sid) = reg.pastor_sid.as_deref() else {
        return;
    };
    send_to(reg, sid, event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};

    fn connect_visitor(
        relay: &ChatRelay,
        sid: &str,
        name: Option<&str>,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        relay.handle_connect(
            sid,
            ConnectParams {
                role: Role::Visitor,
                name: name.map(str::to_string),
                email: email.map(str::to_string),
                phone: phone.map(str::to_string),
            },
            tx,
        );
        rx
    }

    fn connect_pastor(relay: &ChatRelay, sid: &str) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        relay.handle_connect(
            sid,
            ConnectParams {
                role: Role::Pastor,
                ..Default::default()
            },
            tx,
        );
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return events,
            }
        }
    }

    fn chat(msg: &str, timestamp: &str, target: Option<&str>) -> InboundMessage {
        InboundMessage {
            msg: msg.to_string(),
            timestamp: timestamp.to_string(),
            target_user_id: target.map(str::to_string),
        }
    }

    fn online() -> ServerEvent {
        ServerEvent::PastorStatus {
            status: PastorStatus::Online,
        }
    }

    fn offline() -> ServerEvent {
        ServerEvent::PastorStatus {
            status: PastorStatus::Offline,
        }
    }

    #[test]
    fn visitor_is_told_current_pastor_status_on_connect() {
        let relay = ChatRelay::new();

        let mut v1 = connect_visitor(&relay, "v1", Some("Kim"), None, None);
        assert_eq!(drain(&mut v1), vec![offline()]);

        let _p = connect_pastor(&relay, "p1");
        assert_eq!(drain(&mut v1), vec![online()]);

        let mut v2 = connect_visitor(&relay, "v2", None, None, None);
        assert_eq!(drain(&mut v2), vec![online()]);
    }

    #[test]
    fn pastor_connect_broadcasts_to_every_registered_connection() {
        let relay = ChatRelay::new();
        let mut v1 = connect_visitor(&relay, "v1", None, None, None);
        drain(&mut v1);

        let mut p1 = connect_pastor(&relay, "p1");

        assert_eq!(drain(&mut v1), vec![online()]);
        // The broadcast includes the pastor connection itself.
        assert_eq!(drain(&mut p1), vec![online()]);
        assert!(relay.pastor_online());
    }

    #[test]
    fn pastor_is_notified_of_visitors_connecting_after_him() {
        let relay = ChatRelay::new();
        let mut p1 = connect_pastor(&relay, "p1");
        drain(&mut p1);

        let mut v1 = connect_visitor(&relay, "v1", Some("Kim"), Some("k@x.com"), Some("010"));
        assert_eq!(drain(&mut v1), vec![online()]);
        assert_eq!(
            drain(&mut p1),
            vec![ServerEvent::UserConnected {
                user_id: "v1".to_string(),
                name: "Kim".to_string(),
                email: "k@x.com".to_string(),
                phone: "010".to_string(),
                room: "user_v1".to_string(),
                status: "connected".to_string(),
            }]
        );
    }

    #[test]
    fn no_retroactive_user_connected_for_existing_visitors() {
        let relay = ChatRelay::new();
        let mut v1 = connect_visitor(&relay, "v1", Some("Kim"), None, None);
        drain(&mut v1);

        let mut p1 = connect_pastor(&relay, "p1");

        // The pastor only gets the status broadcast, no visitor list
        // entries for visitors that connected before him.
        assert_eq!(drain(&mut p1), vec![online()]);
    }

    #[test]
    fn visitor_message_is_delivered_once_and_echoed_once() {
        let relay = ChatRelay::new();
        let mut p1 = connect_pastor(&relay, "p1");
        let mut v1 = connect_visitor(&relay, "v1", Some("Kim"), Some("k@x.com"), None);
        drain(&mut p1);
        drain(&mut v1);

        relay.handle_chat_message("v1", chat("Hello", "t1", None));

        let expected = ServerEvent::ChatMessage(OutboundMessage {
            msg: "Hello".to_string(),
            timestamp: "t1".to_string(),
            sender: "Kim".to_string(),
            user_type: "user".to_string(),
            user_id: Some("v1".to_string()),
            email: Some("k@x.com".to_string()),
            phone: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(drain(&mut p1), vec![expected.clone()]);
        // The sender's echo is byte-identical to the pastor's copy.
        assert_eq!(drain(&mut v1), vec![expected]);
    }

    #[test]
    fn visitor_message_without_pastor_produces_no_events() {
        let relay = ChatRelay::new();
        let mut v1 = connect_visitor(&relay, "v1", None, None, None);
        drain(&mut v1);

        relay.handle_chat_message("v1", chat("anyone there?", "t1", None));
        assert_eq!(drain(&mut v1), vec![]);

        // Nothing was queued: a pastor connecting later sees only the
        // connect-time notifications.
        let mut p1 = connect_pastor(&relay, "p1");
        assert_eq!(drain(&mut p1), vec![online()]);
    }

    #[test]
    fn pastor_message_reaches_target_and_echoes_with_recipient() {
        let relay = ChatRelay::new();
        let mut p1 = connect_pastor(&relay, "p1");
        let mut v1 = connect_visitor(&relay, "v1", Some("Kim"), None, None);
        drain(&mut p1);
        drain(&mut v1);

        relay.handle_chat_message("p1", chat("Welcome", "t2", Some("v1")));

        assert_eq!(
            drain(&mut v1),
            vec![ServerEvent::ChatMessage(OutboundMessage {
                msg: "Welcome".to_string(),
                timestamp: "t2".to_string(),
                sender: "Pastor".to_string(),
                user_type: "pastor".to_string(),
                ..Default::default()
            })]
        );
        assert_eq!(
            drain(&mut p1),
            vec![ServerEvent::ChatMessage(OutboundMessage {
                msg: "Welcome".to_string(),
                timestamp: "t2".to_string(),
                sender: "Pastor".to_string(),
                user_type: "pastor".to_string(),
                recipient: Some("Kim".to_string()),
                target_user_id: Some("v1".to_string()),
                ..Default::default()
            })]
        );
    }

    #[test]
    fn pastor_message_to_unknown_or_non_visitor_target_is_dropped() {
        let relay = ChatRelay::new();
        let mut p1 = connect_pastor(&relay, "p1");
        let mut v1 = connect_visitor(&relay, "v1", None, None, None);
        drain(&mut p1);
        drain(&mut v1);

        relay.handle_chat_message("p1", chat("hello?", "t1", Some("nope")));
        relay.handle_chat_message("p1", chat("hello?", "t1", Some("p1")));
        relay.handle_chat_message("p1", chat("hello?", "t1", None));

        assert_eq!(drain(&mut p1), vec![]);
        assert_eq!(drain(&mut v1), vec![]);
    }

    #[test]
    fn message_from_unregistered_connection_is_dropped() {
        let relay = ChatRelay::new();
        let mut p1 = connect_pastor(&relay, "p1");
        drain(&mut p1);

        relay.handle_chat_message("ghost", chat("boo", "t1", None));
        assert_eq!(drain(&mut p1), vec![]);
    }

    #[test]
    fn visitor_disconnect_notifies_pastor_and_cleans_up() {
        let relay = ChatRelay::new();
        let mut p1 = connect_pastor(&relay, "p1");
        let mut v1 = connect_visitor(&relay, "v1", Some("Kim"), None, None);
        drain(&mut p1);
        drain(&mut v1);

        relay.handle_disconnect("v1");
        assert_eq!(
            drain(&mut p1),
            vec![ServerEvent::UserDisconnected {
                user_id: "v1".to_string(),
                name: "Kim".to_string(),
                status: "disconnected".to_string(),
            }]
        );

        // Neither sending as the evicted id nor targeting it delivers.
        relay.handle_chat_message("v1", chat("late", "t9", None));
        relay.handle_chat_message("p1", chat("late", "t9", Some("v1")));
        assert_eq!(drain(&mut p1), vec![]);
        assert_eq!(drain(&mut v1), vec![]);
    }

    #[test]
    fn pastor_disconnect_broadcasts_offline_once_and_is_idempotent() {
        let relay = ChatRelay::new();
        let mut p1 = connect_pastor(&relay, "p1");
        let mut v1 = connect_visitor(&relay, "v1", None, None, None);
        drain(&mut p1);
        drain(&mut v1);

        relay.handle_disconnect("p1");
        relay.handle_disconnect("p1");

        assert_eq!(drain(&mut v1), vec![offline()]);
        assert!(!relay.pastor_online());
    }

    #[test]
    fn most_recent_pastor_wins_routing_and_survivors_take_over() {
        let relay = ChatRelay::new();
        let mut p1 = connect_pastor(&relay, "p1");
        let mut p2 = connect_pastor(&relay, "p2");
        let mut v1 = connect_visitor(&relay, "v1", Some("Kim"), None, None);
        drain(&mut p1);
        drain(&mut p2);
        drain(&mut v1);

        // Last-connect-wins: p2 is the routing target.
        relay.handle_chat_message("v1", chat("hi", "t1", None));
        assert_eq!(drain(&mut p2).len(), 1);
        assert_eq!(drain(&mut p1), vec![]);
        drain(&mut v1);

        // Target disconnects; the surviving pastor takes over and the
        // status stays online (no broadcast at all).
        relay.handle_disconnect("p2");
        assert!(relay.pastor_online());
        assert_eq!(drain(&mut v1), vec![]);

        relay.handle_chat_message("v1", chat("still there?", "t2", None));
        assert_eq!(drain(&mut p1).len(), 1);
        drain(&mut v1);

        // A non-target pastor disconnecting is observably silent.
        let mut p3 = connect_pastor(&relay, "p3");
        drain(&mut p1);
        drain(&mut p3);
        drain(&mut v1);
        relay.handle_disconnect("p1");
        assert_eq!(drain(&mut v1), vec![]);
        assert!(relay.pastor_online());

        // Last one out turns the light off.
        relay.handle_disconnect("p3");
        assert_eq!(drain(&mut v1), vec![offline()]);
        assert!(!relay.pastor_online());
    }

    #[test]
    fn missing_visitor_metadata_degrades_to_defaults() {
        let relay = ChatRelay::new();
        let mut p1 = connect_pastor(&relay, "p1");
        drain(&mut p1);

        let mut v1 = connect_visitor(&relay, "v1", None, None, None);
        drain(&mut v1);
        let mut v2 = connect_visitor(&relay, "v2", Some(""), None, None);
        drain(&mut v2);

        let events = drain(&mut p1);
        match &events[..] {
            [ServerEvent::UserConnected { name: n1, email, phone, .. }, ServerEvent::UserConnected { name: n2, .. }] => {
                assert_eq!(n1, "Anonymous");
                assert_eq!(n2, "Anonymous");
                assert_eq!(email, "");
                assert_eq!(phone, "");
            }
            other => panic!("expected two user_connected events, got {other:?}"),
        }
    }

    #[test]
    fn role_marker_is_exact() {
        assert_eq!(Role::from_marker("pastor"), Role::Pastor);
        assert_eq!(Role::from_marker("Pastor"), Role::Visitor);
        assert_eq!(Role::from_marker("admin"), Role::Visitor);
        assert_eq!(Role::from_marker(""), Role::Visitor);
    }
}
