//! Wire-level chat events.
//!
//! Frames are JSON text, enveloped as `{"event": <name>, "data": <payload>}`.
//! Inbound and outbound sides are separate enums so each direction only
//! parses what it can actually receive.

use serde::{Deserialize, Serialize};

/// Pastor availability as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PastorStatus {
    Online,
    Offline,
}

/// Events pushed from the server to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Pastor went online/offline, or the current status on connect.
    PastorStatus { status: PastorStatus },
    /// A visitor joined while the pastor console is open (pastor only).
    UserConnected {
        user_id: String,
        name: String,
        email: String,
        phone: String,
        room: String,
        status: String,
    },
    /// A visitor left while the pastor console is open (pastor only).
    UserDisconnected {
        user_id: String,
        name: String,
        status: String,
    },
    /// A relayed or echoed chat message.
    ChatMessage(OutboundMessage),
}

/// Events clients send to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    ChatMessage(InboundMessage),
}

/// A chat message as submitted by a client. The timestamp is
/// client-supplied and passed through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub timestamp: String,
    /// Required from the pastor, ignored from visitors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
}

/// A chat message as delivered to a recipient, enriched with sender
/// identity. Pastor-bound copies of pastor messages additionally carry
/// the recipient fields so the console can attribute its own echo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub msg: String,
    pub timestamp: String,
    pub sender: String,
    pub user_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
}
