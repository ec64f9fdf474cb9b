//! Connection registry and message router for the live chat.
//!
//! The relay sits below the WebSocket transport: it tracks every live
//! connection's role and metadata, maintains the pastor's online status,
//! and fans chat events between the pastor console and individual
//! visitors. It holds no history; state lives exactly as long as the
//! connections do.

pub mod events;
pub mod router;

use tokio::sync::mpsc;

use events::ServerEvent;

/// Sender half of one connection's outbound event queue.
/// The transport layer owns the receiving half and serializes events
/// onto the wire; sends are fire-and-forget.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

pub use router::{visitor_room, ChatRelay, ConnectParams, Role};
