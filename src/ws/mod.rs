//! WebSocket transport for the live chat.
//!
//! `handler` upgrades HTTP requests and assigns connection identity;
//! `actor` runs one task pair per connection and bridges the socket to
//! the relay. The relay itself never touches socket types: it only sees
//! connect/disconnect/message events and per-connection event senders.

pub mod actor;
pub mod handler;
