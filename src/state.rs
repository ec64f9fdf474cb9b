use std::sync::Arc;

use crate::relay::ChatRelay;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone, Default)]
pub struct AppState {
    /// Connection registry and message router for the live chat
    pub relay: Arc<ChatRelay>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            relay: Arc::new(ChatRelay::new()),
        }
    }
}
