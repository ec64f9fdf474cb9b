use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::relay::{ConnectParams, Role};
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters supplied when a chat client opens its socket.
/// All values are untrusted, attacker-controllable strings.
#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    /// The literal `pastor` marks the administrator console. The
    /// surrounding site's session system is trusted to only hand that
    /// marker to an authenticated console; no credential check happens
    /// here.
    pub user_type: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// GET /ws?user_type=&name=&email=&phone=
/// WebSocket upgrade endpoint. Each upgrade gets a fresh connection id
/// that lives exactly as long as the transport session; a client that
/// reconnects arrives as a brand-new identity.
pub async fn chat_upgrade(
    State(state): State<AppState>,
    Query(params): Query<ChatQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let sid = Uuid::new_v4().to_string();
    let connect = ConnectParams {
        role: Role::from_marker(params.user_type.as_deref().unwrap_or_default()),
        name: params.name,
        email: params.email,
        phone: params.phone,
    };

    tracing::info!(sid = %sid, role = connect.role.as_str(), "chat upgrade accepted");

    ws.on_upgrade(move |socket| handle_connected(socket, state, sid, connect))
}

/// Handle an upgraded socket by running the connection actor.
async fn handle_connected(socket: WebSocket, state: AppState, sid: String, connect: ConnectParams) {
    actor::run_connection(socket, state, sid, connect).await;
}
