use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::relay::events::{ClientEvent, ServerEvent};
use crate::relay::ConnectParams;
use crate::state::AppState;

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Catches abrupt disconnects the peer never reports.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for one chat socket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink; serializes relay events into JSON text
///   frames and forwards transport control frames (ping/pong/close)
/// - Reader loop: parses inbound frames and dispatches them to the relay
///
/// The relay holds this connection's event sender for the lifetime of
/// the registration and uses it for all unicasts and broadcasts.
pub async fn run_connection(
    socket: WebSocket,
    state: AppState,
    sid: String,
    connect: ConnectParams,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<Message>();

    // Register before the reader loop starts so nothing this connection
    // sends can observe itself as unregistered.
    state.relay.handle_connect(&sid, connect, event_tx);

    tracing::info!(sid = %sid, "chat actor started");

    // Spawn writer task: forwards relay events and control frames to the sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, event_rx, ctrl_rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = ctrl_tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: process incoming WebSocket messages
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(ClientEvent::ChatMessage(inbound)) => {
                        state.relay.handle_chat_message(&sid, inbound);
                    }
                    Err(e) => {
                        // Malformed frames are dropped, never answered.
                        tracing::debug!(
                            sid = %sid,
                            error = %e,
                            "ignoring malformed chat frame"
                        );
                    }
                },
                Message::Binary(_) => {
                    tracing::debug!(sid = %sid, "ignoring unexpected binary frame");
                }
                Message::Pong(_) => {
                    // Pong received — notify the ping task
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = ctrl_tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(sid = %sid, reason = ?frame, "client initiated close");
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(sid = %sid, error = %e, "websocket receive error");
                break;
            }
            None => {
                // Stream ended — client disconnected
                tracing::info!(sid = %sid, "websocket stream ended");
                break;
            }
        }
    }

    // Cleanup: abort helper tasks, then evict from the registry.
    // Explicit close, timeout, and network failure all land here; the
    // relay treats a repeated disconnect as a no-op.
    writer_handle.abort();
    ping_handle.abort();
    state.relay.handle_disconnect(&sid);

    tracing::info!(sid = %sid, "chat actor stopped");
}

/// Writer task: owns the sink, drains relay events and control frames.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let msg = tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize outbound event");
                        continue;
                    }
                },
                None => break,
            },
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(msg) => msg,
                None => break,
            },
        };

        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
