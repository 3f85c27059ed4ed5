//! WebSocket handler — chat frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID, sends `session:connected`, then the
//! chat history, and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch to the `ChatSession`
//! - Hub broadcasts (presence snapshots, new messages) → forward to client
//! - Heartbeat tick → ping the client
//!
//! The session owns chat semantics and hub broadcasts. This layer only
//! translates frames: the sender gets a `done` or `error` reply for every
//! request it makes.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → `session:connected` → `chat:history`
//! 2. Client frames → session → reply to sender
//! 3. Hub closes the queue (eviction) or socket closes → `on_disconnect`

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, Frame, Status};
use crate::services::hub::{
    SYSCALL_CONNECTED, SYSCALL_GATEWAY_ERROR, SYSCALL_HISTORY, SYSCALL_IDENTIFY, SYSCALL_SEND, message_data,
};
use crate::services::session::{ChatError, ChatSession, SendMessage};
use crate::state::{AppState, ChatMessage};

#[derive(Debug, thiserror::Error)]
enum GatewayError {
    #[error("unknown syscall: {0}")]
    UnknownSyscall(String),
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl ErrorCode for GatewayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownSyscall(_) => "E_UNKNOWN_SYSCALL",
            Self::Chat(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::UnknownSyscall(_) => false,
            Self::Chat(e) => e.retryable(),
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    let mut session = ChatSession::new(&state, client_id);

    // Per-connection queue for hub broadcasts. The hub holds the only sender.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.chat.client_queue_capacity);

    let welcome = Frame::request(SYSCALL_CONNECTED, Data::new()).with_data("client_id", client_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }
    info!(%client_id, "ws: client connected");

    let history = history_frame(session.on_connect(client_tx).await);
    if send_frame(&mut socket, &history).await.is_ok() {
        relay(&mut socket, &state, &mut session, &mut client_rx).await;
    }

    let state_at_close = session.state().clone();
    let presence_changed = session.on_disconnect().await;
    info!(%client_id, state = ?state_at_close, presence_changed, "ws: client disconnected");
}

async fn relay(
    socket: &mut WebSocket,
    state: &AppState,
    session: &mut ChatSession,
    client_rx: &mut mpsc::Receiver<Frame>,
) {
    let client_id = session.client_id();
    let mut heartbeat = tokio::time::interval(state.chat.heartbeat_interval);
    // The first tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                state.hub.touch(client_id).await;
                match msg {
                    Message::Text(text) => {
                        for frame in process_inbound_text(session, &text).await {
                            if send_frame(socket, &frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            frame = client_rx.recv() => {
                let Some(frame) = frame else {
                    warn!(%client_id, "ws: dropped by hub (stale)");
                    break;
                };
                if send_frame(socket, &frame).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive dispatch directly.
async fn process_inbound_text(session: &mut ChatSession, text: &str) -> Vec<Frame> {
    let client_id = session.client_id();
    let req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request(SYSCALL_GATEWAY_ERROR, Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };
    info!(%client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    match dispatch(session, &req).await {
        Ok(data) => vec![req.done_with(data)],
        Err(e) => vec![req.error_from(&e)],
    }
}

async fn dispatch(session: &mut ChatSession, req: &Frame) -> Result<Data, GatewayError> {
    match req.syscall.as_str() {
        SYSCALL_IDENTIFY => {
            let user_id = session.on_identify(req.data_str("user_id")).await?;
            let mut data = Data::new();
            data.insert("user_id".into(), serde_json::json!(user_id));
            Ok(data)
        }
        SYSCALL_SEND => {
            let payload = SendMessage {
                sender_id: req.data_str("sender_id").map(str::to_string),
                sender_name: req.data_str("sender_name").map(str::to_string),
                message: req.data_str("message").map(str::to_string),
            };
            let persisted = session.on_send_message(payload).await?;
            Ok(message_data(&persisted))
        }
        other => Err(GatewayError::UnknownSyscall(other.to_string())),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn history_frame(result: Result<Vec<ChatMessage>, ChatError>) -> Frame {
    let frame = Frame::request(SYSCALL_HISTORY, Data::new());
    match result {
        Ok(messages) => frame.with_data("messages", serde_json::to_value(&messages).unwrap_or_default()),
        Err(e) => {
            // Unsolicited: there is no request to correlate with.
            let mut err = frame.error_from(&e);
            err.parent_id = None;
            err
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data_str("code").unwrap_or("-");
        let message = frame.data_str("message").unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
