//! Control channel: text and commands in, acknowledgements out.
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tts_core::{Command, ProtocolError, Reply};

use crate::metrics::ServerMetrics;
use crate::session::SessionId;
use crate::validation::validate_command;
use crate::AppState;

pub async fn control_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control(socket, state))
}

/// Drive one control connection until it closes.
pub async fn handle_control(mut socket: WebSocket, state: AppState) {
    let session = Uuid::new_v4();
    ServerMetrics::incr(&state.metrics.sessions_opened);

    if let Err(e) = state.sessions.activate(session) {
        error!(session = %session, error = %e, "Could not activate session");
        let _ = socket
            .send(Message::Text(Reply::Error(e.client_message()).to_json().into()))
            .await;
        return;
    }
    info!(session = %session, "Control connection opened");

    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                info!(session = %session, error = %e, "Control connection dropped");
                break;
            }
        };

        let reply = match message {
            Message::Text(frame) => process_frame(&state, session, frame.as_str()),
            Message::Binary(_) => protocol_error(&state, session, ProtocolError::UnexpectedBinary),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Err(e) = socket.send(Message::Text(reply.to_json().into())).await {
            info!(session = %session, error = %e, "Control connection dropped");
            break;
        }
    }

    if let Err(e) = state.sessions.deactivate(session) {
        warn!(session = %session, error = %e, "Could not release session");
    }
    info!(session = %session, "Control connection closed");
}

/// Parse, validate and forward one frame, producing the reply to send.
pub fn process_frame(state: &AppState, session: SessionId, frame: &str) -> Reply {
    let command = match Command::parse(frame).and_then(|command| {
        validate_command(&command)?;
        Ok(command)
    }) {
        Ok(command) => command,
        Err(e) => return protocol_error(state, session, e),
    };

    ServerMetrics::incr(&state.metrics.commands);
    let reply = Reply::ack(&command);
    debug!(session = %session, command = command.kind(), "Command received");

    match state.sessions.submit(session, command) {
        Ok(_) => reply,
        Err(e) => Reply::Error(e.client_message()),
    }
}

fn protocol_error(state: &AppState, session: SessionId, e: ProtocolError) -> Reply {
    ServerMetrics::incr(&state.metrics.protocol_errors);
    warn!(session = %session, error = %e, "Rejected control frame");
    Reply::Error(e.to_string())
}
