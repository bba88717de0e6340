//! Audio channel: forwards broadcast frames to one listener.
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tracing::{debug, info, warn};

use tts_core::AudioEvent;

use crate::broadcast::AudioFrame;
use crate::AppState;

pub async fn audio_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_audio(socket, state))
}

pub async fn handle_audio(mut socket: WebSocket, state: AppState) {
    let mut subscription = state.broadcaster.subscribe();
    let id = subscription.id();
    info!(subscriber = %id, "Audio connection opened");

    loop {
        tokio::select! {
            delivery = subscription.recv() => {
                let Some(delivery) = delivery else {
                    warn!(subscriber = %id, "Audio connection fell behind, closing it");
                    break;
                };
                // A cancel may have landed after the frame was queued.
                if !state.broadcaster.is_current(delivery.generation) {
                    debug!(subscriber = %id, generation = delivery.generation, "Skipping stale frame");
                    continue;
                }
                let message = match delivery.frame {
                    AudioFrame::Chunk(chunk) => Message::Binary(chunk.data),
                    AudioFrame::Complete => {
                        Message::Text(AudioEvent::SynthesisComplete.to_json().into())
                    }
                };
                if let Err(e) = socket.send(message).await {
                    info!(subscriber = %id, error = %e, "Audio connection dropped");
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    info!(subscriber = %id, error = %e, "Audio connection dropped");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    drop(subscription);
    let _ = socket.send(Message::Close(None)).await;
    info!(subscriber = %id, "Audio connection closed");
}
