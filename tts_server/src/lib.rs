//! Dual-channel speech streaming server.
//!
//! The control port accepts text and commands over WebSocket and serves
//! `/health` and `/metrics`; the audio port streams the synthesized PCM to
//! every connected listener.
pub mod audio;
pub mod broadcast;
pub mod config;
pub mod control;
pub mod error;
pub mod metrics;
pub mod session;
pub mod validation;
pub mod worker;

use std::future::IntoFuture;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use tts_core::SpeechPipeline;

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::metrics::{system_metrics, MetricsResponse, ServerMetrics};
use crate::session::SessionCoordinator;
use crate::worker::{WorkerConfig, WorkerHandle};

/// Everything the handlers share. One per running server.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub broadcaster: Broadcaster,
    pub sessions: Arc<SessionCoordinator>,
    pub worker: WorkerHandle,
    pub metrics: ServerMetrics,
}

impl AppState {
    /// Build the shared state and start the synthesis worker. Must be
    /// called from within a tokio runtime.
    pub fn new(config: ServerConfig, pipeline: SpeechPipeline) -> Self {
        let metrics = ServerMetrics::new();
        let broadcaster = Broadcaster::new(config.subscriber_buffer);
        let worker = worker::spawn(
            pipeline,
            broadcaster.clone(),
            metrics.clone(),
            WorkerConfig {
                cancel_grace: config.cancel_grace(),
                voice_conversion: config.voice_conversion,
            },
        );
        let sessions = Arc::new(SessionCoordinator::new(worker.clone(), metrics.clone()));

        Self {
            config,
            broadcaster,
            sessions,
            worker,
            metrics,
        }
    }
}

pub fn control_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(control::control_ws))
        .route("/ws", get(control::control_ws))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn audio_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(audio::audio_ws))
        .route("/ws", get(audio::audio_ws))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        timestamp: chrono::Utc::now(),
        system: system_metrics(state.metrics.uptime_seconds()),
        streaming: state.metrics.counters(),
        first_chunk_latency: state.metrics.first_chunk_latency.stats(),
        audio_subscribers: state.broadcaster.subscriber_count(),
        subscribers_lagged: state.broadcaster.lagged_count(),
        worker_state: state.worker.state().as_str().to_string(),
    })
}

/// Bind both ports from the configuration.
pub async fn bind(config: &ServerConfig) -> Result<(TcpListener, TcpListener), ServerError> {
    let control_addr = config.control_addr();
    let control = TcpListener::bind(&control_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: control_addr,
            source,
        })?;

    let audio_addr = config.audio_addr();
    let audio = TcpListener::bind(&audio_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: audio_addr,
            source,
        })?;

    Ok((control, audio))
}

/// Serve both channels until either listener fails.
pub async fn serve(control: TcpListener, audio: TcpListener, state: AppState) -> std::io::Result<()> {
    if let (Ok(control_addr), Ok(audio_addr)) = (control.local_addr(), audio.local_addr()) {
        info!("Control channel listening on ws://{control_addr}");
        info!("Audio channel listening on ws://{audio_addr}");
    }

    let control_app = control_router(state.clone());
    let audio_app = audio_router(state);

    tokio::try_join!(
        axum::serve(control, control_app).into_future(),
        axum::serve(audio, audio_app).into_future(),
    )?;
    Ok(())
}
