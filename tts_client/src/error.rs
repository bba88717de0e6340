use thiserror::Error;
use tokio_tungstenite::tungstenite;

use tts_core::ProtocolError;

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("control channel closed")]
    ControlClosed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("server rejected command: {0}")]
    Rejected(String),

    #[error("no acknowledgement for `{0}`")]
    AckTimeout(&'static str),

    #[error("expected `{expected}_received`, got `{got}_received`")]
    UnexpectedAck {
        expected: &'static str,
        got: &'static str,
    },

    #[error("audio output error: {0}")]
    Sink(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("playback thread failed: {0}")]
    Playback(String),

    /// Playback stopped on an output error. Carries whatever was captured.
    #[error("playback failed: {source}")]
    PlaybackFailed {
        #[source]
        source: Box<ClientError>,
        capture: Option<Vec<u8>>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
