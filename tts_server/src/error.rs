use thiserror::Error;

use tts_core::ProtocolError;

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Synthesis worker has shut down")]
    WorkerGone,
}

impl ServerError {
    /// Message sent back to a client in an `error` reply.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::Protocol(e) => e.to_string(),
            ServerError::WorkerGone => "synthesis is unavailable".to_string(),
            other @ ServerError::Bind { .. } => {
                tracing::error!("Internal error: {}", other);
                "internal error".to_string()
            }
        }
    }
}
