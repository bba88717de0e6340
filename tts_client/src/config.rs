use std::time::Duration;

use crate::error::ClientError;

pub const DEFAULT_CONTROL_URL: &str = "ws://localhost:8000";
pub const DEFAULT_AUDIO_URL: &str = "ws://localhost:8001";

/// How long the receive loop waits before treating silence as the end of
/// the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionTimeouts {
    first_chunk: Duration,
    inter_chunk: Duration,
}

impl CompletionTimeouts {
    /// The first-chunk window covers synthesis startup and must be longer
    /// than the gap allowed between chunks.
    pub fn new(first_chunk: Duration, inter_chunk: Duration) -> Result<Self, ClientError> {
        if inter_chunk.is_zero() {
            return Err(ClientError::Config("chunk timeout must be positive".into()));
        }
        if first_chunk <= inter_chunk {
            return Err(ClientError::Config(format!(
                "first-chunk timeout ({:?}) must exceed the chunk timeout ({:?})",
                first_chunk, inter_chunk
            )));
        }
        Ok(Self {
            first_chunk,
            inter_chunk,
        })
    }

    pub fn first_chunk(&self) -> Duration {
        self.first_chunk
    }

    pub fn inter_chunk(&self) -> Duration {
        self.inter_chunk
    }

    /// The window that applies given whether any chunk has arrived yet.
    pub fn window(&self, received_any: bool) -> Duration {
        if received_any {
            self.inter_chunk
        } else {
            self.first_chunk
        }
    }
}

impl Default for CompletionTimeouts {
    fn default() -> Self {
        Self {
            first_chunk: Duration::from_secs(6),
            inter_chunk: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub control_url: String,
    pub audio_url: String,
    pub voice_conversion: bool,
    pub timeouts: CompletionTimeouts,
    /// How long to wait for each `*_received` acknowledgement.
    pub ack_timeout: Duration,
    /// Capacity of the queue between the receive and drain loops.
    pub queue_capacity: usize,
    /// Keep a WAV copy of everything played.
    pub capture: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            control_url: DEFAULT_CONTROL_URL.to_string(),
            audio_url: DEFAULT_AUDIO_URL.to_string(),
            voice_conversion: false,
            timeouts: CompletionTimeouts::default(),
            ack_timeout: Duration::from_secs(5),
            queue_capacity: 64,
            capture: false,
        }
    }
}
