//! Client for the dual-channel speech streaming server.
//!
//! [`TtsClient`] sends text over the control channel and plays what comes
//! back on the audio channel through the [`pipeline`], optionally keeping
//! a WAV capture of everything played.
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod sink;

pub use client::TtsClient;
pub use config::{ClientConfig, CompletionTimeouts};
pub use error::ClientError;
pub use pipeline::{PlaybackReport, Shutdown, StreamEnd};
pub use sink::{AudioSink, NullSink, SinkFactory};
