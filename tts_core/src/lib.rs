//! Shared building blocks for the speech streaming server and client:
//! the control/audio wire protocol, audio formats and encoding, the
//! synthesis engine seam, pending text accumulation and WAV capture.
pub mod audio;
pub mod engine;
#[cfg(feature = "piper")]
pub mod piper;
pub mod protocol;
pub mod text;
pub mod wav;

pub use audio::{AudioChunk, AudioError, AudioFormat, SampleFormat, StreamResampler};
pub use engine::{
    EmitFn, EngineError, PassThroughConverter, SpeechPipeline, StopSignal, SynthesisEngine,
    VoiceConverter,
};
pub use protocol::{AudioEvent, Command, ProtocolError, Reply};
pub use text::{FinalizedText, PendingTextBuffer};
pub use wav::CaptureBuffer;
