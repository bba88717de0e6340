//! Synthesis engine and voice conversion abstractions.
//!
//! The server owns exactly one [`SpeechPipeline`]: an engine that turns text
//! into audio, plus an optional voice conversion stage applied to each
//! chunk. Engines are blocking; cancellation is cooperative through a
//! [`StopSignal`] that the engine checks between chunks.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::audio::AudioError;
use crate::text::FinalizedText;

/// Callback receiving each chunk of `f32` samples produced by an engine.
///
/// Returning an error aborts the run.
pub type EmitFn<'a> = dyn FnMut(Vec<f32>) -> Result<(), EngineError> + 'a;

/// Non-blocking stop request shared between the worker and a running engine.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the engine to stop at its next chunk boundary. Never blocks.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Converts accumulated text into a sequence of audio chunks.
///
/// Implementations must check `stop` between chunks and return promptly
/// once it is set. Callers never assume that they do.
pub trait SynthesisEngine: Send {
    /// Native output rate of the produced samples.
    fn sample_rate(&self) -> u32;

    /// Synthesize `text`, handing every chunk to `emit`. Blocks until the
    /// text is exhausted, `stop` is observed, or an error occurs.
    fn synthesize(
        &mut self,
        text: &FinalizedText,
        stop: &StopSignal,
        emit: &mut EmitFn<'_>,
    ) -> Result<(), EngineError>;
}

/// Optional per-chunk transform (e.g. timbre conversion).
pub trait VoiceConverter: Send {
    /// Transform one chunk, returning the new samples and their rate.
    fn convert(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<(Vec<f32>, u32), EngineError>;

    /// Drop any internal state carried between chunks.
    fn reset(&mut self) {}
}

/// Identity conversion. The wire profile still switches to float32 at the
/// converted rate, so enabling it exercises the full conversion path.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughConverter;

impl VoiceConverter for PassThroughConverter {
    fn convert(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<(Vec<f32>, u32), EngineError> {
        Ok((samples, sample_rate))
    }
}

/// The engine adapter plus its conversion stage.
pub struct SpeechPipeline {
    pub engine: Box<dyn SynthesisEngine>,
    pub converter: Box<dyn VoiceConverter>,
}

impl SpeechPipeline {
    pub fn new(engine: impl SynthesisEngine + 'static) -> Self {
        Self {
            engine: Box::new(engine),
            converter: Box::new(PassThroughConverter),
        }
    }
}

impl std::fmt::Debug for SpeechPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechPipeline")
            .field("engine", &"<SynthesisEngine>")
            .field("sample_rate", &self.engine.sample_rate())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("voice conversion failed: {0}")]
    Conversion(String),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("synthesis task panicked: {0}")]
    Panicked(String),
}
