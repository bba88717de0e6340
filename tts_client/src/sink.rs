//! Audio output.
//!
//! Sinks live on the drain thread for their whole life. Platform output
//! handles are often not `Send`, so the pipeline takes a [`SinkFactory`]
//! and builds the sink on that thread.
use tts_core::AudioFormat;

use crate::error::ClientError;

pub trait AudioSink {
    /// Prepare to play audio in `format`.
    fn open(&mut self, format: AudioFormat) -> Result<(), ClientError>;

    /// Queue one chunk of raw PCM. Must not block for the duration of the
    /// audio; report the backlog through [`queued`](Self::queued) instead.
    fn write(&mut self, chunk: &[u8]) -> Result<(), ClientError>;

    /// Whether queued audio is still being played.
    fn is_playing(&self) -> bool;

    /// Chunks written but not yet played out. The drain loop holds back
    /// further writes while this is at [`SINK_QUEUE_LIMIT`].
    fn queued(&self) -> usize {
        0
    }

    /// Stop immediately, discarding queued audio.
    fn abort(&mut self);

    /// Release the device after playback has finished.
    fn close(&mut self);
}

/// Chunks a sink may have buffered before the drain loop stops pulling
/// from the playback queue.
pub const SINK_QUEUE_LIMIT: usize = 4;

pub type SinkFactory = Box<dyn FnOnce() -> Result<Box<dyn AudioSink>, ClientError> + Send>;

/// Discards audio. Used with `--no-playback` and when capturing only.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn open(&mut self, _format: AudioFormat) -> Result<(), ClientError> {
        Ok(())
    }

    fn write(&mut self, _chunk: &[u8]) -> Result<(), ClientError> {
        Ok(())
    }

    fn is_playing(&self) -> bool {
        false
    }

    fn abort(&mut self) {}

    fn close(&mut self) {}
}

pub fn null_sink() -> SinkFactory {
    Box::new(|| Ok(Box::new(NullSink) as Box<dyn AudioSink>))
}

#[cfg(feature = "playback")]
pub use rodio_sink::{default_output, RodioSink};

#[cfg(feature = "playback")]
mod rodio_sink {
    use rodio::{OutputStream, OutputStreamHandle, Sink};

    use tts_core::audio::decode;
    use tts_core::AudioFormat;

    use super::{AudioSink, SinkFactory};
    use crate::error::ClientError;

    /// Plays through the default output device.
    pub struct RodioSink {
        /// rodio output stream (must be kept alive).
        _stream: OutputStream,
        stream_handle: OutputStreamHandle,
        sink: Option<Sink>,
        format: AudioFormat,
    }

    impl RodioSink {
        pub fn new() -> Result<Self, ClientError> {
            let (stream, stream_handle) =
                OutputStream::try_default().map_err(|e| ClientError::Sink(e.to_string()))?;
            tracing::debug!("Audio output initialized on default device");
            Ok(Self {
                _stream: stream,
                stream_handle,
                sink: None,
                format: AudioFormat::standard(),
            })
        }
    }

    impl AudioSink for RodioSink {
        fn open(&mut self, format: AudioFormat) -> Result<(), ClientError> {
            let sink =
                Sink::try_new(&self.stream_handle).map_err(|e| ClientError::Sink(e.to_string()))?;
            self.sink = Some(sink);
            self.format = format;
            tracing::debug!(
                sample_rate = format.sample_rate,
                sample_format = ?format.sample_format,
                "Playback sink opened"
            );
            Ok(())
        }

        fn write(&mut self, chunk: &[u8]) -> Result<(), ClientError> {
            let sink = self
                .sink
                .as_ref()
                .ok_or_else(|| ClientError::Sink("sink is not open".into()))?;
            let samples = decode(chunk, self.format.sample_format);
            let source =
                rodio::buffer::SamplesBuffer::new(self.format.channels, self.format.sample_rate, samples);
            sink.append(source);
            Ok(())
        }

        fn is_playing(&self) -> bool {
            self.sink.as_ref().is_some_and(|sink| !sink.empty())
        }

        fn queued(&self) -> usize {
            self.sink.as_ref().map_or(0, Sink::len)
        }

        fn abort(&mut self) {
            if let Some(sink) = self.sink.take() {
                sink.stop();
            }
            tracing::debug!("Playback aborted");
        }

        fn close(&mut self) {
            self.sink = None;
        }
    }

    /// Factory for a [`RodioSink`] on the default device.
    pub fn default_output() -> SinkFactory {
        Box::new(|| Ok(Box::new(RodioSink::new()?) as Box<dyn AudioSink>))
    }
}
