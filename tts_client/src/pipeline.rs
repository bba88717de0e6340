//! Client playback pipeline.
//!
//! A receive loop moves audio frames from the socket into a bounded
//! [`PlaybackQueue`](QueueItem); a drain loop on a blocking thread feeds
//! them to the [`AudioSink`] and the optional [`CaptureBuffer`]. The
//! receive loop ends on the server's completion marker, on close, or when
//! the stream goes quiet for longer than the applicable timeout. All of
//! these are normal endings.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use tts_core::{AudioEvent, AudioFormat, CaptureBuffer};

use crate::config::CompletionTimeouts;
use crate::error::ClientError;
use crate::sink::{AudioSink, SinkFactory, SINK_QUEUE_LIMIT};

const PLAYBACK_POLL: Duration = Duration::from_millis(20);

/// Items on the playback queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Chunk(Bytes),
    /// No more audio will follow.
    Complete,
}

/// Why the receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server sent `synthesis_complete`.
    Explicit,
    /// No frame arrived within the timeout window.
    TimedOut { first_chunk: bool },
    /// The audio connection closed or failed.
    Closed,
    /// Playback was stopped locally.
    Stopped,
}

/// Cloneable stop trigger shared by the pipeline and its caller.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once stopped.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub chunks: usize,
    pub bytes: usize,
    pub end: StreamEnd,
}

/// Pump audio frames into `queue` until the stream ends.
///
/// A completion sentinel is queued on every ending except a local stop.
pub async fn receive_loop<S>(
    mut audio: S,
    queue: mpsc::Sender<QueueItem>,
    timeouts: CompletionTimeouts,
    shutdown: Shutdown,
) -> ReceiveSummary
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut chunks = 0usize;
    let mut bytes = 0usize;

    let end = loop {
        let window = timeouts.window(chunks > 0);
        let next = tokio::select! {
            biased;
            _ = shutdown.stopped() => break StreamEnd::Stopped,
            _ = queue.closed() => break StreamEnd::Stopped,
            next = tokio::time::timeout(window, audio.next()) => next,
        };

        let message = match next {
            Err(_) => {
                let first_chunk = chunks == 0;
                info!(
                    first_chunk,
                    window_ms = window.as_millis() as u64,
                    "No audio within the timeout, treating the stream as complete"
                );
                break StreamEnd::TimedOut { first_chunk };
            }
            Ok(None) => break StreamEnd::Closed,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Audio connection ended");
                break StreamEnd::Closed;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(data) => {
                chunks += 1;
                bytes += data.len();
                let pushed = tokio::select! {
                    biased;
                    _ = shutdown.stopped() => false,
                    sent = queue.send(QueueItem::Chunk(data)) => sent.is_ok(),
                };
                if !pushed {
                    break StreamEnd::Stopped;
                }
            }
            Message::Text(text) => match AudioEvent::parse(text.as_str()) {
                Some(AudioEvent::SynthesisComplete) => break StreamEnd::Explicit,
                None => debug!(frame = %text.as_str(), "Ignoring text frame on audio channel"),
            },
            Message::Close(_) => break StreamEnd::Closed,
            _ => {}
        }
    };

    if end != StreamEnd::Stopped {
        let _ = queue.send(QueueItem::Complete).await;
    }

    debug!(chunks, bytes, ?end, "Receive loop finished");
    ReceiveSummary { chunks, bytes, end }
}

#[derive(Debug)]
pub struct DrainReport {
    pub played: usize,
    pub capture: Option<CaptureBuffer>,
    pub aborted: bool,
    /// The sink error that ended playback early.
    pub failure: Option<ClientError>,
}

/// Feed queued chunks to the sink until the sentinel arrives. Blocking;
/// run it on its own thread.
///
/// Only [`SINK_QUEUE_LIMIT`] chunks are handed to the sink ahead of
/// playback, so a slow device backs up into `queue` and from there into
/// the receive loop. A failed write aborts the sink and is returned in the
/// report together with the capture.
pub fn drain_loop(
    mut queue: mpsc::Receiver<QueueItem>,
    sink: &mut dyn AudioSink,
    mut capture: Option<CaptureBuffer>,
    abort: &AtomicBool,
) -> DrainReport {
    let stopped = || abort.load(Ordering::SeqCst);
    let mut played = 0usize;
    let mut failure = None;

    while let Some(item) = queue.blocking_recv() {
        if stopped() {
            break;
        }
        let data = match item {
            QueueItem::Chunk(data) => data,
            QueueItem::Complete => break,
        };

        while sink.queued() >= SINK_QUEUE_LIMIT && !stopped() {
            std::thread::sleep(PLAYBACK_POLL);
        }
        if stopped() {
            break;
        }

        if let Err(e) = sink.write(&data) {
            warn!(error = %e, "Audio output failed, stopping playback");
            failure = Some(e);
            break;
        }
        if let Some(capture) = capture.as_mut() {
            capture.append(&data);
        }
        played += 1;
    }
    // Nothing more will be read; let the receive loop see it.
    drop(queue);

    if failure.is_none() {
        while sink.is_playing() && !stopped() {
            std::thread::sleep(PLAYBACK_POLL);
        }
    }

    let aborted = failure.is_some() || stopped();
    if aborted {
        sink.abort();
    } else {
        sink.close();
    }

    DrainReport {
        played,
        capture,
        aborted,
        failure,
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub timeouts: CompletionTimeouts,
    pub queue_capacity: usize,
    pub capture: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            timeouts: CompletionTimeouts::default(),
            queue_capacity: 64,
            capture: false,
        }
    }
}

/// Outcome of one playback run.
#[derive(Debug)]
pub struct PlaybackReport {
    pub chunks: usize,
    pub bytes: usize,
    pub end: StreamEnd,
    pub cancelled: bool,
    /// Finalized WAV bytes when capture was enabled.
    pub capture: Option<Vec<u8>>,
}

/// Run the receive and drain loops over one audio stream.
///
/// Stopping through `shutdown` aborts both loops and the sink; whatever
/// was captured up to that point is still returned. An output error ends
/// both loops as well and comes back as [`ClientError::PlaybackFailed`].
pub async fn run_pipeline<S>(
    audio: S,
    format: AudioFormat,
    sink_factory: SinkFactory,
    options: PipelineOptions,
    shutdown: Shutdown,
) -> Result<PlaybackReport, ClientError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let (queue_tx, queue_rx) = mpsc::channel(options.queue_capacity.max(1));
    let abort = Arc::new(AtomicBool::new(false));
    let capture = options.capture.then(|| CaptureBuffer::new(format));

    let drain_abort = abort.clone();
    let mut drain = tokio::task::spawn_blocking(move || -> Result<DrainReport, ClientError> {
        let mut sink = sink_factory()?;
        sink.open(format)?;
        Ok(drain_loop(queue_rx, sink.as_mut(), capture, &drain_abort))
    });

    let summary = receive_loop(audio, queue_tx, options.timeouts, shutdown.clone()).await;
    if summary.end == StreamEnd::Stopped {
        abort.store(true, Ordering::SeqCst);
    }

    let joined = tokio::select! {
        joined = &mut drain => joined,
        _ = shutdown.stopped() => {
            abort.store(true, Ordering::SeqCst);
            drain.await
        }
    };
    let drained = joined.map_err(|e| ClientError::Playback(e.to_string()))??;

    let capture = match drained.capture {
        Some(buffer) => Some(
            buffer
                .finalize()
                .map_err(|e| ClientError::Capture(e.to_string()))?,
        ),
        None => None,
    };

    if let Some(source) = drained.failure {
        return Err(ClientError::PlaybackFailed {
            source: Box::new(source),
            capture,
        });
    }

    let cancelled = shutdown.is_stopped() || drained.aborted;
    if cancelled {
        warn!(played = drained.played, "Playback stopped early");
    }

    Ok(PlaybackReport {
        chunks: summary.chunks,
        bytes: summary.bytes,
        end: summary.end,
        cancelled,
        capture,
    })
}
