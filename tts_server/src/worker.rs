//! The synthesis worker.
//!
//! A single long-lived task owns the pending text, the voice conversion
//! toggle and the one in-flight run. Commands reach it over an unbounded
//! channel in submission order. The blocking engine call runs on a
//! `spawn_blocking` thread, one run at a time, and publishes each chunk to
//! the [`Broadcaster`] tagged with the run's generation.
//!
//! Generations are assigned at submission. `Cancel` and `NewSession`
//! advance the broadcaster's generation as they are submitted, and a
//! `Synthesize` runs under the generation current when it was submitted,
//! so a run requested before a cancel can never publish after it.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use tts_core::{
    AudioChunk, AudioFormat, Command, EngineError, FinalizedText, PendingTextBuffer,
    SpeechPipeline, StopSignal, StreamResampler,
};

use crate::broadcast::{AudioFrame, Broadcaster};
use crate::error::ServerError;
use crate::metrics::ServerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Accumulating,
    Synthesizing,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Accumulating => "accumulating",
            WorkerState::Synthesizing => "synthesizing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a cancelled run gets to return before it is detached.
    pub cancel_grace: Duration,
    pub voice_conversion: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(2),
            voice_conversion: false,
        }
    }
}

/// A command plus the generation it was submitted under.
#[derive(Debug)]
struct Submission {
    command: Command,
    generation: u64,
}

/// Cheap, cloneable access to the worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Submission>,
    state: watch::Receiver<WorkerState>,
    broadcaster: Broadcaster,
}

impl WorkerHandle {
    /// Enqueue a command. Never blocks.
    ///
    /// `Cancel` and `NewSession` orphan every frame produced so far before
    /// they are queued.
    pub fn submit(&self, command: Command) -> Result<(), ServerError> {
        let generation = match command {
            Command::Cancel | Command::NewSession => self.broadcaster.invalidate(),
            _ => self.broadcaster.current_generation(),
        };
        self.tx
            .send(Submission {
                command,
                generation,
            })
            .map_err(|_| ServerError::WorkerGone)
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Resolve once the worker reaches `target`.
    pub async fn wait_for_state(&self, target: WorkerState) -> Result<(), ServerError> {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| ServerError::WorkerGone)
    }
}

/// Start the worker task. It runs until every [`WorkerHandle`] is dropped.
pub fn spawn(
    pipeline: SpeechPipeline,
    broadcaster: Broadcaster,
    metrics: ServerMetrics,
    config: WorkerConfig,
) -> WorkerHandle {
    let (tx, commands) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(WorkerState::Idle);

    let worker = Worker {
        commands,
        pipeline: Arc::new(Mutex::new(pipeline)),
        broadcaster: broadcaster.clone(),
        metrics,
        cancel_grace: config.cancel_grace,
        voice_conversion: config.voice_conversion,
        buffer: PendingTextBuffer::new(),
        queued: VecDeque::new(),
        run: None,
        state_tx,
    };
    tokio::spawn(worker.run());

    WorkerHandle {
        tx,
        state,
        broadcaster,
    }
}

struct QueuedRun {
    text: FinalizedText,
    voice_conversion: bool,
    generation: u64,
}

struct ActiveRun {
    generation: u64,
    stop: StopSignal,
    task: JoinHandle<Result<RunReport, EngineError>>,
    started: Instant,
}

#[derive(Debug, Default)]
struct RunReport {
    chunks: usize,
    bytes: usize,
}

enum Event {
    Command(Option<Submission>),
    RunFinished(Result<Result<RunReport, EngineError>, JoinError>),
}

struct Worker {
    commands: mpsc::UnboundedReceiver<Submission>,
    pipeline: Arc<Mutex<SpeechPipeline>>,
    broadcaster: Broadcaster,
    metrics: ServerMetrics,
    cancel_grace: Duration,
    voice_conversion: bool,
    buffer: PendingTextBuffer,
    queued: VecDeque<QueuedRun>,
    run: Option<ActiveRun>,
    state_tx: watch::Sender<WorkerState>,
}

async fn join_active(run: &mut Option<ActiveRun>) -> Result<Result<RunReport, EngineError>, JoinError> {
    match run {
        Some(active) => (&mut active.task).await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self) {
        info!(
            voice_conversion = self.voice_conversion,
            "Synthesis worker started"
        );
        loop {
            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command),
                joined = join_active(&mut self.run) => Event::RunFinished(joined),
            };

            match event {
                Event::Command(Some(submission)) => self.handle(submission).await,
                Event::Command(None) => break,
                Event::RunFinished(joined) => self.finish_run(joined),
            }
        }

        self.broadcaster.invalidate();
        self.cancel("shutdown").await;
        info!("Synthesis worker stopped");
    }

    fn set_state(&self, state: WorkerState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = current.as_str(), to = state.as_str(), "Worker state");
                *current = state;
                true
            }
        });
    }

    fn settle_state(&self) {
        if self.run.is_some() {
            self.set_state(WorkerState::Synthesizing);
        } else if !self.buffer.is_empty() {
            self.set_state(WorkerState::Accumulating);
        } else {
            self.set_state(WorkerState::Idle);
        }
    }

    async fn handle(&mut self, Submission { command, generation }: Submission) {
        match command {
            Command::Text { content, rvc } => {
                if let Some(enabled) = rvc {
                    if enabled != self.voice_conversion {
                        self.voice_conversion = enabled;
                        info!(
                            "Voice conversion {}",
                            if enabled { "enabled" } else { "disabled" }
                        );
                    }
                }
                self.buffer.push(content);
                if self.run.is_none() {
                    self.set_state(WorkerState::Accumulating);
                }
            }
            Command::Synthesize => {
                let text = std::mem::take(&mut self.buffer).finalize();
                self.queued.push_back(QueuedRun {
                    text,
                    voice_conversion: self.voice_conversion,
                    generation,
                });
                if self.run.is_some() {
                    debug!(queued = self.queued.len(), "Synthesis queued behind the current run");
                }
                self.dispatch_next();
            }
            Command::Cancel => self.cancel("cancel").await,
            Command::NewSession => self.cancel("new session").await,
        }
    }

    /// Start the next queued run if the blocking slot is free.
    fn dispatch_next(&mut self) {
        while self.run.is_none() {
            let Some(next) = self.queued.pop_front() else {
                break;
            };

            if !self.broadcaster.is_current(next.generation) {
                debug!(generation = next.generation, "Dropping synthesis requested before a cancel");
                continue;
            }

            if next.text.is_blank() {
                debug!("Nothing to synthesize, completing immediately");
                ServerMetrics::incr(&self.metrics.runs_completed);
                self.broadcaster
                    .publish(next.generation, AudioFrame::Complete);
                continue;
            }

            self.start_run(next);
        }
        self.settle_state();
    }

    fn start_run(&mut self, queued: QueuedRun) {
        let generation = queued.generation;
        let stop = StopSignal::new();
        let started = Instant::now();

        info!(
            generation,
            chars = queued.text.len(),
            voice_conversion = queued.voice_conversion,
            "Synthesis started"
        );
        ServerMetrics::incr(&self.metrics.runs_started);

        let ctx = RunContext {
            pipeline: self.pipeline.clone(),
            broadcaster: self.broadcaster.clone(),
            metrics: self.metrics.clone(),
            generation,
            stop: stop.clone(),
            started,
        };
        let task = tokio::task::spawn_blocking(move || ctx.synthesize(queued));

        self.run = Some(ActiveRun {
            generation,
            stop,
            task,
            started,
        });
    }

    fn finish_run(&mut self, joined: Result<Result<RunReport, EngineError>, JoinError>) {
        let Some(run) = self.run.take() else {
            return;
        };

        match joined {
            Ok(Ok(report)) => {
                self.broadcaster
                    .publish(run.generation, AudioFrame::Complete);
                ServerMetrics::incr(&self.metrics.runs_completed);
                info!(
                    generation = run.generation,
                    chunks = report.chunks,
                    bytes = report.bytes,
                    elapsed_ms = run.started.elapsed().as_millis() as u64,
                    "Synthesis complete"
                );
            }
            Ok(Err(e)) => {
                ServerMetrics::incr(&self.metrics.runs_failed);
                error!(generation = run.generation, error = %e, "Synthesis failed");
            }
            Err(e) => {
                let e = EngineError::Panicked(e.to_string());
                ServerMetrics::incr(&self.metrics.runs_failed);
                error!(generation = run.generation, error = %e, "Synthesis failed");
            }
        }

        self.dispatch_next();
    }

    /// Drop everything pending and stop the current run, if any.
    async fn cancel(&mut self, reason: &str) {
        self.buffer = PendingTextBuffer::new();
        let dropped = self.queued.len();
        self.queued.clear();

        let generation = self.broadcaster.current_generation();
        let Some(run) = self.run.take() else {
            debug!(reason, generation, "Cancel while idle");
            self.set_state(WorkerState::Idle);
            return;
        };

        info!(reason, generation = run.generation, dropped, "Cancelling synthesis");
        ServerMetrics::incr(&self.metrics.runs_cancelled);
        run.stop.request_stop();

        match tokio::time::timeout(self.cancel_grace, run.task).await {
            Ok(Ok(Ok(_))) => debug!("Cancelled run stopped"),
            Ok(Ok(Err(e))) => debug!(error = %e, "Cancelled run ended with an error"),
            Ok(Err(e)) => warn!(error = %e, "Cancelled run panicked"),
            Err(_) => {
                ServerMetrics::incr(&self.metrics.runs_detached);
                warn!(
                    grace_ms = self.cancel_grace.as_millis() as u64,
                    "Synthesis did not stop within the grace period, detaching it"
                );
            }
        }

        self.set_state(WorkerState::Idle);
    }
}

/// Everything the blocking run needs, moved onto its thread.
struct RunContext {
    pipeline: Arc<Mutex<SpeechPipeline>>,
    broadcaster: Broadcaster,
    metrics: ServerMetrics,
    generation: u64,
    stop: StopSignal,
    started: Instant,
}

impl RunContext {
    fn synthesize(self, queued: QueuedRun) -> Result<RunReport, EngineError> {
        let mut guard = self.pipeline.lock().unwrap_or_else(|poisoned| {
            warn!("Previous synthesis panicked, reusing the engine");
            poisoned.into_inner()
        });
        let SpeechPipeline { engine, converter } = &mut *guard;

        let voice_conversion = queued.voice_conversion;
        let format = AudioFormat::for_voice_conversion(voice_conversion);
        let native_rate = engine.sample_rate();
        if voice_conversion {
            converter.reset();
        }

        let mut report = RunReport::default();
        let mut resampler: Option<StreamResampler> = None;
        let mut emit = |samples: Vec<f32>| -> Result<(), EngineError> {
            if self.stop.is_stopped() {
                return Ok(());
            }

            let (samples, rate) = if voice_conversion {
                converter.convert(samples, native_rate)?
            } else {
                (samples, native_rate)
            };

            if resampler.as_ref().map_or(true, |r| r.source_rate() != rate) {
                if let Some(mut previous) = resampler.take() {
                    let tail = previous.finish()?;
                    self.publish(&tail, format, &mut report);
                }
                resampler = Some(StreamResampler::new(rate, format.sample_rate)?);
            }
            if let Some(resampler) = resampler.as_mut() {
                let resampled = resampler.process(&samples)?;
                self.publish(&resampled, format, &mut report);
            }
            Ok(())
        };

        engine.synthesize(&queued.text, &self.stop, &mut emit)?;

        if !self.stop.is_stopped() {
            if let Some(mut resampler) = resampler.take() {
                let tail = resampler.finish()?;
                self.publish(&tail, format, &mut report);
            }
        }
        Ok(report)
    }

    fn publish(&self, samples: &[f32], format: AudioFormat, report: &mut RunReport) {
        if samples.is_empty() {
            return;
        }
        let chunk = AudioChunk::from_samples(samples, format);

        if report.chunks == 0 {
            self.metrics
                .first_chunk_latency
                .record(self.started.elapsed().as_millis() as u64);
        }
        report.chunks += 1;
        report.bytes += chunk.len();
        self.metrics.record_chunk(chunk.len());

        self.broadcaster
            .publish(self.generation, AudioFrame::Chunk(chunk));
    }
}
