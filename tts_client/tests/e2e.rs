//! Client against a real server on ephemeral ports

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;

use tts_client::sink::null_sink;
use tts_client::{
    AudioSink, ClientConfig, ClientError, CompletionTimeouts, Shutdown, SinkFactory, StreamEnd,
    TtsClient,
};
use tts_core::audio::f32_to_i16;
use tts_core::{
    AudioFormat, EmitFn, EngineError, FinalizedText, SpeechPipeline, StopSignal, SynthesisEngine,
};
use tts_server::worker::WorkerState;
use tts_server::{config::ServerConfig, serve, AppState};

/// `chunks` chunks of 240 samples, the first after `lead_in`. Every sample
/// of the nth run is `0.1 * n`.
struct DelayedEngine {
    chunks: usize,
    lead_in: Duration,
    gap: Duration,
    texts: Arc<Mutex<Vec<String>>>,
}

impl SynthesisEngine for DelayedEngine {
    fn sample_rate(&self) -> u32 {
        24_000
    }

    fn synthesize(
        &mut self,
        text: &FinalizedText,
        stop: &StopSignal,
        emit: &mut EmitFn<'_>,
    ) -> Result<(), EngineError> {
        let run = {
            let mut texts = self.texts.lock().unwrap();
            texts.push(text.joined());
            texts.len()
        };
        std::thread::sleep(self.lead_in);
        for _ in 0..self.chunks {
            if stop.is_stopped() {
                break;
            }
            emit(vec![0.1 * run as f32; 240])?;
            std::thread::sleep(self.gap);
        }
        Ok(())
    }
}

struct Harness {
    state: AppState,
    config: ClientConfig,
    texts: Arc<Mutex<Vec<String>>>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn start(chunks: usize, lead_in: Duration, gap: Duration) -> Harness {
    let texts = Arc::new(Mutex::new(Vec::new()));
    let engine = DelayedEngine {
        chunks,
        lead_in,
        gap,
        texts: texts.clone(),
    };

    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let audio = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ClientConfig {
        control_url: format!("ws://{}", control.local_addr().unwrap()),
        audio_url: format!("ws://{}", audio.local_addr().unwrap()),
        timeouts: CompletionTimeouts::new(Duration::from_millis(600), Duration::from_millis(300))
            .unwrap(),
        capture: true,
        ..ClientConfig::default()
    };

    let server_config = ServerConfig {
        cancel_grace_ms: 500,
        ..ServerConfig::default()
    };
    let state = AppState::new(server_config, SpeechPipeline::new(engine));
    let server = tokio::spawn(serve(control, audio, state.clone()));

    Harness {
        state,
        config,
        texts,
        server,
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

async fn connected(harness: &Harness) -> TtsClient {
    let listeners = harness.state.broadcaster.subscriber_count();
    let client = TtsClient::connect(harness.config.clone()).await.unwrap();
    wait_until(|| harness.state.broadcaster.subscriber_count() > listeners).await;
    client
}

fn capture_samples(wav: &[u8]) -> Vec<i16> {
    wav[44..]
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[tokio::test]
async fn speaks_and_captures_the_whole_stream() {
    let harness = start(4, Duration::from_millis(10), Duration::from_millis(5)).await;
    let mut client = connected(&harness).await;

    let report = client
        .speak(["Hello ", "world"], null_sink(), Shutdown::new())
        .await
        .unwrap();

    assert_eq!(report.end, StreamEnd::Explicit);
    assert_eq!(report.chunks, 4);
    assert_eq!(report.bytes, 4 * 480);
    assert!(!report.cancelled);
    assert_eq!(report.capture.unwrap().len(), 44 + 4 * 480);
    assert_eq!(harness.texts.lock().unwrap().as_slice(), ["Hello world"]);
}

#[tokio::test]
async fn no_audio_within_first_chunk_timeout_is_a_clean_finish() {
    let harness = start(1, Duration::from_millis(1500), Duration::ZERO).await;
    let mut client = connected(&harness).await;

    let report = client
        .speak(["too slow"], null_sink(), Shutdown::new())
        .await
        .unwrap();

    assert_eq!(report.end, StreamEnd::TimedOut { first_chunk: true });
    assert_eq!(report.chunks, 0);
    assert!(!report.cancelled);
    assert_eq!(report.capture.unwrap().len(), 44);
}

#[tokio::test]
async fn stopping_cancels_the_server_run() {
    let harness = start(200, Duration::ZERO, Duration::from_millis(20)).await;
    let mut client = connected(&harness).await;

    let shutdown = Shutdown::new();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.stop();
    });

    let report = client
        .speak(["interrupt me"], null_sink(), shutdown)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.end, StreamEnd::Stopped);
    assert!(report.chunks > 0);
    assert!(report.capture.is_some());

    tokio::time::timeout(
        Duration::from_secs(2),
        harness.state.worker.wait_for_state(WorkerState::Idle),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(harness.state.metrics.counters().runs_cancelled, 1);
}

#[tokio::test]
async fn preempting_client_only_plays_its_own_run() {
    let harness = start(60, Duration::ZERO, Duration::from_millis(10)).await;
    let mut first = connected(&harness).await;
    first.send_text("first").await.unwrap();
    first.synthesize().await.unwrap();
    wait_until(|| harness.state.metrics.counters().chunks_published >= 5).await;

    let mut second = connected(&harness).await;
    let report = second
        .speak(["second"], null_sink(), Shutdown::new())
        .await
        .unwrap();

    assert_eq!(report.end, StreamEnd::Explicit);
    let samples = capture_samples(&report.capture.unwrap());
    assert_eq!(samples.len(), 60 * 240);
    let own = f32_to_i16(0.2);
    assert!(
        samples.iter().all(|s| *s == own),
        "audio from the preempted run reached the new session"
    );
    assert_eq!(harness.state.metrics.counters().runs_cancelled, 1);
}

struct BrokenSink;

impl AudioSink for BrokenSink {
    fn open(&mut self, _format: AudioFormat) -> Result<(), ClientError> {
        Ok(())
    }

    fn write(&mut self, _chunk: &[u8]) -> Result<(), ClientError> {
        Err(ClientError::Sink("device unplugged".into()))
    }

    fn is_playing(&self) -> bool {
        false
    }

    fn abort(&mut self) {}

    fn close(&mut self) {}
}

#[tokio::test]
async fn output_failure_cancels_the_server_run() {
    let harness = start(200, Duration::ZERO, Duration::from_millis(20)).await;
    let mut client = connected(&harness).await;

    let broken: SinkFactory = Box::new(|| Ok(Box::new(BrokenSink) as Box<dyn AudioSink>));
    let err = client
        .speak(["unplayable"], broken, Shutdown::new())
        .await
        .unwrap_err();
    match err {
        ClientError::PlaybackFailed { source, capture } => {
            assert!(matches!(*source, ClientError::Sink(_)));
            assert_eq!(capture.unwrap().len(), 44);
        }
        other => panic!("expected a playback failure, got {other:?}"),
    }

    tokio::time::timeout(
        Duration::from_secs(2),
        harness.state.worker.wait_for_state(WorkerState::Idle),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(harness.state.metrics.counters().runs_cancelled, 1);
}

#[tokio::test]
async fn rejected_text_surfaces_as_an_error() {
    let harness = start(1, Duration::ZERO, Duration::ZERO).await;
    let mut client = connected(&harness).await;

    let too_long = "a".repeat(6000);
    let err = client.send_text(&too_long).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected(_)));

    // The connection is still usable.
    client.send_text("fine").await.unwrap();
}

#[tokio::test]
async fn unreachable_server_fails_to_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ClientConfig {
        control_url: format!("ws://{addr}"),
        audio_url: format!("ws://{addr}"),
        ..ClientConfig::default()
    };
    let err = TtsClient::connect(config).await.err().unwrap();
    assert!(matches!(err, ClientError::Connect { .. }));
}
