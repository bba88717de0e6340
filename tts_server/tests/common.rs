//! Common utilities for integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use tts_core::{EmitFn, EngineError, FinalizedText, SpeechPipeline, StopSignal, SynthesisEngine};
use tts_server::{config::ServerConfig, serve, AppState};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Emits a fixed number of chunks per run. Every sample of run `n` (1-based)
/// has the value `0.1 * n`, so runs can be told apart on the wire.
pub struct ScriptedEngine {
    pub chunks: usize,
    pub delay: Duration,
    pub texts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedEngine {
    pub fn new(chunks: usize, delay: Duration) -> Self {
        Self {
            chunks,
            delay,
            texts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SynthesisEngine for ScriptedEngine {
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
        for _ in 0..self.chunks {
            std::thread::sleep(self.delay);
            if stop.is_stopped() {
                break;
            }
            emit(vec![0.1 * run as f32; 480])?;
        }
        Ok(())
    }
}

/// The int16 value every sample of run `n` encodes to.
pub fn run_marker(run: usize) -> i16 {
    tts_core::audio::f32_to_i16(0.1 * run as f32)
}

pub struct TestServer {
    pub control_url: String,
    pub audio_url: String,
    pub state: AppState,
    handle: JoinHandle<std::io::Result<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a server on ephemeral ports.
pub async fn spawn_server(engine: impl SynthesisEngine + 'static) -> TestServer {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        control_port: 0,
        audio_port: 0,
        cancel_grace_ms: 500,
        ..ServerConfig::default()
    };
    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let audio = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_url = format!("ws://{}", control.local_addr().unwrap());
    let audio_url = format!("ws://{}", audio.local_addr().unwrap());

    let state = AppState::new(config, SpeechPipeline::new(engine));
    let handle = tokio::spawn(serve(control, audio, state.clone()));

    TestServer {
        control_url,
        audio_url,
        state,
        handle,
    }
}

pub async fn connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("websocket connect");
    ws
}

/// Send one JSON command and return the parsed reply.
pub async fn command(ws: &mut Ws, json: &str) -> serde_json::Value {
    ws.send(Message::Text(json.into())).await.unwrap();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("reply timeout")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

pub async fn wait_until_subscribed(server: &TestServer, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.state.broadcaster.subscriber_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("audio subscriber never registered");
}

#[derive(Debug, PartialEq)]
pub enum AudioMsg {
    Chunk(Vec<u8>),
    Complete,
}

/// Next audio-channel message, or `None` after `wait` of silence.
pub async fn next_audio(ws: &mut Ws, wait: Duration) -> Option<AudioMsg> {
    loop {
        let message = match tokio::time::timeout(wait, ws.next()).await {
            Ok(Some(Ok(message))) => message,
            _ => return None,
        };
        match message {
            Message::Binary(data) => return Some(AudioMsg::Chunk(data.to_vec())),
            Message::Text(text) if text.as_str().contains("synthesis_complete") => {
                return Some(AudioMsg::Complete)
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// First int16 sample of a chunk.
pub fn first_sample(chunk: &[u8]) -> i16 {
    i16::from_le_bytes([chunk[0], chunk[1]])
}
