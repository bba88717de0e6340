//! Connection to a speech server's control and audio channels.
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use tts_core::{AudioFormat, Command, Reply};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::pipeline::{run_pipeline, PipelineOptions, PlaybackReport, Shutdown};
use crate::sink::SinkFactory;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open(url: &str) -> Result<Ws, ClientError> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|source| ClientError::Connect {
            url: url.to_string(),
            source,
        })?;
    debug!(url, "Connected");
    Ok(ws)
}

/// The control socket plus its request/acknowledge discipline.
struct ControlChannel {
    ws: Ws,
    ack_timeout: std::time::Duration,
    cancel_sent: bool,
}

impl ControlChannel {
    /// Send `command` and wait for its acknowledgement.
    async fn send(&mut self, command: Command) -> Result<(), ClientError> {
        let expected = command.kind();
        self.ws.send(Message::Text(command.to_json().into())).await?;

        let reply = tokio::time::timeout(self.ack_timeout, self.next_reply())
            .await
            .map_err(|_| ClientError::AckTimeout(expected))??;

        match reply {
            Reply::Ack(kind) if kind == expected => Ok(()),
            Reply::Ack(got) => Err(ClientError::UnexpectedAck { expected, got }),
            Reply::Error(message) => Err(ClientError::Rejected(message)),
        }
    }

    async fn next_reply(&mut self) -> Result<Reply, ClientError> {
        while let Some(message) = self.ws.next().await {
            match message? {
                Message::Text(text) => return Ok(Reply::parse(text.as_str())?),
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(ClientError::ControlClosed)
    }

    /// Ask the server to stop. Sent at most once per playback.
    async fn cancel(&mut self) {
        if self.cancel_sent {
            return;
        }
        self.cancel_sent = true;
        if let Err(e) = self.send(Command::Cancel).await {
            warn!(error = %e, "Failed to send cancellation");
        }
    }
}

pub struct TtsClient {
    config: ClientConfig,
    control: ControlChannel,
    audio: Ws,
}

impl TtsClient {
    /// Open both channels. The audio channel is connected first so that
    /// no frame of a later run can be missed.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let audio = open(&config.audio_url).await?;
        let control = open(&config.control_url).await?;
        info!(
            control = %config.control_url,
            audio = %config.audio_url,
            "Connected to speech server"
        );

        Ok(Self {
            control: ControlChannel {
                ws: control,
                ack_timeout: config.ack_timeout,
                cancel_sent: false,
            },
            audio,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Append one fragment to the server's pending text.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.control
            .send(Command::text(text, self.config.voice_conversion))
            .await
    }

    pub async fn synthesize(&mut self) -> Result<(), ClientError> {
        self.control.send(Command::Synthesize).await
    }

    pub async fn cancel(&mut self) -> Result<(), ClientError> {
        self.control.send(Command::Cancel).await
    }

    /// Drop audio frames that are already waiting on the audio socket.
    /// Nothing received before our `synthesize` is sent belongs to our run.
    fn discard_stale_audio(&mut self) -> Result<usize, ClientError> {
        let mut discarded = 0;
        while let Some(Some(message)) = self.audio.next().now_or_never() {
            match message? {
                Message::Binary(_) | Message::Text(_) => discarded += 1,
                _ => {}
            }
        }
        if discarded > 0 {
            debug!(discarded, "Discarded audio from an earlier run");
        }
        Ok(discarded)
    }

    /// Send `fragments`, request synthesis and play the result.
    ///
    /// Stopping `shutdown` cancels the run on the server and aborts local
    /// playback; the report then has `cancelled` set. A playback failure
    /// also cancels the server run before the error is returned.
    pub async fn speak<I>(
        &mut self,
        fragments: I,
        sink: SinkFactory,
        shutdown: Shutdown,
    ) -> Result<PlaybackReport, ClientError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for fragment in fragments {
            self.send_text(fragment.as_ref()).await?;
        }
        self.discard_stale_audio()?;
        self.synthesize().await?;
        self.control.cancel_sent = false;

        let format = AudioFormat::for_voice_conversion(self.config.voice_conversion);
        let options = PipelineOptions {
            timeouts: self.config.timeouts,
            queue_capacity: self.config.queue_capacity,
            capture: self.config.capture,
        };

        let pipeline = run_pipeline(&mut self.audio, format, sink, options, shutdown.clone());
        tokio::pin!(pipeline);

        let report = tokio::select! {
            report = &mut pipeline => report,
            _ = shutdown.stopped() => {
                self.control.cancel().await;
                pipeline.await
            }
        };
        if report.is_err() {
            shutdown.stop();
        }
        if shutdown.is_stopped() {
            self.control.cancel().await;
        }
        let report = report?;

        info!(
            chunks = report.chunks,
            bytes = report.bytes,
            end = ?report.end,
            cancelled = report.cancelled,
            "Playback finished"
        );
        Ok(report)
    }
}
