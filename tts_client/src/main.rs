use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use tts_client::capture::CaptureTarget;
use tts_client::config::{DEFAULT_AUDIO_URL, DEFAULT_CONTROL_URL};
use tts_client::sink::{self, SinkFactory};
use tts_client::{ClientConfig, ClientError, CompletionTimeouts, Shutdown, StreamEnd, TtsClient};

/// Speak text through a tts-server
#[derive(Debug, Parser)]
#[command(name = "tts")]
#[command(about = "Stream synthesized speech from a tts-server and play it")]
struct Args {
    /// Text to speak. Read from stdin, one fragment per line, when omitted.
    text: Vec<String>,

    /// Control channel URL
    #[arg(long, env = "TTS_CONTROL_SERVER", default_value = DEFAULT_CONTROL_URL)]
    control_server: String,

    /// Audio channel URL
    #[arg(long, env = "TTS_AUDIO_SERVER", default_value = DEFAULT_AUDIO_URL)]
    audio_server: String,

    /// Enable voice conversion
    #[arg(long)]
    rvc: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Write the captured audio to this WAV file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Don't play audio locally
    #[arg(long)]
    no_playback: bool,

    /// Seconds to wait for the first chunk before giving up
    #[arg(long, default_value_t = 6.0)]
    first_chunk_timeout: f64,

    /// Seconds of silence between chunks that end the stream
    #[arg(long, default_value_t = 1.0)]
    chunk_timeout: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    run(args).await
}

async fn run(args: Args) -> Result<()> {
    let timeouts = CompletionTimeouts::new(
        seconds(args.first_chunk_timeout, "--first-chunk-timeout")?,
        seconds(args.chunk_timeout, "--chunk-timeout")?,
    )?;

    let capture_target = match &args.output {
        Some(path) => Some(CaptureTarget::File(path.clone())),
        None if !std::io::stdout().is_terminal() => Some(CaptureTarget::Stdout),
        None => None,
    };

    let config = ClientConfig {
        control_url: args.control_server.clone(),
        audio_url: args.audio_server.clone(),
        voice_conversion: args.rvc,
        timeouts,
        capture: capture_target.is_some(),
        ..ClientConfig::default()
    };

    let mut client = TtsClient::connect(config)
        .await
        .context("Is tts-server running?")?;

    let shutdown = Shutdown::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping playback");
            on_signal.stop();
        }
    });

    let fragments = if args.text.is_empty() {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        let mut index = 0;
        while let Some(line) = lines.next_line().await? {
            if shutdown.is_stopped() {
                break;
            }
            eprintln!("{line}");
            client.send_text(&line_fragment(index, &line)).await?;
            index += 1;
        }
        Vec::new()
    } else {
        let text = args.text.join(" ");
        eprintln!("{text}");
        vec![text]
    };

    let report = match client
        .speak(fragments, sink_factory(args.no_playback), shutdown)
        .await
    {
        Ok(report) => report,
        Err(ClientError::PlaybackFailed { source, capture }) => {
            save_capture(capture_target.as_ref(), capture.as_deref())?;
            return Err(anyhow::Error::new(*source).context("Playback failed"));
        }
        Err(e) => return Err(e.into()),
    };

    if let StreamEnd::TimedOut { first_chunk: true } = report.end {
        warn!("Server sent no audio");
    }

    save_capture(capture_target.as_ref(), report.capture.as_deref())
}

fn save_capture(target: Option<&CaptureTarget>, wav: Option<&[u8]>) -> Result<()> {
    let (Some(target), Some(wav)) = (target, wav) else {
        return Ok(());
    };
    target.write(wav).context("Failed to write captured audio")?;
    if let CaptureTarget::File(path) = target {
        info!("Audio saved to {}", path.display());
    }
    Ok(())
}

/// Text sent for the `index`th stdin line. Lines after the first are
/// separated from the previous one by a space.
fn line_fragment(index: usize, line: &str) -> String {
    if index == 0 {
        line.to_string()
    } else {
        format!(" {line}")
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{flag} must be a non-negative number of seconds"))
}

#[cfg(feature = "playback")]
fn sink_factory(no_playback: bool) -> SinkFactory {
    if no_playback {
        sink::null_sink()
    } else {
        sink::default_output()
    }
}

#[cfg(not(feature = "playback"))]
fn sink_factory(no_playback: bool) -> SinkFactory {
    if !no_playback {
        warn!("Built without playback support, audio will only be captured");
    }
    sink::null_sink()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_lines_are_joined_with_spaces() {
        let text: String = ["Hello there,", "how are you?"]
            .iter()
            .enumerate()
            .map(|(i, line)| line_fragment(i, line))
            .collect();
        assert_eq!(text, "Hello there, how are you?");
    }

    #[test]
    fn cli_defaults() {
        let args = Args::parse_from(["tts", "hello"]);
        assert_eq!(args.text, vec!["hello"]);
        assert_eq!(args.first_chunk_timeout, 6.0);
        assert!(!args.rvc);
        assert!(args.output.is_none());
    }
}
