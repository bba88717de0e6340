use tracing::info;

use tts_core::SpeechPipeline;
use tts_server::{bind, config::ServerConfig, serve, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting speech streaming server...");

    let config = ServerConfig::from_env();
    info!(
        "Server configuration loaded: control={}, audio={}, cancel_grace={}ms, voice_conversion={}",
        config.control_addr(),
        config.audio_addr(),
        config.cancel_grace_ms,
        config.voice_conversion
    );

    let pipeline = load_pipeline(&config)?;
    let state = AppState::new(config.clone(), pipeline);

    let (control, audio) = bind(&config)
        .await
        .map_err(|e| anyhow::anyhow!("{e}. Try a different CONTROL_PORT/AUDIO_PORT."))?;

    tokio::select! {
        result = serve(control, audio, state) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

#[cfg(feature = "piper")]
fn load_pipeline(config: &ServerConfig) -> anyhow::Result<SpeechPipeline> {
    info!("Loading Piper voice from {}", config.piper_config);
    let engine = tts_core::piper::PiperEngine::from_config_path(&config.piper_config)?;
    Ok(SpeechPipeline::new(engine))
}

#[cfg(not(feature = "piper"))]
fn load_pipeline(_config: &ServerConfig) -> anyhow::Result<SpeechPipeline> {
    anyhow::bail!("tts-server was built without a synthesis backend; enable the `piper` feature")
}
