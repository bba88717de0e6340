// Configuration for the speech streaming server

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub control_port: u16,
    pub audio_port: u16,
    /// How long a cancelled run may take to return before it is detached.
    pub cancel_grace_ms: u64,
    /// Frames buffered per audio subscriber before it is dropped as lagging.
    pub subscriber_buffer: usize,
    /// Voice conversion state before any client toggles it.
    pub voice_conversion: bool,
    /// Piper voice config (`.onnx.json`).
    pub piper_config: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            control_port: 8000,
            audio_port: 8001,
            cancel_grace_ms: 2000,
            subscriber_buffer: 256,
            voice_conversion: false,
            piper_config: "models/voice.onnx.json".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = std::env::var("HOST").unwrap_or(defaults.host);

        let control_port = std::env::var("CONTROL_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.control_port);

        let audio_port = std::env::var("AUDIO_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.audio_port);

        let cancel_grace_ms = std::env::var("CANCEL_GRACE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.cancel_grace_ms);

        let subscriber_buffer = std::env::var("SUBSCRIBER_BUFFER")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.subscriber_buffer);

        let voice_conversion = std::env::var("VOICE_CONVERSION")
            .ok()
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(defaults.voice_conversion);

        let piper_config = std::env::var("PIPER_CONFIG").unwrap_or(defaults.piper_config);

        Self {
            host,
            control_port,
            audio_port,
            cancel_grace_ms,
            subscriber_buffer,
            voice_conversion,
            piper_config,
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    pub fn audio_addr(&self) -> String {
        format!("{}:{}", self.host, self.audio_port)
    }
}
