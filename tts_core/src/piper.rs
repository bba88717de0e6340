//! Piper (ONNX) synthesis backend.
use std::{fs, path::Path};

use anyhow::Context;
use piper_rs::synth::{PiperSpeechStreamParallel, PiperSpeechSynthesizer};

use crate::engine::{EmitFn, EngineError, StopSignal, SynthesisEngine};
use crate::text::FinalizedText;

pub struct PiperEngine {
    synth: PiperSpeechSynthesizer,
    sample_rate: u32,
}

// PiperSpeechSynthesizer doesn't implement Debug
impl std::fmt::Debug for PiperEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiperEngine")
            .field("synth", &"<PiperSpeechSynthesizer>")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl PiperEngine {
    /// Load a voice from its `.onnx.json` config. The model file is
    /// resolved by piper next to the config.
    pub fn from_config_path<P: AsRef<Path>>(cfg_path: P) -> anyhow::Result<Self> {
        let sample_rate = read_sample_rate(&cfg_path)?;
        let model = piper_rs::from_config_path(cfg_path.as_ref())
            .map_err(|e| anyhow::anyhow!("piper load error: {e}"))?;
        let synth = PiperSpeechSynthesizer::new(model)?;
        tracing::info!(
            config = %cfg_path.as_ref().display(),
            sample_rate,
            "Piper voice loaded"
        );
        Ok(Self { synth, sample_rate })
    }
}

impl SynthesisEngine for PiperEngine {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn synthesize(
        &mut self,
        text: &FinalizedText,
        stop: &StopSignal,
        emit: &mut EmitFn<'_>,
    ) -> Result<(), EngineError> {
        let iter: PiperSpeechStreamParallel = self
            .synth
            .synthesize_parallel(text.joined(), None)
            .map_err(|e| EngineError::Synthesis(format!("piper synth error: {e}")))?;

        for part in iter {
            if stop.is_stopped() {
                tracing::debug!("Piper run stopped between chunks");
                break;
            }
            let samples = part
                .map_err(|e| EngineError::Synthesis(format!("chunk error: {e}")))?
                .into_vec();
            emit(samples)?;
        }
        Ok(())
    }
}

/// Read `audio.sample_rate` from a piper model config.
fn read_sample_rate<P: AsRef<Path>>(cfg_path: P) -> anyhow::Result<u32> {
    let text = fs::read_to_string(cfg_path.as_ref())
        .with_context(|| format!("Failed to read config file: {}", cfg_path.as_ref().display()))?;
    let json: serde_json::Value =
        serde_json::from_str(&text).with_context(|| "Config file is not valid JSON")?;

    let sample_rate = json
        .get("audio")
        .and_then(|a| a.get("sample_rate"))
        .and_then(|sr| sr.as_u64())
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid 'audio.sample_rate' in config"))?;

    Ok(sample_rate as u32)
}
