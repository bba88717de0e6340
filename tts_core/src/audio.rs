//! Audio formats and chunk encoding.
//!
//! Engines produce mono `f32` samples at their native rate. Before a chunk
//! leaves the server it is resampled to the rate of the active profile and
//! encoded to the profile's sample format, so that every chunk of a run
//! shares one [`AudioFormat`].
use bytes::Bytes;
use rubato::{FftFixedIn, Resampler as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rate of the standard (unconverted) profile.
pub const STANDARD_SAMPLE_RATE: u32 = 24_000;
/// Rate of the voice-converted profile.
pub const CONVERTED_SAMPLE_RATE: u32 = 40_000;

const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// Signed 16-bit little endian.
    Int16,
    /// IEEE 32-bit float little endian.
    Float32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Float32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// 16-bit / 24 kHz mono, used when voice conversion is off.
    pub const fn standard() -> Self {
        Self {
            sample_format: SampleFormat::Int16,
            sample_rate: STANDARD_SAMPLE_RATE,
            channels: 1,
        }
    }

    /// float32 / 40 kHz mono, used when voice conversion is on.
    pub const fn converted() -> Self {
        Self {
            sample_format: SampleFormat::Float32,
            sample_rate: CONVERTED_SAMPLE_RATE,
            channels: 1,
        }
    }

    /// The wire profile for a run.
    pub const fn for_voice_conversion(enabled: bool) -> Self {
        if enabled {
            Self::converted()
        } else {
            Self::standard()
        }
    }
}

/// One unit of produced audio. Cloning shares the underlying buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Bytes,
    pub format: AudioFormat,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        Self {
            data: data.into(),
            format,
        }
    }

    /// Encode samples already at the format's rate.
    pub fn from_samples(samples: &[f32], format: AudioFormat) -> Self {
        Self::new(encode(samples, format.sample_format), format)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Encode `f32` samples in `[-1.0, 1.0]` to little-endian bytes.
pub fn encode(samples: &[f32], format: SampleFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * format.bytes_per_sample());
    match format {
        SampleFormat::Int16 => {
            for &s in samples {
                out.extend_from_slice(&f32_to_i16(s).to_le_bytes());
            }
        }
        SampleFormat::Float32 => {
            for &s in samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
    }
    out
}

/// Decode little-endian bytes back to `f32` samples. A trailing partial
/// sample is ignored.
pub fn decode(data: &[u8], format: SampleFormat) -> Vec<f32> {
    match format {
        SampleFormat::Int16 => data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect(),
        SampleFormat::Float32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    }
}

/// Decode to 16-bit samples, clipping float input to `[-1.0, 1.0]`.
pub fn to_pcm16(data: &[u8], format: SampleFormat) -> Vec<i16> {
    match format {
        SampleFormat::Int16 => data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect(),
        SampleFormat::Float32 => decode(data, format).into_iter().map(f32_to_i16).collect(),
    }
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Streaming mono resampler covering one synthesis run.
///
/// Input is regrouped into the resampler's fixed block size, so the way an
/// engine splits its output never changes the result. The filter delay is
/// trimmed from the front and [`finish`](Self::finish) recovers the tail.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    source_rate: u32,
    target_rate: u32,
    pending: Vec<f32>,
    delay: usize,
    consumed: u64,
    produced: u64,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self, AudioError> {
        if source_rate == 0 || target_rate == 0 {
            return Err(AudioError::InvalidRate(source_rate.min(target_rate)));
        }

        let inner = if source_rate == target_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    source_rate as usize,
                    target_rate as usize,
                    RESAMPLE_CHUNK,
                    2,
                    1,
                )
                .map_err(resample_error)?,
            )
        };
        let delay = inner.as_ref().map_or(0, |r| r.output_delay());

        Ok(Self {
            inner,
            source_rate,
            target_rate,
            pending: Vec::new(),
            delay,
            consumed: 0,
            produced: 0,
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    /// Feed `samples`, returning every output frame that is ready.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        self.consumed += samples.len() as u64;
        let Some(resampler) = self.inner.as_mut() else {
            self.produced += samples.len() as u64;
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();
        let mut start = 0;
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() - start < needed {
                break;
            }
            let block = resampler
                .process(&[&self.pending[start..start + needed]], None)
                .map_err(resample_error)?;
            trim_delay(&mut self.delay, block, &mut output);
            start += needed;
        }
        self.pending.drain(..start);

        self.produced += output.len() as u64;
        Ok(output)
    }

    /// Flush buffered input and the filter tail. The total output of the
    /// run then matches the input length scaled by the rate ratio. The
    /// resampler is ready for a new stream afterwards.
    pub fn finish(&mut self) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.inner.as_mut() else {
            self.consumed = 0;
            self.produced = 0;
            return Ok(Vec::new());
        };

        let expected = (self.consumed as f64 * self.target_rate as f64 / self.source_rate as f64)
            .round() as u64;
        let wanted = expected.saturating_sub(self.produced) as usize;

        let mut output = Vec::with_capacity(wanted);
        if !self.pending.is_empty() {
            let wave = [self.pending.as_slice()];
            let block = resampler
                .process_partial(Some(&wave[..]), None)
                .map_err(resample_error)?;
            trim_delay(&mut self.delay, block, &mut output);
            self.pending.clear();
        }
        while output.len() < wanted {
            let block = resampler
                .process_partial(None::<&[&[f32]]>, None)
                .map_err(resample_error)?;
            if block.first().map_or(true, Vec::is_empty) {
                break;
            }
            trim_delay(&mut self.delay, block, &mut output);
        }
        output.truncate(wanted);

        resampler.reset();
        self.delay = resampler.output_delay();
        self.consumed = 0;
        self.produced = 0;
        Ok(output)
    }
}

impl std::fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResampler")
            .field("source_rate", &self.source_rate)
            .field("target_rate", &self.target_rate)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Append the first channel of `block`, dropping whatever is left of the
/// resampler's output delay.
fn trim_delay(delay: &mut usize, block: Vec<Vec<f32>>, output: &mut Vec<f32>) {
    if let Some(channel) = block.into_iter().next() {
        let skip = (*delay).min(channel.len());
        *delay -= skip;
        output.extend_from_slice(&channel[skip..]);
    }
}

fn resample_error(e: impl std::fmt::Display) -> AudioError {
    AudioError::Resample(e.to_string())
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio resampling failed: {0}")]
    Resample(String),

    #[error("invalid sample rate: {0}")]
    InvalidRate(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_differ_by_voice_conversion() {
        let standard = AudioFormat::for_voice_conversion(false);
        assert_eq!(standard.sample_format, SampleFormat::Int16);
        assert_eq!(standard.sample_rate, 24_000);

        let converted = AudioFormat::for_voice_conversion(true);
        assert_eq!(converted.sample_format, SampleFormat::Float32);
        assert_eq!(converted.sample_rate, 40_000);
    }

    #[test]
    fn int16_encoding_clamps() {
        let bytes = encode(&[0.0, 1.0, -1.0, 2.0], SampleFormat::Int16);
        assert_eq!(bytes.len(), 8);
        let pcm = to_pcm16(&bytes, SampleFormat::Int16);
        assert_eq!(pcm, vec![0, i16::MAX, -i16::MAX, i16::MAX]);
    }

    #[test]
    fn float_to_pcm16_conversion() {
        let bytes = encode(&[0.5, -0.5, 3.0], SampleFormat::Float32);
        assert_eq!(bytes.len(), 12);
        let pcm = to_pcm16(&bytes, SampleFormat::Float32);
        assert_eq!(pcm, vec![16383, -16383, i16::MAX]);
    }

    #[test]
    fn chunk_from_samples_uses_the_profile_encoding() {
        let chunk = AudioChunk::from_samples(&[0.1, 0.2, 0.3], AudioFormat::standard());
        assert_eq!(chunk.len(), 6);
        let chunk = AudioChunk::from_samples(&[0.1, 0.2, 0.3], AudioFormat::converted());
        assert_eq!(chunk.len(), 12);
    }

    fn resample_all(samples: &[f32], from: u32, to: u32, piece: usize) -> Vec<f32> {
        let mut resampler = StreamResampler::new(from, to).unwrap();
        let mut out = Vec::new();
        for part in samples.chunks(piece) {
            out.extend(resampler.process(part).unwrap());
        }
        out.extend(resampler.finish().unwrap());
        out
    }

    #[test]
    fn same_rate_passes_through() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_all(&samples, 24_000, 24_000, 2), samples);
    }

    #[test]
    fn resampling_scales_length() {
        let samples = vec![0.25f32; 24_000];
        assert_eq!(resample_all(&samples, 24_000, 40_000, 4096).len(), 40_000);
        assert_eq!(resample_all(&samples[..2205], 22_050, 24_000, 2205).len(), 2400);
    }

    #[test]
    fn output_starts_without_filter_delay() {
        let out = resample_all(&[0.5; 2205], 22_050, 24_000, 2205);
        assert_eq!(out.len(), 2400);

        let head = &out[..400];
        let mean = head.iter().sum::<f32>() / head.len() as f32;
        assert!(mean > 0.4, "leading samples average {mean}");
        assert!(
            out[200..2200].iter().all(|s| (s - 0.5).abs() < 0.05),
            "steady state drifts from the input level"
        );
    }

    #[test]
    fn engine_chunking_does_not_change_output() {
        let samples: Vec<f32> = (0..5000)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();
        let whole = resample_all(&samples, 22_050, 40_000, samples.len());
        let pieces = resample_all(&samples, 22_050, 40_000, 333);
        assert_eq!(whole, pieces);
    }

    #[test]
    fn finish_resets_for_the_next_stream() {
        let mut resampler = StreamResampler::new(24_000, 40_000).unwrap();
        let mut first = resampler.process(&[0.2; 3000]).unwrap();
        first.extend(resampler.finish().unwrap());
        let mut second = resampler.process(&[0.2; 3000]).unwrap();
        second.extend(resampler.finish().unwrap());
        assert_eq!(first.len(), 5000);
        assert_eq!(first, second);
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            StreamResampler::new(0, 24_000),
            Err(AudioError::InvalidRate(0))
        ));
    }
}
