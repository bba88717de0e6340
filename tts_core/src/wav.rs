//! In-memory WAV capture of played audio.
use std::io::Cursor;

use crate::audio::{to_pcm16, AudioFormat};

/// Append-only 16-bit PCM accumulator, written out as a WAV file.
///
/// Chunks in float32 are clipped and converted to 16-bit on append. The
/// WAV container is produced once, by [`CaptureBuffer::finalize`].
#[derive(Debug)]
pub struct CaptureBuffer {
    samples: Vec<i16>,
    format: AudioFormat,
}

impl CaptureBuffer {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            samples: Vec::new(),
            format,
        }
    }

    /// Append one chunk encoded in this buffer's format.
    pub fn append(&mut self, chunk: &[u8]) {
        self.samples.extend(to_pcm16(chunk, self.format.sample_format));
    }

    /// Number of 16-bit samples captured so far.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Write the complete WAV file.
    pub fn finalize(self) -> Result<Vec<u8>, hound::Error> {
        let spec = hound::WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::with_capacity(44 + self.samples.len() * 2));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for sample in self.samples {
                writer.write_sample(sample)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{encode, SampleFormat};

    #[test]
    fn empty_capture_is_a_valid_wav() {
        let capture = CaptureBuffer::new(AudioFormat::standard());
        let wav = capture.finalize().unwrap();
        assert_eq!(wav.len(), 44);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.len(), 0);
        assert_eq!(reader.spec().sample_rate, 24_000);
    }

    #[test]
    fn float_chunks_are_stored_as_pcm16() {
        let mut capture = CaptureBuffer::new(AudioFormat::converted());
        capture.append(&encode(&[0.5, -1.0, 2.0], SampleFormat::Float32));
        assert_eq!(capture.sample_count(), 3);

        let wav = capture.finalize().unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(spec.sample_rate, 40_000);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![16383, -i16::MAX, i16::MAX]);
    }
}
