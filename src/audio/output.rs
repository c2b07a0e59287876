//! WAV file saving

use anyhow::{Context, Result};
use std::path::Path;

/// Audio output handler
pub struct AudioOutput;

impl AudioOutput {
    /// Save mono samples in `[-1, 1]` as 16-bit PCM
    pub fn save<P: AsRef<Path>>(samples: &[f32], sample_rate: u32, path: P) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path.as_ref(), spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", path.as_ref()))?;

        for &sample in samples {
            let scaled = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(scaled)?;
        }

        writer.finalize()?;
        Ok(())
    }

    /// Save mono samples as 32-bit float
    pub fn save_float<P: AsRef<Path>>(samples: &[f32], sample_rate: u32, path: P) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        let mut writer = hound::WavWriter::create(path.as_ref(), spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", path.as_ref()))?;

        for &sample in samples {
            writer.write_sample(sample)?;
        }

        writer.finalize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_clamps_and_writes_header() {
        let path = std::env::temp_dir().join("sdkwork_vits_output_test.wav");
        AudioOutput::save(&[0.0, 1.5, -2.0], 22050, &path).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 22050);
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 32767, -32768]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_save_float() {
        let path = std::env::temp_dir().join("sdkwork_vits_output_float_test.wav");
        AudioOutput::save_float(&[0.25, -0.5], 16000, &path).unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<f32> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0.25, -0.5]);
        std::fs::remove_file(&path).ok();
    }
}
