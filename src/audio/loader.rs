//! WAV loading via hound

use anyhow::{Context, Result};
use std::path::Path;

/// Audio loader for PCM and float WAV files
pub struct AudioLoader;

impl AudioLoader {
    /// Load a WAV file as mono f32 in `[-1, 1]` at `target_sr`
    ///
    /// Multi-channel input is averaged; other rates are resampled.
    pub fn load_wav<P: AsRef<Path>>(path: P, target_sr: u32) -> Result<(Vec<f32>, u32)> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file: {:?}", path))?;

        let spec = reader.spec();
        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("Corrupt WAV data in {:?}", path))?,
            hound::SampleFormat::Int => {
                let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max_value))
                    .collect::<std::result::Result<_, _>>()
                    .with_context(|| format!("Corrupt WAV data in {:?}", path))?
            }
        };

        let mono = Self::mixdown(samples, spec.channels as usize);
        tracing::debug!(
            "Loaded {:?}: {} samples at {} Hz, {} channel(s)",
            path,
            mono.len(),
            spec.sample_rate,
            spec.channels
        );
        Self::from_samples(mono, spec.sample_rate, target_sr)
    }

    /// Resample in-memory mono samples to `target_sr`
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, target_sr: u32) -> Result<(Vec<f32>, u32)> {
        if sample_rate != target_sr {
            let resampled = super::Resampler::resample(&samples, sample_rate, target_sr)?;
            Ok((resampled, target_sr))
        } else {
            Ok((samples, sample_rate))
        }
    }

    /// Average interleaved channels
    fn mixdown(samples: Vec<f32>, channels: usize) -> Vec<f32> {
        if channels <= 1 {
            return samples;
        }
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioOutput;

    #[test]
    fn test_mixdown() {
        assert_eq!(AudioLoader::mixdown(vec![1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(AudioLoader::mixdown(vec![0.25], 1), vec![0.25]);
    }

    #[test]
    fn test_load_saved_wav() {
        let path = std::env::temp_dir().join("sdkwork_vits_loader_test.wav");
        let samples: Vec<f32> = (0..800).map(|i| ((i % 50) as f32 / 50.0) - 0.5).collect();
        AudioOutput::save(&samples, 16000, &path).unwrap();

        let (loaded, sr) = AudioLoader::load_wav(&path, 16000).unwrap();
        assert_eq!(sr, 16000);
        assert_eq!(loaded.len(), samples.len());
        for (a, b) in loaded.iter().zip(samples.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AudioLoader::load_wav("/nonexistent/input.wav", 22050).is_err());
    }
}
