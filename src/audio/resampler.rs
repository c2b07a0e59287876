//! Sample rate conversion using rubato sinc interpolation

use anyhow::{Context, Result};
use rubato::{
    calculate_cutoff, Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

/// Input frames fed to rubato per call
const CHUNK_SIZE: usize = 1024;

/// Mono resampler
pub struct Resampler;

impl Resampler {
    /// Resample mono `samples` from `from_sr` to `to_sr`
    pub fn resample(samples: &[f32], from_sr: u32, to_sr: u32) -> Result<Vec<f32>> {
        if from_sr == to_sr || samples.is_empty() {
            return Ok(samples.to_vec());
        }
        if from_sr == 0 || to_sr == 0 {
            anyhow::bail!("sample rates must be positive ({} -> {})", from_sr, to_sr);
        }

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Quadratic,
            oversampling_factor: 256,
            window,
        };

        let ratio = to_sr as f64 / from_sr as f64;
        let chunk = CHUNK_SIZE.min(samples.len());
        let mut resampler = SincFixedIn::<f32>::new(ratio, 1.1, params, chunk, 1)
            .context("Failed to create resampler")?;

        let expected_len = (samples.len() as f64 * ratio).round() as usize;
        let mut output = Vec::with_capacity(expected_len + chunk);

        let mut pos = 0;
        while pos + chunk <= samples.len() {
            let input: [&[f32]; 1] = [&samples[pos..pos + chunk]];
            let block = resampler
                .process(&input[..], None)
                .context("Resampling failed")?;
            output.extend(block.into_iter().next().unwrap_or_default());
            pos += chunk;
        }
        if pos < samples.len() {
            let input: [&[f32]; 1] = [&samples[pos..]];
            let block = resampler
                .process_partial(Some(&input[..]), None)
                .context("Resampling tail failed")?;
            output.extend(block.into_iter().next().unwrap_or_default());
        }

        // Flush the filter delay, then trim to the nominal length
        let delay = resampler.output_delay();
        while output.len() < expected_len + delay {
            let block = resampler
                .process_partial::<&[f32]>(None, None)
                .context("Resampling flush failed")?;
            match block.into_iter().next() {
                Some(tail) if !tail.is_empty() => output.extend(tail),
                _ => break,
            }
        }
        let end = (delay + expected_len).min(output.len());
        Ok(output[delay.min(end)..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_is_identity() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(Resampler::resample(&samples, 22050, 22050).unwrap(), samples);
    }

    #[test]
    fn test_resampled_length() {
        let samples: Vec<f32> = (0..44100).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        let out = Resampler::resample(&samples, 44100, 22050).unwrap();
        assert!((out.len() as i64 - 22050).abs() <= 2, "got {}", out.len());

        let out = Resampler::resample(&samples[..3000], 16000, 22050).unwrap();
        assert!((out.len() as i64 - 4134).abs() <= 2, "got {}", out.len());
    }
}
