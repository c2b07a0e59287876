//! Linear magnitude spectrogram
//!
//! Produces the posterior encoder input: reflect padding of
//! `(n_fft - hop) / 2` on each side, no centering, periodic Hann window
//! centred inside the FFT frame, and `sqrt(re² + im² + 1e-6)` magnitudes.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Linear spectrogram computer
pub struct LinearSpectrogram {
    /// FFT size
    pub n_fft: usize,
    /// Hop length between frames
    pub hop_length: usize,
    /// Window length
    pub win_length: usize,
    /// Hann window zero-padded to `n_fft`
    window: Vec<f32>,
    fft: Arc<dyn rustfft::Fft<f32>>,
}

impl LinearSpectrogram {
    pub fn new(n_fft: usize, hop_length: usize, win_length: usize) -> Result<Self> {
        if n_fft == 0 || hop_length == 0 || hop_length > n_fft {
            anyhow::bail!("invalid STFT geometry: n_fft {} hop {}", n_fft, hop_length);
        }
        if win_length == 0 || win_length > n_fft {
            anyhow::bail!("win_length {} must be in 1..={}", win_length, n_fft);
        }

        let mut window = vec![0.0f32; n_fft];
        let offset = (n_fft - win_length) / 2;
        for (i, w) in Self::hann_window(win_length).into_iter().enumerate() {
            window[offset + i] = w;
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);

        Ok(Self {
            n_fft,
            hop_length,
            win_length,
            window,
            fft,
        })
    }

    /// Number of frequency bins (`n_fft / 2 + 1`)
    pub fn n_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Frames produced for `audio_len` samples
    pub fn num_frames(&self, audio_len: usize) -> usize {
        let padded = audio_len + 2 * self.pad_len();
        if padded < self.n_fft {
            return 0;
        }
        (padded - self.n_fft) / self.hop_length + 1
    }

    fn pad_len(&self) -> usize {
        (self.n_fft - self.hop_length) / 2
    }

    /// Compute the spectrogram as `[n_bins][frames]`
    pub fn compute(&self, audio: &[f32]) -> Result<Vec<Vec<f32>>> {
        let pad = self.pad_len();
        if audio.len() <= pad {
            anyhow::bail!(
                "audio of {} samples is too short for reflect padding of {}",
                audio.len(),
                pad
            );
        }

        let padded = reflect_pad(audio, pad);
        let num_frames = self.num_frames(audio.len());
        let n_bins = self.n_bins();
        let mut spec = vec![vec![0.0f32; num_frames]; n_bins];

        let mut frame_buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        for frame in 0..num_frames {
            let start = frame * self.hop_length;
            for (j, slot) in frame_buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + j] * self.window[j], 0.0);
            }
            self.fft.process(&mut frame_buffer);

            for (bin, value) in frame_buffer[..n_bins].iter().enumerate() {
                spec[bin][frame] = (value.norm_sqr() + 1e-6).sqrt();
            }
        }
        Ok(spec)
    }

    /// Compute the spectrogram as a `[1, n_bins, frames]` tensor
    pub fn compute_tensor(&self, audio: &[f32], device: &Device) -> Result<Tensor> {
        let spec = self.compute(audio)?;
        let frames = spec.first().map(|row| row.len()).unwrap_or(0);
        let flat: Vec<f32> = spec.into_iter().flatten().collect();
        Ok(Tensor::from_vec(flat, (1, self.n_bins(), frames), device)?)
    }

    /// Periodic Hann window
    fn hann_window(size: usize) -> Vec<f32> {
        (0..size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / size as f32).cos()))
            .collect()
    }
}

/// Mirror `pad` samples at each end, excluding the edge sample
fn reflect_pad(audio: &[f32], pad: usize) -> Vec<f32> {
    let n = audio.len();
    let mut padded = Vec::with_capacity(n + 2 * pad);
    padded.extend((1..=pad).rev().map(|i| audio[i]));
    padded.extend_from_slice(audio);
    padded.extend((1..=pad).map(|i| audio[n - 1 - i]));
    padded
}
