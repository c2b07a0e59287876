//! Audio processing modules
//!
//! - WAV loading with mono mixdown
//! - Sample rate conversion
//! - Linear spectrogram for the posterior encoder
//! - WAV saving

mod loader;
mod output;
mod resampler;
mod spectrogram;

pub use loader::AudioLoader;
pub use output::AudioOutput;
pub use resampler::Resampler;
pub use spectrogram::LinearSpectrogram;
