//! Waveform decoder

mod hifigan;

pub use hifigan::{HiFiGan, HiFiGanConfig};
