//! Inference module for text-to-speech synthesis
//!
//! - Vits: main inference pipeline (synthesis and voice conversion)
//! - InferenceConfig: runtime sampling configuration
//! - InferenceResult: generated audio

mod pipeline;

pub use pipeline::{InferenceConfig, InferenceResult, Vits};
