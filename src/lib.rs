//! # SDKWork-VITS - End-to-end VITS text-to-speech
//!
//! A candle implementation of the VITS generator: conditional VAE with a
//! normalizing-flow prior, monotonic alignment search, a stochastic duration
//! predictor and a HiFi-GAN decoder.
//!
//! ## Features
//!
//! - **Text-to-speech**: single- and multi-speaker checkpoints
//! - **Voice conversion**: re-decode a recording with another speaker embedding
//! - **Training pass**: generator forward with alignment search and KL/duration losses
//! - **GPU Acceleration**: CUDA and Metal support via Candle
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sdkwork_vits::{InferenceConfig, Vits};
//!
//! let mut vits = Vits::new("checkpoints/ljs_base.json", InferenceConfig::default())?;
//! vits.load_weights("checkpoints/G.safetensors")?;
//! let audio = vits.synthesize("Hello, world!", None)?;
//! audio.save("output.wav")?;
//! ```
//!
//! ## Using the generator directly
//!
//! ```rust,ignore
//! use sdkwork_vits::models::{SamplingParams, VitsGenerator};
//!
//! let generator = VitsGenerator::load(&config, n_vocab, "G.safetensors", &device)?;
//! let out = generator.infer(&tokens, &lengths, None, SamplingParams::default())?;
//! ```

pub mod audio;
pub mod config;
pub mod core;
pub mod inference;
pub mod models;
pub mod text;

// Re-exports for convenience
pub use config::VitsConfig;
pub use core::{InferenceStage, Result, ResultExt, VitsError};
pub use inference::{InferenceConfig, InferenceResult, Vits};
pub use models::{SamplingParams, VitsGenerator};
pub use text::SymbolTable;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Framework name
pub const FRAMEWORK_NAME: &str = "SDKWork-VITS";

/// Default sample rate for output audio (22050 Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 22050;
