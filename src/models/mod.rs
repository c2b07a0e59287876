//! Neural network models for VITS
//!
//! This module contains all the generator components:
//! - Shared layers (weight-normed convs, channel LayerNorm, WaveNet)
//! - Relative-position transformer text encoder
//! - Posterior encoder and residual coupling flow
//! - Stochastic and deterministic duration predictors
//! - Monotonic alignment search
//! - HiFi-GAN decoder
//! - The assembled generator and its losses

pub mod alignment;
pub mod attention;
pub mod commons;
pub mod duration;
pub mod encoder;
pub mod flow;
pub mod layers;
pub mod vits;
pub mod vocoder;
pub mod weights;

// Re-exports for convenient access
pub use encoder::{PosteriorEncoder, TextEncoder};
pub use flow::ResidualCouplingBlock;
pub use vits::{SamplingParams, VitsGenerator};
pub use vocoder::HiFiGan;
