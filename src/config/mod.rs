//! Configuration loading
//!
//! Mirrors the upstream VITS `config.json` layout (`train`, `data`, `model`)
//! and additionally accepts YAML.

mod model_config;

pub use model_config::{DataConfig, InferenceDefaults, ModelHyperParams, TrainConfig, VitsConfig};
