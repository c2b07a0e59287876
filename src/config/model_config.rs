//! Model configuration types matching the VITS config.json / config.yaml structure

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VitsConfig {
    /// Training-time settings (segment size, loss weights)
    #[serde(default)]
    pub train: TrainConfig,

    /// Audio / dataset configuration
    pub data: DataConfig,

    /// Generator hyper-parameters
    pub model: ModelHyperParams,

    /// Default synthesis controls
    #[serde(default)]
    pub inference: InferenceDefaults,
}

impl Default for VitsConfig {
    fn default() -> Self {
        Self {
            train: TrainConfig::default(),
            data: DataConfig {
                n_speakers: 109,
                ..DataConfig::default()
            },
            model: ModelHyperParams::default(),
            inference: InferenceDefaults::default(),
        }
    }
}

impl VitsConfig {
    /// Load configuration from a JSON (`.json`) or YAML (anything else) file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let is_json = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&content).with_context(|| "Failed to parse config JSON")?
        } else {
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config YAML")?
        };

        config
            .validate()
            .with_context(|| format!("Invalid config {:?}", path))?;
        Ok(config)
    }

    /// Check the invariants the model construction relies on
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        if m.n_heads == 0 || m.hidden_channels % m.n_heads != 0 {
            anyhow::bail!(
                "hidden_channels ({}) must be divisible by n_heads ({})",
                m.hidden_channels,
                m.n_heads
            );
        }
        if m.inter_channels % 2 != 0 {
            anyhow::bail!("inter_channels ({}) must be even", m.inter_channels);
        }
        if m.upsample_rates.len() != m.upsample_kernel_sizes.len() {
            anyhow::bail!(
                "upsample_rates ({}) and upsample_kernel_sizes ({}) differ in length",
                m.upsample_rates.len(),
                m.upsample_kernel_sizes.len()
            );
        }
        if m.resblock_kernel_sizes.is_empty()
            || m.resblock_kernel_sizes.len() != m.resblock_dilation_sizes.len()
        {
            anyhow::bail!("resblock_kernel_sizes and resblock_dilation_sizes must be non-empty and of equal length");
        }
        if m.resblock != "1" && m.resblock != "2" {
            anyhow::bail!("resblock must be \"1\" or \"2\", got {:?}", m.resblock);
        }
        let upsample: usize = m.upsample_rates.iter().product();
        if upsample != self.data.hop_length {
            anyhow::bail!(
                "product of upsample_rates ({}) must equal hop_length ({})",
                upsample,
                self.data.hop_length
            );
        }
        if self.segment_frames() == 0 {
            anyhow::bail!("train.segment_size must be at least one hop");
        }
        Ok(())
    }

    /// Number of linear spectrogram bins (`filter_length / 2 + 1`)
    pub fn spec_channels(&self) -> usize {
        self.data.filter_length / 2 + 1
    }

    /// Decoder training window in spectrogram frames
    pub fn segment_frames(&self) -> usize {
        self.train.segment_size / self.data.hop_length.max(1)
    }

    /// Number of speakers (0 = single speaker, no speaker embedding)
    pub fn n_speakers(&self) -> usize {
        self.data.n_speakers
    }
}

/// Training configuration (only the fields the generator consumes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Decoder window in samples
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    /// KL divergence loss weight
    #[serde(default = "default_c_kl")]
    pub c_kl: f64,
}

fn default_segment_size() -> usize {
    8192
}

fn default_c_kl() -> f64 {
    1.0
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            c_kl: default_c_kl(),
        }
    }
}

/// Audio / dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Text cleaner names (informational; the built-in cleaner is used)
    #[serde(default)]
    pub text_cleaners: Vec<String>,

    /// Audio sample rate
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,

    /// FFT size
    #[serde(default = "default_filter_length")]
    pub filter_length: usize,

    /// Hop length between frames
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,

    /// Window length
    #[serde(default = "default_filter_length")]
    pub win_length: usize,

    /// Interleave a blank token between symbols
    #[serde(default = "default_true")]
    pub add_blank: bool,

    /// Number of speakers (0 = single speaker)
    #[serde(default)]
    pub n_speakers: usize,
}

fn default_sampling_rate() -> u32 {
    22050
}

fn default_filter_length() -> usize {
    1024
}

fn default_hop_length() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            text_cleaners: vec!["basic_cleaners".to_string()],
            sampling_rate: default_sampling_rate(),
            filter_length: default_filter_length(),
            hop_length: default_hop_length(),
            win_length: default_filter_length(),
            add_blank: true,
            n_speakers: 0,
        }
    }
}

/// Generator hyper-parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelHyperParams {
    /// Latent (z) channels
    pub inter_channels: usize,
    /// Hidden channels of the encoders and flows
    pub hidden_channels: usize,
    /// FFN hidden channels in the text encoder
    pub filter_channels: usize,
    /// Attention heads in the text encoder
    pub n_heads: usize,
    /// Transformer layers in the text encoder
    pub n_layers: usize,
    /// FFN kernel size in the text encoder
    pub kernel_size: usize,
    /// Dropout used while training
    pub p_dropout: f32,
    /// Relative attention window (None disables relative positions)
    pub window_size: Option<usize>,
    /// HiFi-GAN residual block type ("1" or "2")
    pub resblock: String,
    pub resblock_kernel_sizes: Vec<usize>,
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    pub upsample_rates: Vec<usize>,
    pub upsample_initial_channel: usize,
    pub upsample_kernel_sizes: Vec<usize>,
    /// Speaker embedding size
    pub gin_channels: usize,
    /// Use the stochastic (flow-based) duration predictor
    pub use_sdp: bool,
    /// Posterior encoder WaveNet: kernel, dilation rate, layers
    pub posterior_kernel_size: usize,
    pub posterior_dilation_rate: usize,
    pub posterior_layers: usize,
    /// Flow WaveNet: kernel, dilation rate, layers, coupling count
    pub flow_kernel_size: usize,
    pub flow_dilation_rate: usize,
    pub flow_layers: usize,
    pub n_flows: usize,
    /// Duration predictor filter channels, kernel, dropout, flows
    pub duration_filter_channels: usize,
    pub duration_kernel_size: usize,
    pub duration_p_dropout: f32,
    pub duration_n_flows: usize,
}

impl Default for ModelHyperParams {
    fn default() -> Self {
        Self {
            inter_channels: 192,
            hidden_channels: 192,
            filter_channels: 768,
            n_heads: 2,
            n_layers: 6,
            kernel_size: 3,
            p_dropout: 0.1,
            window_size: Some(4),
            resblock: "1".to_string(),
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]],
            upsample_rates: vec![8, 8, 2, 2],
            upsample_initial_channel: 512,
            upsample_kernel_sizes: vec![16, 16, 4, 4],
            gin_channels: 256,
            use_sdp: true,
            posterior_kernel_size: 5,
            posterior_dilation_rate: 1,
            posterior_layers: 16,
            flow_kernel_size: 5,
            flow_dilation_rate: 1,
            flow_layers: 4,
            n_flows: 4,
            duration_filter_channels: 192,
            duration_kernel_size: 3,
            duration_p_dropout: 0.5,
            duration_n_flows: 4,
        }
    }
}

/// Default synthesis controls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceDefaults {
    /// Prior sampling temperature
    pub noise_scale: f64,
    /// Stochastic duration predictor noise
    pub noise_scale_w: f64,
    /// Speaking-rate multiplier (>1 is slower)
    pub length_scale: f64,
}

impl Default for InferenceDefaults {
    fn default() -> Self {
        Self {
            noise_scale: 0.667,
            noise_scale_w: 0.8,
            length_scale: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VitsConfig::default();
        config.validate().unwrap();
        assert_eq!(config.spec_channels(), 513);
        assert_eq!(config.segment_frames(), 32);
        assert_eq!(config.n_speakers(), 109);
    }

    #[test]
    fn test_config_parse_json() {
        let json = r#"{
  "train": {"segment_size": 8192, "c_kl": 1.0, "learning_rate": 2e-4},
  "data": {
    "text_cleaners": ["english_cleaners2"],
    "max_wav_value": 32768.0,
    "sampling_rate": 22050,
    "filter_length": 1024,
    "hop_length": 256,
    "win_length": 1024,
    "add_blank": true,
    "n_speakers": 109
  },
  "model": {
    "inter_channels": 192,
    "hidden_channels": 192,
    "filter_channels": 768,
    "n_heads": 2,
    "n_layers": 6,
    "kernel_size": 3,
    "p_dropout": 0.1,
    "resblock": "1",
    "resblock_kernel_sizes": [3, 7, 11],
    "resblock_dilation_sizes": [[1, 3, 5], [1, 3, 5], [1, 3, 5]],
    "upsample_rates": [8, 8, 2, 2],
    "upsample_initial_channel": 512,
    "upsample_kernel_sizes": [16, 16, 4, 4],
    "n_layers_q": 3,
    "use_spectral_norm": false,
    "gin_channels": 256
  }
}"#;
        let config: VitsConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.n_speakers(), 109);
        assert_eq!(config.model.window_size, Some(4));
        assert!(config.model.use_sdp);
        assert!((config.inference.noise_scale - 0.667).abs() < 1e-9);
    }

    #[test]
    fn test_config_parse_yaml_single_speaker() {
        let yaml = r#"
data:
    sampling_rate: 22050
    filter_length: 1024
    hop_length: 256
    win_length: 1024
model:
    gin_channels: 0
    use_sdp: false
inference:
    noise_scale: 0.5
"#;
        let config: VitsConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.n_speakers(), 0);
        assert!(!config.model.use_sdp);
        assert_eq!(config.inference.noise_scale, 0.5);
        assert_eq!(config.inference.length_scale, 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        let mut config = VitsConfig::default();
        config.model.n_heads = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_hop_mismatch() {
        let mut config = VitsConfig::default();
        config.data.hop_length = 300;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hop_length"));
    }
}
