//! Main inference pipeline for VITS
//!
//! Orchestrates the components for synthesis and conversion:
//! 1. Text cleaning, symbol lookup and blank interspersing
//! 2. Prior sampling through the generator (text encoder, duration model, flow)
//! 3. Waveform generation via the HiFi-GAN decoder
//!
//! Voice conversion replaces step 1 with a linear spectrogram of the input
//! recording and re-decodes it with the target speaker embedding.

use candle_core::{DType, Device, Tensor};
use std::path::Path;

use crate::audio::{AudioLoader, AudioOutput, LinearSpectrogram};
use crate::config::{InferenceDefaults, VitsConfig};
use crate::core::{InferenceStage, Result, ResultExt, VitsError};
use crate::models::commons::lengths_tensor;
use crate::models::{SamplingParams, VitsGenerator};
use crate::text::{intersperse, SymbolTable};

/// Inference configuration
#[derive(Clone, Debug)]
pub struct InferenceConfig {
    /// Prior sampling temperature
    pub noise_scale: f64,
    /// Stochastic duration noise
    pub noise_scale_w: f64,
    /// Speaking-rate multiplier (>1 is slower)
    pub length_scale: f64,
    /// Cap on decoded frames
    pub max_len: Option<usize>,
    /// Whether to use GPU
    pub use_gpu: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            noise_scale: 0.667,
            noise_scale_w: 0.8,
            length_scale: 1.0,
            max_len: None,
            use_gpu: false,
        }
    }
}

impl InferenceConfig {
    /// Take the sampling controls from a model config's `inference` section
    pub fn from_defaults(defaults: &InferenceDefaults) -> Self {
        Self {
            noise_scale: defaults.noise_scale,
            noise_scale_w: defaults.noise_scale_w,
            length_scale: defaults.length_scale,
            ..Self::default()
        }
    }

    fn sampling(&self) -> SamplingParams {
        SamplingParams {
            noise_scale: self.noise_scale,
            length_scale: self.length_scale,
            noise_scale_w: self.noise_scale_w,
            max_len: self.max_len,
        }
    }
}

/// Result of inference
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Generated audio samples
    pub audio: Vec<f32>,
    /// Sample rate
    pub sample_rate: u32,
    /// Decoded latent frames
    pub frames: usize,
}

impl InferenceResult {
    /// Save audio to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        AudioOutput::save(&self.audio, self.sample_rate, path).map_err(|e| VitsError::Audio {
            message: format!("{:#}", e),
            path: Some(path.to_path_buf()),
        })
    }

    /// Get duration in seconds
    pub fn duration(&self) -> f32 {
        self.audio.len() as f32 / self.sample_rate as f32
    }
}

/// Main VITS inference pipeline
pub struct Vits {
    device: Device,
    config: VitsConfig,
    inference_config: InferenceConfig,
    symbols: SymbolTable,
    spectrogram: LinearSpectrogram,
    generator: VitsGenerator,
}

impl Vits {
    /// Create from a config file with randomly initialised weights;
    /// call [`Self::load_weights`] before synthesising real speech
    pub fn new<P: AsRef<Path>>(config_path: P, inference_config: InferenceConfig) -> Result<Self> {
        let path = config_path.as_ref();
        let config = VitsConfig::load(path).map_err(|e| VitsError::Config {
            message: format!("{:#}", e),
            path: Some(path.to_path_buf()),
        })?;
        Self::from_config(config, inference_config)
    }

    /// Create from an in-memory config
    pub fn from_config(config: VitsConfig, inference_config: InferenceConfig) -> Result<Self> {
        config.validate().map_err(|e| VitsError::Config {
            message: format!("{:#}", e),
            path: None,
        })?;

        let device = if inference_config.use_gpu {
            Device::cuda_if_available(0)?
        } else {
            Device::Cpu
        };

        let symbols = SymbolTable::default();
        let spectrogram = LinearSpectrogram::new(
            config.data.filter_length,
            config.data.hop_length,
            config.data.win_length,
        )
        .map_err(|e| VitsError::Config {
            message: format!("{:#}", e),
            path: None,
        })?;
        let generator = VitsGenerator::new_random(&config, symbols.len(), &device)
            .map_err(|e| VitsError::ModelLoad {
                message: format!("{:#}", e),
                component: "generator".to_string(),
                path: None,
            })?;

        tracing::info!(
            "VITS ready on {:?}: {} symbols, {} speaker(s), {} Hz",
            device,
            symbols.len(),
            config.n_speakers().max(1),
            config.data.sampling_rate
        );

        Ok(Self {
            device,
            config,
            inference_config,
            symbols,
            spectrogram,
            generator,
        })
    }

    /// Load generator weights from a safetensors checkpoint
    ///
    /// A missing file keeps random weights and logs a warning.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        tracing::info!("Loading VITS generator from {:?}...", path);
        self.generator = VitsGenerator::load(&self.config, self.symbols.len(), path, &self.device)
            .map_err(|e| VitsError::ModelLoad {
                message: format!("{:#}", e),
                component: "generator".to_string(),
                path: Some(path.to_path_buf()),
            })?;
        Ok(())
    }

    /// Text to symbol ids, with blanks when the model was trained with them
    pub fn text_to_ids(&self, text: &str) -> Result<Vec<u32>> {
        let ids = self
            .symbols
            .text_to_sequence(text, &self.config.data.text_cleaners);
        if ids.is_empty() {
            return Err(VitsError::Text {
                message: format!("no known symbols in {:?}", text),
            });
        }
        Ok(if self.config.data.add_blank {
            intersperse(&ids, 0)
        } else {
            ids
        })
    }

    fn speaker_tensor(&self, speaker_id: Option<u32>, field: &str) -> Result<Option<Tensor>> {
        let n_speakers = self.config.n_speakers();
        match speaker_id {
            None if n_speakers > 0 => Err(VitsError::validation(
                field,
                format!("model has {} speakers, a speaker id is required", n_speakers),
            )),
            None => Ok(None),
            Some(_) if n_speakers == 0 => Err(VitsError::validation(
                field,
                "single-speaker model does not take a speaker id",
            )),
            Some(id) if id as usize >= n_speakers => Err(VitsError::validation(
                field,
                format!("speaker id {} out of range (0..{})", id, n_speakers),
            )),
            Some(id) => Ok(Some(Tensor::new(&[id], &self.device)?)),
        }
    }

    /// Synthesize speech for `text`
    pub fn synthesize(&self, text: &str, speaker_id: Option<u32>) -> Result<InferenceResult> {
        let ids = self.text_to_ids(text)?;
        let sid = self.speaker_tensor(speaker_id, "speaker_id")?;
        tracing::debug!("Synthesizing {} symbols", ids.len());

        let x = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let x_lengths = lengths_tensor(&[ids.len()], &self.device).at_stage(InferenceStage::TextEncoding)?;

        let out = self
            .generator
            .infer(&x, &x_lengths, sid.as_ref(), self.inference_config.sampling())
            .map_err(|e| VitsError::staged(e, InferenceStage::TextProcessing))?;

        let audio: Vec<f32> = out
            .audio
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()
            .at_stage(InferenceStage::AudioOutput)?;
        let frames = audio.len() / self.generator.hop_length();

        let result = InferenceResult {
            audio,
            sample_rate: self.config.data.sampling_rate,
            frames,
        };
        tracing::info!("Synthesized {:.2}s of audio ({} frames)", result.duration(), frames);
        Ok(result)
    }

    /// Re-voice a WAV recording from `source_speaker` to `target_speaker`
    pub fn convert_voice<P: AsRef<Path>>(
        &self,
        wav_path: P,
        source_speaker: u32,
        target_speaker: u32,
    ) -> Result<InferenceResult> {
        let path = wav_path.as_ref();
        let sid_src = self
            .speaker_tensor(Some(source_speaker), "source_speaker")?
            .ok_or_else(|| VitsError::validation("source_speaker", "missing"))?;
        let sid_tgt = self
            .speaker_tensor(Some(target_speaker), "target_speaker")?
            .ok_or_else(|| VitsError::validation("target_speaker", "missing"))?;

        let audio_error = |e: anyhow::Error| VitsError::Audio {
            message: format!("{:#}", e),
            path: Some(path.to_path_buf()),
        };
        let (samples, _) = AudioLoader::load_wav(path, self.config.data.sampling_rate).map_err(audio_error)?;
        let spec = self
            .spectrogram
            .compute_tensor(&samples, &self.device)
            .map_err(audio_error)?;
        let frames = spec.dim(2)?;
        let y_lengths = lengths_tensor(&[frames], &self.device).context("frame lengths")?;

        let out = self
            .generator
            .voice_conversion(&spec, &y_lengths, &sid_src, &sid_tgt)
            .map_err(|e| VitsError::staged(e, InferenceStage::PosteriorEncoding))?;
        let audio: Vec<f32> = out
            .audio
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()
            .at_stage(InferenceStage::AudioOutput)?;

        let result = InferenceResult {
            audio,
            sample_rate: self.config.data.sampling_rate,
            frames,
        };
        tracing::info!(
            "Converted {:?} from speaker {} to {}: {:.2}s",
            path,
            source_speaker,
            target_speaker,
            result.duration()
        );
        Ok(result)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &VitsConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.data.sampling_rate
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn inference_config(&self) -> &InferenceConfig {
        &self.inference_config
    }

    /// Override the prior sampling temperature for later calls
    pub fn set_noise_scale(&mut self, noise_scale: f64) {
        self.inference_config.noise_scale = noise_scale;
    }

    /// Override the speaking-rate multiplier for later calls
    pub fn set_length_scale(&mut self, length_scale: f64) {
        self.inference_config.length_scale = length_scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vits::test_support::tiny_config;

    #[test]
    fn test_inference_config_defaults() {
        let config = InferenceConfig::default();
        assert_eq!(config.noise_scale, 0.667);
        assert_eq!(config.noise_scale_w, 0.8);
        assert_eq!(config.length_scale, 1.0);
        assert!(config.max_len.is_none());
        assert!(!config.use_gpu);
    }

    #[test]
    fn test_text_to_ids_intersperses_blanks() {
        let vits = Vits::from_config(tiny_config(0, true), InferenceConfig::default()).unwrap();
        let ids = vits.text_to_ids("ab").unwrap();
        let a = vits.symbols().id('a').unwrap();
        let b = vits.symbols().id('b').unwrap();
        assert_eq!(ids, vec![0, a, 0, b, 0]);
        assert!(matches!(vits.text_to_ids("123"), Err(VitsError::Text { .. })));
    }

    #[test]
    fn test_synthesize_with_random_weights() {
        let vits = Vits::from_config(tiny_config(0, true), InferenceConfig::default()).unwrap();
        let result = vits.synthesize("hello there", None).unwrap();
        assert_eq!(result.sample_rate, 22050);
        assert_eq!(result.audio.len(), result.frames * 8);
        assert!(result.frames > 0);
        assert!(result.audio.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_length_scale_override_stretches_output() {
        let config = InferenceConfig {
            noise_scale: 0.0,
            noise_scale_w: 0.0,
            ..Default::default()
        };
        let mut vits = Vits::from_config(tiny_config(0, true), config).unwrap();
        let base = vits.synthesize("stretch me", None).unwrap();

        vits.set_length_scale(3.0);
        vits.set_noise_scale(0.5);
        assert_eq!(vits.inference_config().length_scale, 3.0);
        assert_eq!(vits.inference_config().noise_scale, 0.5);
        let slow = vits.synthesize("stretch me", None).unwrap();
        assert!(slow.frames >= base.frames);
    }

    #[test]
    fn test_speaker_validation() {
        let vits = Vits::from_config(tiny_config(2, true), InferenceConfig::default()).unwrap();
        assert!(matches!(vits.synthesize("hi", None), Err(VitsError::Validation { .. })));
        assert!(matches!(vits.synthesize("hi", Some(2)), Err(VitsError::Validation { .. })));
        assert!(vits.synthesize("hi", Some(1)).is_ok());
    }

    #[test]
    fn test_convert_voice_roundtrip_through_wav() {
        let vits = Vits::from_config(tiny_config(3, true), InferenceConfig::default()).unwrap();
        let path = std::env::temp_dir().join("sdkwork_vits_convert_input.wav");
        let samples: Vec<f32> = (0..800).map(|i| (i as f32 * 0.05).sin() * 0.3).collect();
        AudioOutput::save(&samples, 22050, &path).unwrap();

        let result = vits.convert_voice(&path, 0, 2).unwrap();
        assert_eq!(result.frames, 100);
        assert_eq!(result.audio.len(), 800);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let err = Vits::new("/nonexistent/config.json", InferenceConfig::default()).err().unwrap();
        assert!(matches!(err, VitsError::Config { .. }));
    }
}
