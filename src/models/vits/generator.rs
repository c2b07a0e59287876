//! VITS generator: text encoder, posterior encoder, flow, duration model and
//! HiFi-GAN decoder wired together for training, synthesis and voice
//! conversion.
//!
//! Weight loading from the generator checkpoint:
//! - `enc_p.*` text encoder
//! - `enc_q.*` posterior encoder
//! - `flow.*` residual coupling block
//! - `dp.*` duration predictor
//! - `dec.*` HiFi-GAN
//! - `emb_g.weight` speaker table (multi-speaker models only)

use crate::config::VitsConfig;
use crate::core::InferenceStage;
use crate::models::alignment::{attention_mask, log_likelihood_matrix, maximum_path};
use crate::models::commons::{channel_mask, generate_path, rand_slice_segments};
use crate::models::duration::{DurationModel, DurationPredictor, StochasticDurationPredictor};
use crate::models::encoder::{PosteriorEncoder, TextEncoder, TextEncoderConfig};
use crate::models::flow::ResidualCouplingBlock;
use crate::models::vocoder::{HiFiGan, HiFiGanConfig};
use crate::models::weights::{load_vits_weights, var_builder_from_weights};
use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{init, Embedding, Module, VarBuilder, VarMap};
use std::path::Path;

/// Everything the training step needs from one generator pass
#[derive(Debug)]
pub struct VitsTrainOutput {
    /// Decoded audio for the random segment `[b, 1, segment_frames * hop]`
    pub audio: Tensor,
    /// Per-item duration loss `[b]`, normalised by the total token count
    pub l_length: Tensor,
    /// Hard alignment `[b, 1, t_y, t_x]`
    pub attn: Tensor,
    /// Segment start frame per item
    pub ids_slice: Vec<usize>,
    pub x_mask: Tensor,
    pub y_mask: Tensor,
    pub z: Tensor,
    pub z_p: Tensor,
    /// Prior statistics expanded to frame rate `[b, inter, t_y]`
    pub m_p: Tensor,
    pub logs_p: Tensor,
    pub m_q: Tensor,
    pub logs_q: Tensor,
}

/// Result of text-to-speech sampling
#[derive(Debug)]
pub struct VitsInferOutput {
    /// `[b, 1, frames * hop]`
    pub audio: Tensor,
    pub attn: Tensor,
    pub y_mask: Tensor,
    pub z: Tensor,
    pub z_p: Tensor,
    pub m_p: Tensor,
    pub logs_p: Tensor,
}

/// Result of speaker conversion
#[derive(Debug)]
pub struct VoiceConversionOutput {
    pub audio: Tensor,
    pub y_mask: Tensor,
    pub z: Tensor,
    pub z_p: Tensor,
    pub z_hat: Tensor,
}

/// Sampling controls for [`VitsGenerator::infer`]
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub noise_scale: f64,
    pub length_scale: f64,
    pub noise_scale_w: f64,
    /// Truncate the decoded latent to this many frames
    pub max_len: Option<usize>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            noise_scale: 1.0,
            length_scale: 1.0,
            noise_scale_w: 1.0,
            max_len: None,
        }
    }
}

pub struct VitsGenerator {
    enc_p: TextEncoder,
    enc_q: PosteriorEncoder,
    dec: HiFiGan,
    flow: ResidualCouplingBlock,
    dp: DurationModel,
    emb_g: Option<Embedding>,
    segment_frames: usize,
    device: Device,
}

impl VitsGenerator {
    pub fn new(config: &VitsConfig, n_vocab: usize, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let m = &config.model;
        let n_speakers = config.n_speakers();
        // Conditioning layers only exist in multi-speaker checkpoints
        let gin = if n_speakers > 0 { m.gin_channels } else { 0 };

        let enc_p = TextEncoder::new(
            TextEncoderConfig {
                n_vocab,
                out_channels: m.inter_channels,
                hidden_channels: m.hidden_channels,
                filter_channels: m.filter_channels,
                n_heads: m.n_heads,
                n_layers: m.n_layers,
                kernel_size: m.kernel_size,
                p_dropout: m.p_dropout,
                window_size: m.window_size,
            },
            vb.pp("enc_p"),
        )?;
        let enc_q = PosteriorEncoder::new(
            config.spec_channels(),
            m.inter_channels,
            m.hidden_channels,
            m.posterior_kernel_size,
            m.posterior_dilation_rate,
            m.posterior_layers,
            gin,
            vb.pp("enc_q"),
        )?;
        let dec = HiFiGan::new(
            HiFiGanConfig {
                initial_channel: m.inter_channels,
                resblock: m.resblock.clone(),
                resblock_kernel_sizes: m.resblock_kernel_sizes.clone(),
                resblock_dilation_sizes: m.resblock_dilation_sizes.clone(),
                upsample_rates: m.upsample_rates.clone(),
                upsample_initial_channel: m.upsample_initial_channel,
                upsample_kernel_sizes: m.upsample_kernel_sizes.clone(),
                gin_channels: gin,
            },
            vb.pp("dec"),
        )?;
        let flow = ResidualCouplingBlock::new(
            m.inter_channels,
            m.hidden_channels,
            m.flow_kernel_size,
            m.flow_dilation_rate,
            m.flow_layers,
            m.n_flows,
            gin,
            vb.pp("flow"),
        )?;
        let dp = if m.use_sdp {
            DurationModel::Stochastic(StochasticDurationPredictor::new(
                m.hidden_channels,
                m.duration_kernel_size,
                m.duration_p_dropout,
                m.duration_n_flows,
                gin,
                vb.pp("dp"),
            )?)
        } else {
            DurationModel::Deterministic(DurationPredictor::new(
                m.hidden_channels,
                m.duration_filter_channels,
                m.duration_kernel_size,
                m.duration_p_dropout,
                gin,
                vb.pp("dp"),
            )?)
        };

        let emb_g = if n_speakers > 0 {
            let weight = vb.get_with_hints(
                (n_speakers, m.gin_channels),
                "emb_g.weight",
                init::Init::Randn { mean: 0.0, stdev: 1.0 },
            )?;
            Some(Embedding::new(weight, m.gin_channels))
        } else {
            None
        };

        Ok(Self {
            enc_p,
            enc_q,
            dec,
            flow,
            dp,
            emb_g,
            segment_frames: config.segment_frames(),
            device: vb.device().clone(),
        })
    }

    /// Build with randomly initialised weights
    pub fn new_random(config: &VitsConfig, n_vocab: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Self::new(config, n_vocab, vb)
    }

    /// Load from a safetensors checkpoint, falling back to random weights
    /// when the file does not exist
    pub fn load<P: AsRef<Path>>(config: &VitsConfig, n_vocab: usize, path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("VITS weights not found at {:?}, using random", path);
            return Self::new_random(config, n_vocab, device);
        }
        let weights = load_vits_weights(path, device)?;
        let generator = Self::new(config, n_vocab, var_builder_from_weights(weights, device))?;
        tracing::info!("VITS weights loaded successfully");
        Ok(generator)
    }

    /// `[b] -> [b, gin, 1]` speaker conditioning
    fn speaker_embedding(&self, sid: Option<&Tensor>) -> Result<Option<Tensor>> {
        match (sid, &self.emb_g) {
            (Some(sid), Some(emb_g)) => {
                let sid = sid.to_dtype(DType::U32)?;
                Ok(Some(emb_g.forward(&sid)?.unsqueeze(2)?))
            }
            (Some(_), None) => anyhow::bail!("speaker id given to a single-speaker model"),
            (None, Some(_)) => anyhow::bail!("multi-speaker model requires a speaker id"),
            (None, None) => Ok(None),
        }
    }

    /// Frame-rate prior: `attn [b, 1, t_y, t_x]` applied to `stats [b, d, t_x]`
    fn expand_prior(attn: &Tensor, stats: &Tensor) -> Result<Tensor> {
        let attn = attn.squeeze(1)?.contiguous()?;
        let stats_t = stats.transpose(1, 2)?.contiguous()?;
        Ok(attn.matmul(&stats_t)?.transpose(1, 2)?.contiguous()?)
    }

    /// Training pass
    ///
    /// * `x` - `[b, t_x]` token ids, `x_lengths` - `[b]`
    /// * `y` - `[b, spec_channels, t_y]` linear spectrogram, `y_lengths` - `[b]`
    /// * `sid` - `[b]` speaker ids for multi-speaker models
    pub fn forward(
        &self,
        x: &Tensor,
        x_lengths: &Tensor,
        y: &Tensor,
        y_lengths: &Tensor,
        sid: Option<&Tensor>,
        train: bool,
    ) -> Result<VitsTrainOutput> {
        let (x_h, m_p, logs_p, x_mask) = self
            .enc_p
            .forward(x, x_lengths, train)
            .context(InferenceStage::TextEncoding)?;
        let g = self.speaker_embedding(sid)?;
        let g = g.as_ref();

        let (z, m_q, logs_q, y_mask) = self
            .enc_q
            .forward(y, y_lengths, g, train)
            .context(InferenceStage::PosteriorEncoding)?;
        let z_p = self.flow.forward(&z, &y_mask, g).context(InferenceStage::Flow)?;

        // Alignment search runs outside the gradient path
        let neg_cent = log_likelihood_matrix(&z_p.detach(), &m_p.detach(), &logs_p.detach())?;
        let attn_mask = attention_mask(&x_mask, &y_mask)?;
        let attn = maximum_path(&neg_cent, &attn_mask.squeeze(1)?)
            .context(InferenceStage::Alignment)?
            .unsqueeze(1)?
            .detach();

        let w = attn.sum(2)?;
        let l_length = self
            .dp
            .loss(&x_h, &x_mask, &w, g, train)
            .context(InferenceStage::DurationPrediction)?;
        let l_length = l_length.broadcast_div(&x_mask.sum_all()?)?;

        let m_p = Self::expand_prior(&attn, &m_p)?;
        let logs_p = Self::expand_prior(&attn, &logs_p)?;

        let y_len_host: Vec<u32> = y_lengths.to_dtype(DType::U32)?.to_vec1()?;
        let y_len_host: Vec<usize> = y_len_host.into_iter().map(|l| l as usize).collect();
        let (z_slice, ids_slice) = rand_slice_segments(&z, &y_len_host, self.segment_frames)?;
        let audio = self.dec.forward(&z_slice, g).context(InferenceStage::Decoding)?;

        Ok(VitsTrainOutput {
            audio,
            l_length,
            attn,
            ids_slice,
            x_mask,
            y_mask,
            z,
            z_p,
            m_p,
            logs_p,
            m_q,
            logs_q,
        })
    }

    /// Text-to-speech sampling
    pub fn infer(
        &self,
        x: &Tensor,
        x_lengths: &Tensor,
        sid: Option<&Tensor>,
        params: SamplingParams,
    ) -> Result<VitsInferOutput> {
        let (x_h, m_p, logs_p, x_mask) = self
            .enc_p
            .forward(x, x_lengths, false)
            .context(InferenceStage::TextEncoding)?;
        let g = self.speaker_embedding(sid)?;
        let g = g.as_ref();

        let logw = self
            .dp
            .predict(&x_h, &x_mask, g, params.noise_scale_w)
            .context(InferenceStage::DurationPrediction)?;
        let w = (logw.exp()?.broadcast_mul(&x_mask)? * params.length_scale)?;
        let w_ceil = w.ceil()?;

        // [b] frame counts, at least one frame per item
        let y_lengths = w_ceil.sum(2)?.sum(1)?.maximum(1.0)?;
        let y_len_host: Vec<f32> = y_lengths.to_vec1()?;
        let t_y = y_len_host.iter().fold(1f32, |acc, &v| acc.max(v)) as usize;
        tracing::debug!("Predicted {} frames for {} tokens", t_y, x.dim(1)?);

        let y_mask = channel_mask(&y_lengths, t_y)?;
        let attn_mask = attention_mask(&x_mask, &y_mask)?;
        let attn = generate_path(&w_ceil, &attn_mask).context(InferenceStage::Alignment)?;

        let m_p = Self::expand_prior(&attn, &m_p)?;
        let logs_p = Self::expand_prior(&attn, &logs_p)?;

        let eps = m_p.randn_like(0.0, 1.0)?;
        let z_p = (&m_p + ((eps * logs_p.exp()?)? * params.noise_scale)?)?;
        let z = self.flow.reverse(&z_p, &y_mask, g).context(InferenceStage::Flow)?;

        let z_dec = z.broadcast_mul(&y_mask)?;
        let z_dec = match params.max_len {
            Some(max_len) if max_len < t_y => z_dec.narrow(2, 0, max_len)?,
            _ => z_dec,
        };
        let audio = self.dec.forward(&z_dec, g).context(InferenceStage::Decoding)?;

        Ok(VitsInferOutput {
            audio,
            attn,
            y_mask,
            z,
            z_p,
            m_p,
            logs_p,
        })
    }

    /// Re-synthesise a spectrogram with another speaker's identity
    pub fn voice_conversion(
        &self,
        y: &Tensor,
        y_lengths: &Tensor,
        sid_src: &Tensor,
        sid_tgt: &Tensor,
    ) -> Result<VoiceConversionOutput> {
        if self.emb_g.is_none() {
            anyhow::bail!("voice conversion requires a multi-speaker model");
        }
        let g_src = self
            .speaker_embedding(Some(sid_src))?
            .ok_or_else(|| anyhow::anyhow!("missing source speaker embedding"))?;
        let g_tgt = self
            .speaker_embedding(Some(sid_tgt))?
            .ok_or_else(|| anyhow::anyhow!("missing target speaker embedding"))?;

        let (z, _m_q, _logs_q, y_mask) = self
            .enc_q
            .forward(y, y_lengths, Some(&g_src), false)
            .context(InferenceStage::PosteriorEncoding)?;
        let z_p = self
            .flow
            .forward(&z, &y_mask, Some(&g_src))
            .context(InferenceStage::Flow)?;
        let z_hat = self
            .flow
            .reverse(&z_p, &y_mask, Some(&g_tgt))
            .context(InferenceStage::Flow)?;
        let audio = self
            .dec
            .forward(&z_hat.broadcast_mul(&y_mask)?, Some(&g_tgt))
            .context(InferenceStage::Decoding)?;

        Ok(VoiceConversionOutput {
            audio,
            y_mask,
            z,
            z_p,
            z_hat,
        })
    }

    pub fn is_multi_speaker(&self) -> bool {
        self.emb_g.is_some()
    }

    pub fn hop_length(&self) -> usize {
        self.dec.upsample_factor()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
