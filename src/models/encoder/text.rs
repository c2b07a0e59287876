//! Text encoder producing the prior distribution over latent frames
//!
//! Token ids are embedded, run through the relative-position transformer and
//! projected to per-token mean / log-std of the prior.

use crate::models::attention::Encoder;
use crate::models::commons::channel_mask;
use crate::models::layers::{Conv1d, ConvSpec};
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{init, Embedding, Module, VarBuilder};

/// Text encoder hyper-parameters
#[derive(Debug, Clone)]
pub struct TextEncoderConfig {
    pub n_vocab: usize,
    pub out_channels: usize,
    pub hidden_channels: usize,
    pub filter_channels: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub kernel_size: usize,
    pub p_dropout: f32,
    pub window_size: Option<usize>,
}

pub struct TextEncoder {
    config: TextEncoderConfig,
    emb: Embedding,
    encoder: Encoder,
    proj: Conv1d,
}

impl TextEncoder {
    pub fn new(config: TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_channels;
        let emb_weight = vb.get_with_hints(
            (config.n_vocab, h),
            "emb.weight",
            init::Init::Randn {
                mean: 0.0,
                stdev: (h as f64).powf(-0.5),
            },
        )?;
        let encoder = Encoder::new(
            h,
            config.filter_channels,
            config.n_heads,
            config.n_layers,
            config.kernel_size,
            config.p_dropout,
            config.window_size,
            vb.pp("encoder"),
        )?;
        let proj = Conv1d::new(h, 2 * config.out_channels, 1, ConvSpec::default(), vb.pp("proj"))?;

        Ok(Self {
            emb: Embedding::new(emb_weight, h),
            encoder,
            proj,
            config,
        })
    }

    /// * `tokens` - `[b, t]` u32 symbol ids
    /// * `lengths` - `[b]` valid token counts
    ///
    /// Returns `(x, m_p, logs_p, x_mask)` with `x: [b, hidden, t]`,
    /// `m_p, logs_p: [b, out, t]`, `x_mask: [b, 1, t]`.
    pub fn forward(&self, tokens: &Tensor, lengths: &Tensor, train: bool) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let (_b, t) = tokens.dims2()?;
        let scale = (self.config.hidden_channels as f64).sqrt();

        // [b, t, h] -> [b, h, t]
        let x = (self.emb.forward(tokens)? * scale)?;
        let x = x.transpose(1, 2)?.contiguous()?;
        let x_mask = channel_mask(lengths, t)?;

        let x = self.encoder.forward(&x, &x_mask, train)?;
        let stats = self.proj.forward(&x)?.broadcast_mul(&x_mask)?;

        let out = self.config.out_channels;
        let m_p = stats.narrow(1, 0, out)?;
        let logs_p = stats.narrow(1, out, out)?;
        Ok((x, m_p, logs_p, x_mask))
    }

    pub fn config(&self) -> &TextEncoderConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::commons::lengths_tensor;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> TextEncoderConfig {
        TextEncoderConfig {
            n_vocab: 40,
            out_channels: 6,
            hidden_channels: 16,
            filter_channels: 32,
            n_heads: 2,
            n_layers: 2,
            kernel_size: 3,
            p_dropout: 0.1,
            window_size: Some(4),
        }
    }

    #[test]
    fn test_text_encoder_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = TextEncoder::new(small_config(), vb).unwrap();

        let tokens = Tensor::new(&[[1u32, 5, 9, 2, 7], [3, 3, 8, 0, 0]], &device).unwrap();
        let lengths = lengths_tensor(&[5, 3], &device).unwrap();
        let (x, m_p, logs_p, x_mask) = enc.forward(&tokens, &lengths, false).unwrap();

        assert_eq!(x.dims3().unwrap(), (2, 16, 5));
        assert_eq!(m_p.dims3().unwrap(), (2, 6, 5));
        assert_eq!(logs_p.dims3().unwrap(), (2, 6, 5));
        assert_eq!(x_mask.dims3().unwrap(), (2, 1, 5));

        let masked: f32 = m_p
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(2, 3, 2)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(masked, 0.0);
    }

    #[test]
    fn test_text_encoder_rejects_out_of_vocab() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = TextEncoder::new(small_config(), vb).unwrap();

        let tokens = Tensor::new(&[[1u32, 400]], &device).unwrap();
        let lengths = lengths_tensor(&[2], &device).unwrap();
        assert!(enc.forward(&tokens, &lengths, false).is_err());
    }
}
