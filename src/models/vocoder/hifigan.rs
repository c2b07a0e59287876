//! HiFi-GAN waveform decoder
//!
//! Upsamples latent frames straight to audio samples.
//!
//! Architecture:
//! - `conv_pre` (kernel 7) plus optional speaker conditioning `cond`
//! - per stage: leaky ReLU -> transposed conv -> mean of multi-kernel resblocks
//! - leaky ReLU -> `conv_post` (no bias) -> tanh
//!
//! Checkpoint keys: `conv_pre`, `ups.{i}`, `resblocks.{i * num_kernels + j}`,
//! `conv_post`, `cond`.

use crate::models::commons::{leaky_relu, LRELU_SLOPE};
use crate::models::layers::{get_padding, Conv1d, ConvSpec, ConvTranspose1d};
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

/// HiFi-GAN configuration
#[derive(Debug, Clone)]
pub struct HiFiGanConfig {
    /// Latent channels (input)
    pub initial_channel: usize,
    /// "1" (three dilated conv pairs) or "2" (two dilated convs)
    pub resblock: String,
    pub resblock_kernel_sizes: Vec<usize>,
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    pub upsample_rates: Vec<usize>,
    pub upsample_initial_channel: usize,
    pub upsample_kernel_sizes: Vec<usize>,
    /// Speaker embedding size, 0 disables conditioning
    pub gin_channels: usize,
}

impl Default for HiFiGanConfig {
    fn default() -> Self {
        Self {
            initial_channel: 192,
            resblock: "1".to_string(),
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]],
            upsample_rates: vec![8, 8, 2, 2],
            upsample_initial_channel: 512,
            upsample_kernel_sizes: vec![16, 16, 4, 4],
            gin_channels: 0,
        }
    }
}

/// Residual block with dilated/plain conv pairs
struct ResBlock1 {
    convs1: Vec<Conv1d>,
    convs2: Vec<Conv1d>,
}

impl ResBlock1 {
    fn new(channels: usize, kernel_size: usize, dilations: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::with_capacity(dilations.len());
        for (i, &dilation) in dilations.iter().enumerate() {
            convs1.push(Conv1d::new(
                channels,
                channels,
                kernel_size,
                ConvSpec::same(kernel_size, dilation),
                vb.pp(format!("convs1.{}", i)),
            )?);
            convs2.push(Conv1d::new(
                channels,
                channels,
                kernel_size,
                ConvSpec::same(kernel_size, 1),
                vb.pp(format!("convs2.{}", i)),
            )?);
        }
        Ok(Self { convs1, convs2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = x.clone();
        for (c1, c2) in self.convs1.iter().zip(&self.convs2) {
            let xt = leaky_relu(&out, LRELU_SLOPE)?;
            let xt = c1.forward(&xt)?;
            let xt = leaky_relu(&xt, LRELU_SLOPE)?;
            let xt = c2.forward(&xt)?;
            out = (out + xt)?;
        }
        Ok(out)
    }
}

/// Lightweight residual block: one dilated conv per step
struct ResBlock2 {
    convs: Vec<Conv1d>,
}

impl ResBlock2 {
    fn new(channels: usize, kernel_size: usize, dilations: &[usize], vb: VarBuilder) -> Result<Self> {
        let convs = dilations
            .iter()
            .take(2)
            .enumerate()
            .map(|(i, &dilation)| {
                Conv1d::new(
                    channels,
                    channels,
                    kernel_size,
                    ConvSpec::same(kernel_size, dilation),
                    vb.pp(format!("convs.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { convs })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = x.clone();
        for conv in &self.convs {
            let xt = leaky_relu(&out, LRELU_SLOPE)?;
            let xt = conv.forward(&xt)?;
            out = (out + xt)?;
        }
        Ok(out)
    }
}

enum ResBlock {
    One(ResBlock1),
    Two(ResBlock2),
}

impl ResBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            ResBlock::One(block) => block.forward(x),
            ResBlock::Two(block) => block.forward(x),
        }
    }
}

/// Multi-receptive-field fusion: the average of one resblock per kernel size
struct MrfBlock {
    resblocks: Vec<ResBlock>,
}

impl MrfBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = self.resblocks[0].forward(x)?;
        for block in self.resblocks.iter().skip(1) {
            out = (out + block.forward(x)?)?;
        }
        (out / self.resblocks.len() as f64).map_err(Into::into)
    }
}

/// HiFi-GAN generator
pub struct HiFiGan {
    config: HiFiGanConfig,
    conv_pre: Conv1d,
    ups: Vec<ConvTranspose1d>,
    mrf_blocks: Vec<MrfBlock>,
    conv_post: Conv1d,
    cond: Option<Conv1d>,
}

impl HiFiGan {
    pub fn new(config: HiFiGanConfig, vb: VarBuilder) -> Result<Self> {
        if config.upsample_rates.len() != config.upsample_kernel_sizes.len() {
            anyhow::bail!("upsample_rates and upsample_kernel_sizes differ in length");
        }
        if config.resblock_kernel_sizes.is_empty()
            || config.resblock_kernel_sizes.len() != config.resblock_dilation_sizes.len()
        {
            anyhow::bail!("resblock kernel and dilation lists must be non-empty and of equal length");
        }
        let use_block_two = match config.resblock.as_str() {
            "1" => false,
            "2" => true,
            other => anyhow::bail!("unknown resblock type {:?}", other),
        };

        let h = config.upsample_initial_channel;
        let conv_pre = Conv1d::new(config.initial_channel, h, 7, ConvSpec::same(7, 1), vb.pp("conv_pre"))?;

        let num_kernels = config.resblock_kernel_sizes.len();
        let mut ups = Vec::with_capacity(config.upsample_rates.len());
        let mut mrf_blocks = Vec::with_capacity(config.upsample_rates.len());
        let mut ch = h;
        for (i, (&rate, &kernel)) in config
            .upsample_rates
            .iter()
            .zip(config.upsample_kernel_sizes.iter())
            .enumerate()
        {
            if kernel < rate {
                anyhow::bail!("upsample kernel {} smaller than rate {}", kernel, rate);
            }
            let out_ch = h >> (i + 1);
            ups.push(ConvTranspose1d::new(
                ch,
                out_ch,
                kernel,
                ConvSpec::default().with_stride(rate).with_padding((kernel - rate) / 2),
                vb.pp(format!("ups.{}", i)),
            )?);

            let mut resblocks = Vec::with_capacity(num_kernels);
            for (j, (&k, dilations)) in config
                .resblock_kernel_sizes
                .iter()
                .zip(config.resblock_dilation_sizes.iter())
                .enumerate()
            {
                let rb_vb = vb.pp(format!("resblocks.{}", i * num_kernels + j));
                resblocks.push(if use_block_two {
                    ResBlock::Two(ResBlock2::new(out_ch, k, dilations, rb_vb)?)
                } else {
                    ResBlock::One(ResBlock1::new(out_ch, k, dilations, rb_vb)?)
                });
            }
            mrf_blocks.push(MrfBlock { resblocks });
            ch = out_ch;
        }

        let conv_post = Conv1d::no_bias(ch, 1, 7, ConvSpec::same(7, 1), vb.pp("conv_post"))?;
        let cond = if config.gin_channels > 0 {
            Some(Conv1d::new(config.gin_channels, h, 1, ConvSpec::default(), vb.pp("cond"))?)
        } else {
            None
        };

        Ok(Self {
            config,
            conv_pre,
            ups,
            mrf_blocks,
            conv_post,
            cond,
        })
    }

    /// Decode `[b, initial_channel, t]` latents to `[b, 1, t * upsample_factor]` audio
    pub fn forward(&self, x: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut x = self.conv_pre.forward(x)?;
        if let (Some(g), Some(cond)) = (g, &self.cond) {
            x = x.broadcast_add(&cond.forward(g)?)?;
        }

        for (up, mrf) in self.ups.iter().zip(self.mrf_blocks.iter()) {
            x = leaky_relu(&x, LRELU_SLOPE)?;
            x = up.forward(&x)?;
            x = mrf.forward(&x)?;
        }

        // Final activation uses the default leaky slope
        x = leaky_relu(&x, 0.01)?;
        x = self.conv_post.forward(&x)?;
        x.tanh().map_err(Into::into)
    }

    /// Get total upsampling factor
    pub fn upsample_factor(&self) -> usize {
        self.config.upsample_rates.iter().product()
    }

    pub fn config(&self) -> &HiFiGanConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config(resblock: &str) -> HiFiGanConfig {
        HiFiGanConfig {
            initial_channel: 8,
            resblock: resblock.to_string(),
            resblock_kernel_sizes: vec![3, 5],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5]],
            upsample_rates: vec![4, 2],
            upsample_initial_channel: 32,
            upsample_kernel_sizes: vec![8, 4],
            gin_channels: 6,
        }
    }

    #[test]
    fn test_hifigan_config_default() {
        let config = HiFiGanConfig::default();
        let total: usize = config.upsample_rates.iter().product();
        assert_eq!(total, 256);
    }

    #[test]
    fn test_hifigan_output_length() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dec = HiFiGan::new(small_config("1"), vb).unwrap();
        assert_eq!(dec.upsample_factor(), 8);

        let z = Tensor::randn(0f32, 1.0, (2, 8, 10), &device).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 6, 1), &device).unwrap();
        let audio = dec.forward(&z, Some(&g)).unwrap();
        assert_eq!(audio.dims3().unwrap(), (2, 1, 80));

        let peak: f32 = audio.abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar().unwrap();
        assert!(peak <= 1.0);
    }

    #[test]
    fn test_hifigan_resblock_two() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dec = HiFiGan::new(small_config("2"), vb).unwrap();

        let z = Tensor::randn(0f32, 1.0, (1, 8, 6), &device).unwrap();
        assert_eq!(dec.forward(&z, None).unwrap().dims3().unwrap(), (1, 1, 48));

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n == "resblocks.3.convs.1.weight"));
        assert!(!names.iter().any(|n| n == "conv_post.bias"));
    }

    #[test]
    fn test_hifigan_rejects_unknown_resblock() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(HiFiGan::new(small_config("3"), vb).is_err());
    }
}
