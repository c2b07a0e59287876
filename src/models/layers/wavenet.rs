//! Non-causal WaveNet stack (WN) used by the posterior encoder and the
//! coupling layers
//!
//! Weight keys:
//! - `in_layers.{i}` dilated convolutions `hidden -> 2 * hidden`
//! - `res_skip_layers.{i}` 1x1 convolutions (`2 * hidden`, last layer `hidden`)
//! - `cond_layer` optional 1x1 projection `gin -> 2 * hidden * n_layers`

use super::conv::{Conv1d, ConvSpec};
use crate::models::commons::fused_add_tanh_sigmoid_multiply;
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Dropout, VarBuilder};

/// Gated dilated residual stack with optional global conditioning
#[derive(Debug, Clone)]
pub struct WaveNet {
    hidden_channels: usize,
    in_layers: Vec<Conv1d>,
    res_skip_layers: Vec<Conv1d>,
    cond_layer: Option<Conv1d>,
    dropout: Dropout,
}

impl WaveNet {
    pub fn new(
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        gin_channels: usize,
        p_dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if kernel_size % 2 != 1 {
            anyhow::bail!("WaveNet kernel_size must be odd, got {}", kernel_size);
        }

        let cond_layer = if gin_channels > 0 {
            Some(Conv1d::new(
                gin_channels,
                2 * hidden_channels * n_layers,
                1,
                ConvSpec::default(),
                vb.pp("cond_layer"),
            )?)
        } else {
            None
        };

        let mut in_layers = Vec::with_capacity(n_layers);
        let mut res_skip_layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let dilation = dilation_rate.pow(i as u32);
            in_layers.push(Conv1d::new(
                hidden_channels,
                2 * hidden_channels,
                kernel_size,
                ConvSpec::same(kernel_size, dilation),
                vb.pp(format!("in_layers.{}", i)),
            )?);

            let res_skip_channels = if i + 1 < n_layers {
                2 * hidden_channels
            } else {
                hidden_channels
            };
            res_skip_layers.push(Conv1d::new(
                hidden_channels,
                res_skip_channels,
                1,
                ConvSpec::default(),
                vb.pp(format!("res_skip_layers.{}", i)),
            )?);
        }

        Ok(Self {
            hidden_channels,
            in_layers,
            res_skip_layers,
            cond_layer,
            dropout: Dropout::new(p_dropout),
        })
    }

    /// * `x` - `[b, hidden, t]`
    /// * `x_mask` - `[b, 1, t]`
    /// * `g` - optional `[b, gin, 1]` conditioning
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let h = self.hidden_channels;
        let n_layers = self.in_layers.len();

        let g = match (g, &self.cond_layer) {
            (Some(g), Some(cond)) => Some(cond.forward(g)?),
            (Some(_), None) => {
                anyhow::bail!("WaveNet was built without conditioning but received g")
            }
            _ => None,
        };
        let no_cond = Tensor::zeros((1, 1, 1), x.dtype(), x.device())?;

        let mut x = x.clone();
        let mut output = x.zeros_like()?;
        for (i, (in_layer, res_skip)) in self.in_layers.iter().zip(&self.res_skip_layers).enumerate() {
            let x_in = in_layer.forward(&x)?;
            let g_l = match g {
                Some(ref g) => g.narrow(1, i * 2 * h, 2 * h)?,
                None => no_cond.clone(),
            };
            let acts = fused_add_tanh_sigmoid_multiply(&x_in, &g_l, h)?;
            let acts = self.dropout.forward(&acts, train)?;

            let res_skip_acts = res_skip.forward(&acts)?;
            if i + 1 < n_layers {
                let res = res_skip_acts.narrow(1, 0, h)?;
                x = (x + res)?.broadcast_mul(x_mask)?;
                output = (output + res_skip_acts.narrow(1, h, h)?)?;
            } else {
                output = (output + res_skip_acts)?;
            }
        }
        Ok(output.broadcast_mul(x_mask)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::commons::{channel_mask, lengths_tensor};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_wavenet_shapes_and_mask() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let wn = WaveNet::new(16, 5, 2, 4, 8, 0.0, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 16, 20), &device).unwrap();
        let mask = channel_mask(&lengths_tensor(&[20, 12], &device).unwrap(), 20).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 8, 1), &device).unwrap();

        let y = wn.forward(&x, &mask, Some(&g), false).unwrap();
        assert_eq!(y.dims3().unwrap(), (2, 16, 20));

        let tail: f32 = y
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(2, 12, 8)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn test_wavenet_rejects_unexpected_conditioning() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let wn = WaveNet::new(8, 3, 1, 2, 0, 0.0, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 8, 5), &device).unwrap();
        let mask = Tensor::ones((1, 1, 5), DType::F32, &device).unwrap();
        let g = Tensor::randn(0f32, 1.0, (1, 4, 1), &device).unwrap();
        assert!(wn.forward(&x, &mask, None, false).is_ok());
        assert!(wn.forward(&x, &mask, Some(&g), false).is_err());
    }
}
