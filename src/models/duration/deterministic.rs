//! Convolutional log-duration regressor used when the stochastic predictor
//! is disabled

use crate::models::layers::{ChannelLayerNorm, Conv1d, ConvSpec};
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Dropout, VarBuilder};

pub struct DurationPredictor {
    conv_1: Conv1d,
    norm_1: ChannelLayerNorm,
    conv_2: Conv1d,
    norm_2: ChannelLayerNorm,
    proj: Conv1d,
    cond: Option<Conv1d>,
    dropout: Dropout,
}

impl DurationPredictor {
    pub fn new(
        in_channels: usize,
        filter_channels: usize,
        kernel_size: usize,
        p_dropout: f32,
        gin_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let spec = ConvSpec::default().with_padding(kernel_size / 2);
        let conv_1 = Conv1d::new(in_channels, filter_channels, kernel_size, spec, vb.pp("conv_1"))?;
        let norm_1 = ChannelLayerNorm::new(filter_channels, vb.pp("norm_1"))?;
        let conv_2 = Conv1d::new(filter_channels, filter_channels, kernel_size, spec, vb.pp("conv_2"))?;
        let norm_2 = ChannelLayerNorm::new(filter_channels, vb.pp("norm_2"))?;
        let proj = Conv1d::new(filter_channels, 1, 1, ConvSpec::default(), vb.pp("proj"))?;
        let cond = if gin_channels > 0 {
            Some(Conv1d::new(gin_channels, in_channels, 1, ConvSpec::default(), vb.pp("cond"))?)
        } else {
            None
        };
        Ok(Self {
            conv_1,
            norm_1,
            conv_2,
            norm_2,
            proj,
            cond,
            dropout: Dropout::new(p_dropout),
        })
    }

    /// Predicted log-durations `[b, 1, t]`
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let x = x.detach();
        let x = match (g, &self.cond) {
            (Some(g), Some(cond)) => x.broadcast_add(&cond.forward(&g.detach())?)?,
            _ => x,
        };

        let x = self.conv_1.forward(&x.broadcast_mul(x_mask)?)?.relu()?;
        let x = self.norm_1.forward(&x)?;
        let x = self.dropout.forward(&x, train)?;

        let x = self.conv_2.forward(&x.broadcast_mul(x_mask)?)?.relu()?;
        let x = self.norm_2.forward(&x)?;
        let x = self.dropout.forward(&x, train)?;

        let x = self.proj.forward(&x.broadcast_mul(x_mask)?)?;
        Ok(x.broadcast_mul(x_mask)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::commons::{channel_mask, lengths_tensor};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_duration_predictor_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dp = DurationPredictor::new(16, 32, 3, 0.5, 4, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 16, 11), &device).unwrap();
        let mask = channel_mask(&lengths_tensor(&[11, 3], &device).unwrap(), 11).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 4, 1), &device).unwrap();
        let logw = dp.forward(&x, &mask, Some(&g), false).unwrap();
        assert_eq!(logw.dims3().unwrap(), (2, 1, 11));
    }
}
