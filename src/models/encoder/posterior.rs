//! Posterior encoder: linear spectrogram -> latent `z ~ q(z | x)`

use crate::models::commons::channel_mask;
use crate::models::layers::{Conv1d, ConvSpec, WaveNet};
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

pub struct PosteriorEncoder {
    out_channels: usize,
    pre: Conv1d,
    enc: WaveNet,
    proj: Conv1d,
}

impl PosteriorEncoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        gin_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let pre = Conv1d::new(in_channels, hidden_channels, 1, ConvSpec::default(), vb.pp("pre"))?;
        let enc = WaveNet::new(
            hidden_channels,
            kernel_size,
            dilation_rate,
            n_layers,
            gin_channels,
            0.0,
            vb.pp("enc"),
        )?;
        let proj = Conv1d::new(hidden_channels, 2 * out_channels, 1, ConvSpec::default(), vb.pp("proj"))?;
        Ok(Self {
            out_channels,
            pre,
            enc,
            proj,
        })
    }

    /// * `y` - `[b, spec_channels, t]`
    /// * `lengths` - `[b]` valid frame counts
    /// * `g` - optional speaker conditioning `[b, gin, 1]`
    ///
    /// Returns `(z, m_q, logs_q, y_mask)`.
    pub fn forward(
        &self,
        y: &Tensor,
        lengths: &Tensor,
        g: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let t = y.dim(2)?;
        let y_mask = channel_mask(lengths, t)?;

        let x = self.pre.forward(y)?.broadcast_mul(&y_mask)?;
        let x = self.enc.forward(&x, &y_mask, g, train)?;
        let stats = self.proj.forward(&x)?.broadcast_mul(&y_mask)?;

        let m = stats.narrow(1, 0, self.out_channels)?;
        let logs = stats.narrow(1, self.out_channels, self.out_channels)?;

        let eps = m.randn_like(0.0, 1.0)?;
        let z = (&m + (eps * logs.exp()?)?)?.broadcast_mul(&y_mask)?;
        Ok((z, m, logs, y_mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::commons::lengths_tensor;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_posterior_encoder_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = PosteriorEncoder::new(33, 8, 16, 5, 1, 3, 12, vb).unwrap();

        let spec = Tensor::randn(0f32, 1.0, (2, 33, 25), &device).unwrap().abs().unwrap();
        let lengths = lengths_tensor(&[25, 10], &device).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 12, 1), &device).unwrap();
        let (z, m, logs, mask) = enc.forward(&spec, &lengths, Some(&g), false).unwrap();

        assert_eq!(z.dims3().unwrap(), (2, 8, 25));
        assert_eq!(m.dims3().unwrap(), (2, 8, 25));
        assert_eq!(logs.dims3().unwrap(), (2, 8, 25));
        assert_eq!(mask.dims3().unwrap(), (2, 1, 25));

        let padded: f32 = z
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(2, 10, 15)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(padded, 0.0);
    }
}
