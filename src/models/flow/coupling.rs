//! Residual affine coupling flow between posterior and prior latents
//!
//! Each coupling layer transforms the second half of the channels
//! conditioned on the first half; a channel flip between layers lets both
//! halves be transformed. The `post` projection starts at zero so a freshly
//! initialised flow is the identity.

use crate::models::commons::{flip_channels, sum_except_batch};
use crate::models::layers::{Conv1d, ConvSpec, WaveNet};
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

pub struct ResidualCouplingLayer {
    half_channels: usize,
    mean_only: bool,
    pre: Conv1d,
    enc: WaveNet,
    post: Conv1d,
}

impl ResidualCouplingLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        gin_channels: usize,
        mean_only: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if channels % 2 != 0 {
            anyhow::bail!("coupling channels must be even, got {}", channels);
        }
        let half_channels = channels / 2;
        let pre = Conv1d::new(half_channels, hidden_channels, 1, ConvSpec::default(), vb.pp("pre"))?;
        let enc = WaveNet::new(
            hidden_channels,
            kernel_size,
            dilation_rate,
            n_layers,
            gin_channels,
            0.0,
            vb.pp("enc"),
        )?;
        let post_channels = if mean_only { half_channels } else { 2 * half_channels };
        let post = Conv1d::zeros(hidden_channels, post_channels, 1, ConvSpec::default(), vb.pp("post"))?;
        Ok(Self {
            half_channels,
            mean_only,
            pre,
            enc,
            post,
        })
    }

    fn stats(&self, x0: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let h = self.pre.forward(x0)?.broadcast_mul(x_mask)?;
        let h = self.enc.forward(&h, x_mask, g, false)?;
        let stats = self.post.forward(&h)?.broadcast_mul(x_mask)?;
        if self.mean_only {
            let logs = stats.zeros_like()?;
            Ok((stats, logs))
        } else {
            let m = stats.narrow(1, 0, self.half_channels)?;
            let logs = stats.narrow(1, self.half_channels, self.half_channels)?;
            Ok((m, logs))
        }
    }

    /// Returns the transformed tensor and the per-item log-determinant `[b]`
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let x0 = x.narrow(1, 0, self.half_channels)?;
        let x1 = x.narrow(1, self.half_channels, self.half_channels)?;
        let (m, logs) = self.stats(&x0, x_mask, g)?;

        let x1 = (m + (x1 * logs.exp()?)?.broadcast_mul(x_mask)?)?;
        let logdet = sum_except_batch(&logs)?;
        Ok((Tensor::cat(&[&x0, &x1], 1)?, logdet))
    }

    pub fn reverse(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let x0 = x.narrow(1, 0, self.half_channels)?;
        let x1 = x.narrow(1, self.half_channels, self.half_channels)?;
        let (m, logs) = self.stats(&x0, x_mask, g)?;

        let x1 = ((x1 - m)? * logs.neg()?.exp()?)?.broadcast_mul(x_mask)?;
        Ok(Tensor::cat(&[&x0, &x1], 1)?)
    }
}

/// `n_flows` x (coupling layer, channel flip)
pub struct ResidualCouplingBlock {
    flows: Vec<ResidualCouplingLayer>,
}

impl ResidualCouplingBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        n_layers: usize,
        n_flows: usize,
        gin_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut flows = Vec::with_capacity(n_flows);
        for i in 0..n_flows {
            // Flip modules are parameter-free and occupy the odd indices
            flows.push(ResidualCouplingLayer::new(
                channels,
                hidden_channels,
                kernel_size,
                dilation_rate,
                n_layers,
                gin_channels,
                true,
                vb.pp(format!("flows.{}", 2 * i)),
            )?);
        }
        Ok(Self { flows })
    }

    /// Posterior latent `z` -> prior-space `z_p`
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut x = x.clone();
        for flow in &self.flows {
            let (y, _logdet) = flow.forward(&x, x_mask, g)?;
            x = flip_channels(&y)?;
        }
        Ok(x)
    }

    /// Prior-space `z_p` -> posterior latent `z`
    pub fn reverse(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut x = x.clone();
        for flow in self.flows.iter().rev() {
            x = flow.reverse(&flip_channels(&x)?, x_mask, g)?;
        }
        Ok(x)
    }

    pub fn num_flows(&self) -> usize {
        self.flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::commons::{channel_mask, lengths_tensor};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn test_fresh_flow_is_identity() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let flow = ResidualCouplingBlock::new(8, 16, 5, 1, 2, 4, 0, vb).unwrap();
        assert_eq!(flow.num_flows(), 4);

        let x = Tensor::randn(0f32, 1.0, (1, 8, 12), &device).unwrap();
        let mask = Tensor::ones((1, 1, 12), DType::F32, &device).unwrap();
        // Four flips cancel and every post layer is zero
        let y = flow.forward(&x, &mask, None).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-6);
    }

    #[test]
    fn test_flow_round_trip_with_trained_post() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        ResidualCouplingBlock::new(8, 16, 5, 1, 2, 3, 6, vb.clone()).unwrap();

        // Perturb the zero-initialised post layers so the flow is non-trivial
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.contains(".post.") {
                let noisy = Tensor::randn(0f32, 0.1, var.shape(), &device).unwrap();
                var.set(&noisy).unwrap();
            }
        }
        let flow = ResidualCouplingBlock::new(8, 16, 5, 1, 2, 3, 6, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 8, 15), &device).unwrap();
        let mask = channel_mask(&lengths_tensor(&[15, 9], &device).unwrap(), 15).unwrap();
        let x = x.broadcast_mul(&mask).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 6, 1), &device).unwrap();

        let z_p = flow.forward(&x, &mask, Some(&g)).unwrap();
        assert!(max_abs_diff(&x, &z_p) > 1e-3);
        let back = flow.reverse(&z_p, &mask, Some(&g)).unwrap();
        assert!(max_abs_diff(&x, &back) < 1e-4);
    }

    #[test]
    fn test_affine_coupling_logdet() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        ResidualCouplingLayer::new(4, 8, 3, 1, 1, 0, false, vb.clone()).unwrap();

        // logs = 0.5 everywhere, m = 0 (post weights stay zero)
        let bias = Tensor::new(&[0.0f32, 0.0, 0.5, 0.5], &device).unwrap();
        if let Some(var) = varmap.data().lock().unwrap().get("post.bias") {
            var.set(&bias).unwrap();
        }
        let layer = ResidualCouplingLayer::new(4, 8, 3, 1, 1, 0, false, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, 6), &device).unwrap();
        let mask = Tensor::ones((1, 1, 6), DType::F32, &device).unwrap();
        let (y, logdet) = layer.forward(&x, &mask, None).unwrap();
        let logdet: Vec<f32> = logdet.to_vec1().unwrap();
        // 2 channels * 6 frames * 0.5
        assert!((logdet[0] - 6.0).abs() < 1e-5);

        let back = layer.reverse(&y, &mask, None).unwrap();
        assert!(max_abs_diff(&x, &back) < 1e-5);
    }
}
