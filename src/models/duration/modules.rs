//! Flow building blocks of the stochastic duration predictor

use super::spline::piecewise_rational_quadratic_transform;
use crate::models::commons::{flip_channels, sum_except_batch};
use crate::models::layers::{ChannelLayerNorm, Conv1d, ConvSpec};
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{init, Dropout, VarBuilder};

/// Dilated depth-separable convolution stack
#[derive(Debug, Clone)]
pub struct DDSConv {
    convs_sep: Vec<Conv1d>,
    convs_1x1: Vec<Conv1d>,
    norms_1: Vec<ChannelLayerNorm>,
    norms_2: Vec<ChannelLayerNorm>,
    dropout: Dropout,
}

impl DDSConv {
    pub fn new(channels: usize, kernel_size: usize, n_layers: usize, p_dropout: f32, vb: VarBuilder) -> Result<Self> {
        let mut convs_sep = Vec::with_capacity(n_layers);
        let mut convs_1x1 = Vec::with_capacity(n_layers);
        let mut norms_1 = Vec::with_capacity(n_layers);
        let mut norms_2 = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let dilation = kernel_size.pow(i as u32);
            convs_sep.push(Conv1d::new(
                channels,
                channels,
                kernel_size,
                ConvSpec::same(kernel_size, dilation).with_groups(channels),
                vb.pp(format!("convs_sep.{}", i)),
            )?);
            convs_1x1.push(Conv1d::new(
                channels,
                channels,
                1,
                ConvSpec::default(),
                vb.pp(format!("convs_1x1.{}", i)),
            )?);
            norms_1.push(ChannelLayerNorm::new(channels, vb.pp(format!("norms_1.{}", i)))?);
            norms_2.push(ChannelLayerNorm::new(channels, vb.pp(format!("norms_2.{}", i)))?);
        }
        Ok(Self {
            convs_sep,
            convs_1x1,
            norms_1,
            norms_2,
            dropout: Dropout::new(p_dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let mut x = match g {
            Some(g) => x.broadcast_add(g)?,
            None => x.clone(),
        };
        for i in 0..self.convs_sep.len() {
            let y = self.convs_sep[i].forward(&x.broadcast_mul(x_mask)?)?;
            let y = self.norms_1[i].forward(&y)?.gelu_erf()?;
            let y = self.convs_1x1[i].forward(&y)?;
            let y = self.norms_2[i].forward(&y)?.gelu_erf()?;
            let y = self.dropout.forward(&y, train)?;
            x = (x + y)?;
        }
        Ok(x.broadcast_mul(x_mask)?)
    }
}

/// Per-channel affine map with learned `m` and `logs`
#[derive(Debug, Clone)]
pub struct ElementwiseAffine {
    m: Tensor,
    logs: Tensor,
}

impl ElementwiseAffine {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let m = vb.get_with_hints((channels, 1), "m", init::ZERO)?;
        let logs = vb.get_with_hints((channels, 1), "logs", init::ZERO)?;
        Ok(Self { m, logs })
    }

    fn forward(&self, x: &Tensor, x_mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let y = self.m.broadcast_add(&x.broadcast_mul(&self.logs.exp()?)?)?;
        let y = y.broadcast_mul(x_mask)?;
        let logdet = sum_except_batch(&self.logs.broadcast_mul(x_mask)?)?;
        Ok((y, logdet))
    }

    fn reverse(&self, x: &Tensor, x_mask: &Tensor) -> Result<Tensor> {
        let y = x.broadcast_sub(&self.m)?.broadcast_mul(&self.logs.neg()?.exp()?)?;
        Ok(y.broadcast_mul(x_mask)?)
    }
}

/// Spline coupling conditioned on the first channel half through a DDSConv
#[derive(Debug, Clone)]
pub struct ConvFlow {
    half_channels: usize,
    filter_channels: usize,
    num_bins: usize,
    tail_bound: f64,
    pre: Conv1d,
    convs: DDSConv,
    proj: Conv1d,
}

impl ConvFlow {
    pub const NUM_BINS: usize = 10;
    pub const TAIL_BOUND: f64 = 5.0;

    pub fn new(
        in_channels: usize,
        filter_channels: usize,
        kernel_size: usize,
        n_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let half_channels = in_channels / 2;
        let num_bins = Self::NUM_BINS;
        let pre = Conv1d::new(half_channels, filter_channels, 1, ConvSpec::default(), vb.pp("pre"))?;
        let convs = DDSConv::new(filter_channels, kernel_size, n_layers, 0.0, vb.pp("convs"))?;
        let proj = Conv1d::zeros(
            filter_channels,
            half_channels * (num_bins * 3 - 1),
            1,
            ConvSpec::default(),
            vb.pp("proj"),
        )?;
        Ok(Self {
            half_channels,
            filter_channels,
            num_bins,
            tail_bound: Self::TAIL_BOUND,
            pre,
            convs,
            proj,
        })
    }

    fn transform(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>, inverse: bool) -> Result<(Tensor, Tensor)> {
        let (b, _, t) = x.dims3()?;
        let x0 = x.narrow(1, 0, self.half_channels)?;
        let x1 = x.narrow(1, self.half_channels, self.half_channels)?;

        let h = self.pre.forward(&x0)?;
        let h = self.convs.forward(&h, x_mask, g, false)?;
        let h = self.proj.forward(&h)?.broadcast_mul(x_mask)?;

        // [b, half * (3K - 1), t] -> [b, half, t, 3K - 1]
        let k = self.num_bins;
        let h = h
            .reshape((b, self.half_channels, 3 * k - 1, t))?
            .permute((0, 1, 3, 2))?
            .contiguous()?;
        let scale = (self.filter_channels as f64).sqrt();
        let unnormalized_widths = (h.narrow(D::Minus1, 0, k)? / scale)?;
        let unnormalized_heights = (h.narrow(D::Minus1, k, k)? / scale)?;
        let unnormalized_derivatives = h.narrow(D::Minus1, 2 * k, k - 1)?;

        let (x1, logabsdet) = piecewise_rational_quadratic_transform(
            &x1,
            &unnormalized_widths,
            &unnormalized_heights,
            &unnormalized_derivatives,
            inverse,
            self.tail_bound,
        )?;

        let x = Tensor::cat(&[&x0, &x1], 1)?.broadcast_mul(x_mask)?;
        let logdet = sum_except_batch(&logabsdet.broadcast_mul(x_mask)?)?;
        Ok((x, logdet))
    }
}

/// One step of a duration-predictor flow chain
#[derive(Debug, Clone)]
pub enum DurationFlow {
    /// `log(max(x, 1e-5))`; applied to durations before the main flows
    Log,
    ElementwiseAffine(ElementwiseAffine),
    ConvFlow(Box<ConvFlow>),
    Flip,
}

impl DurationFlow {
    /// Returns the transformed tensor and its log-determinant `[b]`
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        match self {
            DurationFlow::Log => {
                let y = x.clamp(1e-5, f64::MAX)?.log()?.broadcast_mul(x_mask)?;
                let logdet = sum_except_batch(&y.neg()?)?;
                Ok((y, logdet))
            }
            DurationFlow::ElementwiseAffine(flow) => flow.forward(x, x_mask),
            DurationFlow::ConvFlow(flow) => flow.transform(x, x_mask, g, false),
            DurationFlow::Flip => {
                let b = x.dim(0)?;
                let logdet = Tensor::zeros(b, x.dtype(), x.device())?;
                Ok((flip_channels(x)?, logdet))
            }
        }
    }

    pub fn reverse(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        match self {
            DurationFlow::Log => Ok(x.exp()?.broadcast_mul(x_mask)?),
            DurationFlow::ElementwiseAffine(flow) => flow.reverse(x, x_mask),
            DurationFlow::ConvFlow(flow) => Ok(flow.transform(x, x_mask, g, true)?.0),
            DurationFlow::Flip => flip_channels(x),
        }
    }
}

/// `ElementwiseAffine(2)` followed by `n_flows` x (ConvFlow, Flip), keyed
/// `{prefix}.{index}` in checkpoint order
pub fn build_flow_chain(
    filter_channels: usize,
    kernel_size: usize,
    n_flows: usize,
    vb: VarBuilder,
) -> Result<Vec<DurationFlow>> {
    let mut flows = Vec::with_capacity(1 + 2 * n_flows);
    flows.push(DurationFlow::ElementwiseAffine(ElementwiseAffine::new(2, vb.pp("0"))?));
    for i in 0..n_flows {
        flows.push(DurationFlow::ConvFlow(Box::new(ConvFlow::new(
            2,
            filter_channels,
            kernel_size,
            3,
            vb.pp((1 + 2 * i).to_string()),
        )?)));
        flows.push(DurationFlow::Flip);
    }
    Ok(flows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::commons::{channel_mask, lengths_tensor};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar().unwrap()
    }

    #[test]
    fn test_dds_conv_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dds = DDSConv::new(12, 3, 3, 0.0, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 12, 30), &device).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 12, 30), &device).unwrap();
        let mask = channel_mask(&lengths_tensor(&[30, 20], &device).unwrap(), 30).unwrap();
        assert_eq!(dds.forward(&x, &mask, Some(&g), false).unwrap().dims3().unwrap(), (2, 12, 30));
    }

    #[test]
    fn test_log_flow_round_trip() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[1.0f32, 2.0, 5.0]]], &device).unwrap();
        let mask = Tensor::ones((1, 1, 3), DType::F32, &device).unwrap();
        let (y, logdet) = DurationFlow::Log.forward(&x, &mask, None).unwrap();
        let expected = -(10f32.ln());
        let logdet: Vec<f32> = logdet.to_vec1().unwrap();
        assert!((logdet[0] - expected).abs() < 1e-5);
        let back = DurationFlow::Log.reverse(&y, &mask, None).unwrap();
        assert!(max_abs_diff(&x, &back) < 1e-5);
    }

    #[test]
    fn test_conv_flow_round_trip() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        ConvFlow::new(2, 16, 3, 3, vb.clone()).unwrap();
        // Give the zero-initialised projection some weight so the spline is non-trivial
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.starts_with("proj.") {
                let noisy = Tensor::randn(0f32, 0.5, var.shape(), &device).unwrap();
                var.set(&noisy).unwrap();
            }
        }
        let flow = DurationFlow::ConvFlow(Box::new(ConvFlow::new(2, 16, 3, 3, vb).unwrap()));

        let x = Tensor::randn(0f32, 1.0, (2, 2, 10), &device).unwrap();
        let mask = channel_mask(&lengths_tensor(&[10, 6], &device).unwrap(), 10).unwrap();
        let x = x.broadcast_mul(&mask).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 16, 10), &device).unwrap();

        let (y, logdet) = flow.forward(&x, &mask, Some(&g)).unwrap();
        assert_eq!(logdet.dims(), &[2]);
        assert!(max_abs_diff(&x, &y) > 1e-4);
        let back = flow.reverse(&y, &mask, Some(&g)).unwrap();
        assert!(max_abs_diff(&x, &back) < 1e-3);
    }

    #[test]
    fn test_flow_chain_layout() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let chain = build_flow_chain(8, 3, 4, vb).unwrap();
        assert_eq!(chain.len(), 9);
        assert!(matches!(chain[0], DurationFlow::ElementwiseAffine(_)));
        assert!(matches!(chain[1], DurationFlow::ConvFlow(_)));
        assert!(matches!(chain[8], DurationFlow::Flip));

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n == "0.logs"));
        assert!(names.iter().any(|n| n == "7.proj.weight"));
    }
}
