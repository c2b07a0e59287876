//! 1D convolutions with PyTorch weight layout
//!
//! Weights are pulled from a `VarBuilder`; checkpoints with weight norm are
//! folded into a plain `weight` by [`crate::models::weights`] before they
//! reach these layers.

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{init, VarBuilder};

/// Geometry shared by [`Conv1d`] and [`ConvTranspose1d`]
#[derive(Debug, Clone, Copy)]
pub struct ConvSpec {
    pub padding: usize,
    pub stride: usize,
    pub dilation: usize,
    pub groups: usize,
}

impl Default for ConvSpec {
    fn default() -> Self {
        Self {
            padding: 0,
            stride: 1,
            dilation: 1,
            groups: 1,
        }
    }
}

impl ConvSpec {
    /// Stride-1 "same" convolution for an odd kernel with `dilation`
    pub fn same(kernel_size: usize, dilation: usize) -> Self {
        Self {
            padding: get_padding(kernel_size, dilation),
            dilation,
            ..Self::default()
        }
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }
}

/// Padding that keeps the length for a stride-1 dilated convolution
pub fn get_padding(kernel_size: usize, dilation: usize) -> usize {
    (kernel_size * dilation - dilation) / 2
}

/// 1D convolution, weight `[out, in / groups, k]`
#[derive(Debug, Clone)]
pub struct Conv1d {
    weight: Tensor,
    bias: Option<Tensor>,
    spec: ConvSpec,
}

impl Conv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        spec: ConvSpec,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::build(in_channels, out_channels, kernel_size, spec, true, init::DEFAULT_KAIMING_NORMAL, vb)
    }

    /// Convolution without a bias term
    pub fn no_bias(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        spec: ConvSpec,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::build(in_channels, out_channels, kernel_size, spec, false, init::DEFAULT_KAIMING_NORMAL, vb)
    }

    /// Convolution whose fresh weights and bias start at zero
    ///
    /// Used for layers that must begin as the identity map of a residual path.
    pub fn zeros(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        spec: ConvSpec,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::build(in_channels, out_channels, kernel_size, spec, true, init::ZERO, vb)
    }

    fn build(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        spec: ConvSpec,
        bias: bool,
        weight_init: init::Init,
        vb: VarBuilder,
    ) -> Result<Self> {
        if spec.groups == 0 || in_channels % spec.groups != 0 {
            anyhow::bail!(
                "Conv1d {}: in_channels {} not divisible by groups {}",
                vb.prefix(),
                in_channels,
                spec.groups
            );
        }
        let weight = vb.get_with_hints(
            (out_channels, in_channels / spec.groups, kernel_size),
            "weight",
            weight_init,
        )?;
        let bias = if bias {
            Some(vb.get_with_hints(out_channels, "bias", init::ZERO)?)
        } else {
            None
        };
        Ok(Self { weight, bias, spec })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.conv1d(
            &self.weight,
            self.spec.padding,
            self.spec.stride,
            self.spec.dilation,
            self.spec.groups,
        )?;
        if let Some(ref bias) = self.bias {
            let bias = bias.unsqueeze(0)?.unsqueeze(2)?;
            x.broadcast_add(&bias).map_err(Into::into)
        } else {
            Ok(x)
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }
}

/// Transposed 1D convolution for upsampling, weight `[in, out, k]`
#[derive(Debug, Clone)]
pub struct ConvTranspose1d {
    weight: Tensor,
    bias: Option<Tensor>,
    spec: ConvSpec,
}

impl ConvTranspose1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        spec: ConvSpec,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (in_channels, out_channels, kernel_size),
            "weight",
            init::Init::Randn {
                mean: 0.0,
                stdev: 0.01,
            },
        )?;
        let bias = Some(vb.get_with_hints(out_channels, "bias", init::ZERO)?);
        Ok(Self { weight, bias, spec })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // conv_transpose1d(kernel, padding, output_padding, stride, dilation, groups)
        let x = x.conv_transpose1d(
            &self.weight,
            self.spec.padding,
            0,
            self.spec.stride,
            self.spec.dilation,
            1,
        )?;
        if let Some(ref bias) = self.bias {
            let bias = bias.unsqueeze(0)?.unsqueeze(2)?;
            x.broadcast_add(&bias).map_err(Into::into)
        } else {
            Ok(x)
        }
    }
}
