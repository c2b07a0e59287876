//! Post-norm transformer encoder over `[b, c, t]` sequences
//!
//! Weight keys per layer `i`: `attn_layers.{i}`, `norm_layers_1.{i}`,
//! `ffn_layers.{i}.conv_1`, `ffn_layers.{i}.conv_2`, `norm_layers_2.{i}`.

use super::relative::{AttentionOptions, MultiHeadAttention};
use crate::models::layers::{ChannelLayerNorm, Conv1d, ConvSpec};
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Dropout, VarBuilder};

/// Convolutional feed-forward block with "same" padding
#[derive(Debug, Clone)]
pub struct FeedForward {
    conv_1: Conv1d,
    conv_2: Conv1d,
    kernel_size: usize,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        filter_channels: usize,
        kernel_size: usize,
        p_dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_1 = Conv1d::new(in_channels, filter_channels, kernel_size, ConvSpec::default(), vb.pp("conv_1"))?;
        let conv_2 = Conv1d::new(filter_channels, out_channels, kernel_size, ConvSpec::default(), vb.pp("conv_2"))?;
        Ok(Self {
            conv_1,
            conv_2,
            kernel_size,
            dropout: Dropout::new(p_dropout),
        })
    }

    fn same_padding(&self, x: &Tensor) -> Result<Tensor> {
        if self.kernel_size == 1 {
            return Ok(x.clone());
        }
        let pad_l = (self.kernel_size - 1) / 2;
        let pad_r = self.kernel_size / 2;
        Ok(x.pad_with_zeros(2, pad_l, pad_r)?)
    }

    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv_1.forward(&self.same_padding(&x.broadcast_mul(x_mask)?)?)?;
        let x = x.relu()?;
        let x = self.dropout.forward(&x, train)?;
        let x = self.conv_2.forward(&self.same_padding(&x.broadcast_mul(x_mask)?)?)?;
        Ok(x.broadcast_mul(x_mask)?)
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    attn: MultiHeadAttention,
    norm_1: ChannelLayerNorm,
    ffn: FeedForward,
    norm_2: ChannelLayerNorm,
}

/// Stack of relative self-attention + FFN layers
#[derive(Debug, Clone)]
pub struct Encoder {
    layers: Vec<EncoderLayer>,
    dropout: Dropout,
}

impl Encoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hidden_channels: usize,
        filter_channels: usize,
        n_heads: usize,
        n_layers: usize,
        kernel_size: usize,
        p_dropout: f32,
        window_size: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let options = AttentionOptions {
                p_dropout,
                window_size,
                ..AttentionOptions::default()
            };
            layers.push(EncoderLayer {
                attn: MultiHeadAttention::new(
                    hidden_channels,
                    hidden_channels,
                    n_heads,
                    options,
                    vb.pp(format!("attn_layers.{}", i)),
                )?,
                norm_1: ChannelLayerNorm::new(hidden_channels, vb.pp(format!("norm_layers_1.{}", i)))?,
                ffn: FeedForward::new(
                    hidden_channels,
                    hidden_channels,
                    filter_channels,
                    kernel_size,
                    p_dropout,
                    vb.pp(format!("ffn_layers.{}", i)),
                )?,
                norm_2: ChannelLayerNorm::new(hidden_channels, vb.pp(format!("norm_layers_2.{}", i)))?,
            });
        }
        Ok(Self {
            layers,
            dropout: Dropout::new(p_dropout),
        })
    }

    /// * `x` - `[b, hidden, t]`
    /// * `x_mask` - `[b, 1, t]`
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, train: bool) -> Result<Tensor> {
        // [b, 1, t, t]
        let attn_mask = x_mask.unsqueeze(2)?.broadcast_mul(&x_mask.unsqueeze(3)?)?;
        let mut x = x.broadcast_mul(x_mask)?;
        for layer in &self.layers {
            let y = layer.attn.forward(&x, &x, Some(&attn_mask), train)?;
            let y = self.dropout.forward(&y, train)?;
            x = layer.norm_1.forward(&(x + y)?)?;

            let y = layer.ffn.forward(&x, x_mask, train)?;
            let y = self.dropout.forward(&y, train)?;
            x = layer.norm_2.forward(&(x + y)?)?;
        }
        Ok(x.broadcast_mul(x_mask)?)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
