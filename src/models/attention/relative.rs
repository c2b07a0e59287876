//! Multi-head attention with learned relative position embeddings
//!
//! Relative logits are computed against a window of `2 * window_size + 1`
//! embeddings and moved between relative and absolute indexing with the
//! pad-and-reshape trick, so no gather is needed.
//!
//! Weight keys: `conv_q`, `conv_k`, `conv_v`, `conv_o` (1x1 convs) and
//! `emb_rel_k` / `emb_rel_v` of shape `[1 or n_heads, 2w+1, k_channels]`.

use crate::models::layers::{Conv1d, ConvSpec};
use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{init, Dropout, VarBuilder};

/// Fill value for masked attention logits
pub const MASK_FILL: f32 = -1e4;

/// Optional attention behaviours
#[derive(Debug, Clone)]
pub struct AttentionOptions {
    pub p_dropout: f32,
    /// Relative window; `None` disables relative embeddings
    pub window_size: Option<usize>,
    /// Share one relative table across heads
    pub heads_share: bool,
    /// Restrict attention to a band of `block_length` around the diagonal
    pub block_length: Option<usize>,
    /// Add `-log(1 + |i - j|)` to the logits
    pub proximal_bias: bool,
}

impl Default for AttentionOptions {
    fn default() -> Self {
        Self {
            p_dropout: 0.0,
            window_size: None,
            heads_share: true,
            block_length: None,
            proximal_bias: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    n_heads: usize,
    k_channels: usize,
    window_size: Option<usize>,
    block_length: Option<usize>,
    proximal_bias: bool,
    conv_q: Conv1d,
    conv_k: Conv1d,
    conv_v: Conv1d,
    conv_o: Conv1d,
    emb_rel_k: Option<Tensor>,
    emb_rel_v: Option<Tensor>,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(
        channels: usize,
        out_channels: usize,
        n_heads: usize,
        options: AttentionOptions,
        vb: VarBuilder,
    ) -> Result<Self> {
        if n_heads == 0 || channels % n_heads != 0 {
            anyhow::bail!("channels ({}) must be divisible by n_heads ({})", channels, n_heads);
        }
        let k_channels = channels / n_heads;

        let conv_q = Conv1d::new(channels, channels, 1, ConvSpec::default(), vb.pp("conv_q"))?;
        let conv_k = Conv1d::new(channels, channels, 1, ConvSpec::default(), vb.pp("conv_k"))?;
        let conv_v = Conv1d::new(channels, channels, 1, ConvSpec::default(), vb.pp("conv_v"))?;
        let conv_o = Conv1d::new(channels, out_channels, 1, ConvSpec::default(), vb.pp("conv_o"))?;

        let (emb_rel_k, emb_rel_v) = match options.window_size {
            Some(window) => {
                let n_heads_rel = if options.heads_share { 1 } else { n_heads };
                let shape = (n_heads_rel, 2 * window + 1, k_channels);
                let rel_init = init::Init::Randn {
                    mean: 0.0,
                    stdev: (k_channels as f64).powf(-0.5),
                };
                (
                    Some(vb.get_with_hints(shape, "emb_rel_k", rel_init)?),
                    Some(vb.get_with_hints(shape, "emb_rel_v", rel_init)?),
                )
            }
            None => (None, None),
        };

        Ok(Self {
            n_heads,
            k_channels,
            window_size: options.window_size,
            block_length: options.block_length,
            proximal_bias: options.proximal_bias,
            conv_q,
            conv_k,
            conv_v,
            conv_o,
            emb_rel_k,
            emb_rel_v,
            dropout: Dropout::new(options.p_dropout),
        })
    }

    /// * `x` - queries `[b, c, t_t]`
    /// * `c` - keys / values `[b, c, t_s]`
    /// * `attn_mask` - optional `[b, 1, t_t, t_s]`, zero where attention is forbidden
    pub fn forward(&self, x: &Tensor, c: &Tensor, attn_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let q = self.conv_q.forward(x)?;
        let k = self.conv_k.forward(c)?;
        let v = self.conv_v.forward(c)?;
        let out = self.attention(&q, &k, &v, attn_mask, train)?;
        self.conv_o.forward(&out)
    }

    fn attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, d, t_s) = key.dims3()?;
        let t_t = query.dim(2)?;
        let (h, kc) = (self.n_heads, self.k_channels);

        // [b, c, t] -> [b, heads, t, k_channels]
        let split = |x: &Tensor, t: usize| -> Result<Tensor> {
            Ok(x.reshape((b, h, kc, t))?.transpose(2, 3)?.contiguous()?)
        };
        let query = (split(query, t_t)? / (kc as f64).sqrt())?;
        let key = split(key, t_s)?;
        let value = split(value, t_s)?;

        let mut scores = query.matmul(&key.transpose(2, 3)?.contiguous()?)?;

        if let Some(ref emb_rel_k) = self.emb_rel_k {
            if t_s != t_t {
                anyhow::bail!("relative attention is only available for self-attention ({} != {})", t_s, t_t);
            }
            let key_rel = self.relative_embeddings(emb_rel_k, t_s)?;
            // [b, h, t, 2t-1]
            let rel_logits = query.broadcast_matmul(&key_rel.unsqueeze(0)?.transpose(2, 3)?.contiguous()?)?;
            scores = (scores + relative_to_absolute(&rel_logits)?)?;
        }

        if self.proximal_bias {
            if t_s != t_t {
                anyhow::bail!("proximal bias is only available for self-attention");
            }
            scores = scores.broadcast_add(&attention_bias_proximal(t_s, scores.device())?)?;
        }

        if let Some(mask) = mask {
            scores = masked_fill(&scores, mask, MASK_FILL)?;
            if let Some(block) = self.block_length {
                if t_s != t_t {
                    anyhow::bail!("block-local attention is only available for self-attention");
                }
                let band = block_band_mask(t_s, block, scores.device())?;
                scores = masked_fill(&scores, &band, MASK_FILL)?;
            }
        }

        let p_attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let p_attn = self.dropout.forward(&p_attn, train)?;
        let mut output = p_attn.matmul(&value)?;

        if let Some(ref emb_rel_v) = self.emb_rel_v {
            let relative_weights = absolute_to_relative(&p_attn)?;
            let value_rel = self.relative_embeddings(emb_rel_v, t_s)?;
            output = (output + relative_weights.broadcast_matmul(&value_rel.unsqueeze(0)?)?)?;
        }

        // [b, h, t_t, kc] -> [b, d, t_t]
        Ok(output.transpose(2, 3)?.reshape((b, d, t_t))?)
    }

    fn relative_embeddings(&self, embeddings: &Tensor, length: usize) -> Result<Tensor> {
        // window_size is Some whenever the tables exist
        let window = self.window_size.unwrap_or(0);
        get_relative_embeddings(embeddings, window, length)
    }
}

/// Slice (zero-padding as needed) the `2 * length - 1` embeddings centred on
/// relative position 0 out of a `[n, 2 * window + 1, d]` table
pub fn get_relative_embeddings(embeddings: &Tensor, window_size: usize, length: usize) -> Result<Tensor> {
    let pad_length = length.saturating_sub(window_size + 1);
    let slice_start = (window_size + 1).saturating_sub(length);
    let padded = if pad_length > 0 {
        embeddings.pad_with_zeros(1, pad_length, pad_length)?
    } else {
        embeddings.clone()
    };
    Ok(padded.narrow(1, slice_start, 2 * length - 1)?)
}

/// `[b, h, l, 2l-1]` relative logits -> `[b, h, l, l]` absolute logits
pub fn relative_to_absolute(x: &Tensor) -> Result<Tensor> {
    let (b, h, l, _) = x.dims4()?;
    let x = x.pad_with_zeros(3, 0, 1)?;
    let x_flat = x.reshape((b, h, l * 2 * l))?.pad_with_zeros(2, 0, l - 1)?;
    let x_final = x_flat
        .reshape((b, h, l + 1, 2 * l - 1))?
        .narrow(2, 0, l)?
        .narrow(3, l - 1, l)?;
    Ok(x_final.contiguous()?)
}

/// `[b, h, l, l]` absolute weights -> `[b, h, l, 2l-1]` relative weights
pub fn absolute_to_relative(x: &Tensor) -> Result<Tensor> {
    let (b, h, l, _) = x.dims4()?;
    let x = x.pad_with_zeros(3, 0, l - 1)?;
    let x_flat = x.reshape((b, h, l * (2 * l - 1)))?.pad_with_zeros(2, l, 0)?;
    let x_final = x_flat.reshape((b, h, l, 2 * l))?.narrow(3, 1, 2 * l - 1)?;
    Ok(x_final.contiguous()?)
}

/// `[1, 1, l, l]` bias `-log(1 + |i - j|)`
pub fn attention_bias_proximal(length: usize, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(length * length);
    for i in 0..length {
        for j in 0..length {
            let diff = (i as f32 - j as f32).abs();
            data.push(-diff.ln_1p());
        }
    }
    Ok(Tensor::from_vec(data, (1, 1, length, length), device)?)
}

/// `[1, 1, l, l]` band of ones where `|i - j| <= block`
fn block_band_mask(length: usize, block: usize, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(length * length);
    for i in 0..length {
        for j in 0..length {
            data.push(if i.abs_diff(j) <= block { 1f32 } else { 0f32 });
        }
    }
    Ok(Tensor::from_vec(data, (1, 1, length, length), device)?)
}

/// Replace entries of `x` with `value` wherever the broadcast `mask` is zero
pub fn masked_fill(x: &Tensor, mask: &Tensor, value: f32) -> Result<Tensor> {
    let keep = mask
        .to_dtype(DType::F32)?
        .broadcast_as(x.shape())?
        .ne(0f32)?;
    let fill = Tensor::new(value, x.device())?
        .to_dtype(x.dtype())?
        .broadcast_as(x.shape())?;
    Ok(keep.where_cond(x, &fill)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::commons::{channel_mask, lengths_tensor};
    use candle_nn::VarMap;

    fn attention_mask(x_mask: &Tensor) -> Tensor {
        x_mask
            .unsqueeze(2)
            .unwrap()
            .broadcast_mul(&x_mask.unsqueeze(3).unwrap())
            .unwrap()
    }

    #[test]
    fn test_relative_to_absolute_indexing() {
        let device = Device::Cpu;
        let l = 3;
        // rel[i][j] = 10 * i + j
        let data: Vec<f32> = (0..l)
            .flat_map(|i| (0..2 * l - 1).map(move |j| (10 * i + j) as f32))
            .collect();
        let rel = Tensor::from_vec(data, (1, 1, l, 2 * l - 1), &device).unwrap();
        let abs: Vec<Vec<f32>> = relative_to_absolute(&rel)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2()
            .unwrap();

        // abs[i][k] picks relative offset k - i
        for i in 0..l {
            for k in 0..l {
                let j = k + l - 1 - i;
                assert_eq!(abs[i][k], (10 * i + j) as f32, "i={} k={}", i, k);
            }
        }
    }

    #[test]
    fn test_absolute_to_relative_indexing() {
        let device = Device::Cpu;
        let l = 4;
        let data: Vec<f32> = (0..l * l).map(|v| v as f32 + 1.0).collect();
        let abs = Tensor::from_vec(data.clone(), (1, 1, l, l), &device).unwrap();
        let rel: Vec<Vec<f32>> = absolute_to_relative(&abs)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2()
            .unwrap();

        for i in 0..l {
            for j in 0..2 * l - 1 {
                let k = i as isize + j as isize - (l as isize - 1);
                let want = if (0..l as isize).contains(&k) {
                    data[i * l + k as usize]
                } else {
                    0.0
                };
                assert_eq!(rel[i][j], want, "i={} j={}", i, j);
            }
        }
    }

    #[test]
    fn test_get_relative_embeddings_pads_and_slices() {
        let device = Device::Cpu;
        let emb = Tensor::arange(1f32, 6f32, &device).unwrap().reshape((1, 5, 1)).unwrap();

        // window 2, length 2: slice the centre three
        let short: Vec<f32> = get_relative_embeddings(&emb, 2, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(short, vec![2.0, 3.0, 4.0]);

        // window 2, length 5: pad two on each side
        let long: Vec<f32> = get_relative_embeddings(&emb, 2, 5)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(long, vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 0.0, 0.0]);
    }

    #[test]
    fn test_self_attention_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let options = AttentionOptions {
            window_size: Some(4),
            proximal_bias: true,
            block_length: Some(3),
            ..AttentionOptions::default()
        };
        let attn = MultiHeadAttention::new(32, 32, 4, options, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 32, 11), &device).unwrap();
        let x_mask = channel_mask(&lengths_tensor(&[11, 6], &device).unwrap(), 11).unwrap();
        let y = attn.forward(&x, &x, Some(&attention_mask(&x_mask)), false).unwrap();
        assert_eq!(y.dims3().unwrap(), (2, 32, 11));
    }

    #[test]
    fn test_padding_does_not_leak_into_valid_frames() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let options = AttentionOptions {
            window_size: Some(2),
            ..AttentionOptions::default()
        };
        let attn = MultiHeadAttention::new(8, 8, 2, options, vb).unwrap();

        let x_mask = channel_mask(&lengths_tensor(&[5], &device).unwrap(), 8).unwrap();
        let mask = attention_mask(&x_mask);
        let x = Tensor::randn(0f32, 1.0, (1, 8, 8), &device).unwrap();
        let noise = Tensor::randn(0f32, 5.0, (1, 8, 3), &device).unwrap();
        let x_alt = Tensor::cat(&[x.narrow(2, 0, 5).unwrap(), noise], 2).unwrap();

        let y = attn.forward(&x, &x, Some(&mask), false).unwrap().narrow(2, 0, 5).unwrap();
        let y_alt = attn.forward(&x_alt, &x_alt, Some(&mask), false).unwrap().narrow(2, 0, 5).unwrap();
        let diff: f32 = (y - y_alt)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "diff {}", diff);
    }

    #[test]
    fn test_relative_cross_attention_is_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let options = AttentionOptions {
            window_size: Some(4),
            ..AttentionOptions::default()
        };
        let attn = MultiHeadAttention::new(8, 8, 2, options, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 8, 5), &device).unwrap();
        let c = Tensor::randn(0f32, 1.0, (1, 8, 7), &device).unwrap();
        assert!(attn.forward(&x, &c, None, false).is_err());
    }

    #[test]
    fn test_proximal_bias_diagonal_is_zero() {
        let bias: Vec<f32> = attention_bias_proximal(3, &Device::Cpu)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(bias[0], 0.0);
        assert!((bias[1] + 2f32.ln()).abs() < 1e-6);
        assert!((bias[2] + 3f32.ln()).abs() < 1e-6);
    }
}
