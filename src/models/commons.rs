//! Shared tensor helpers used across the VITS components
//!
//! Masks, duration-to-path expansion, segment slicing and the small
//! activations candle does not ship in the shape the model needs.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};

/// Slope used by the HiFi-GAN residual stacks
pub const LRELU_SLOPE: f64 = 0.1;

/// Build a `[b, max_len]` f32 mask with ones where `position < length`
///
/// `lengths` may hold any numeric dtype; fractional lengths are compared as-is.
pub fn sequence_mask(lengths: &Tensor, max_len: usize) -> Result<Tensor> {
    let device = lengths.device();
    let range = Tensor::arange(0u32, max_len as u32, device)?
        .to_dtype(DType::F32)?
        .unsqueeze(0)?;
    let lengths = lengths.to_dtype(DType::F32)?.unsqueeze(1)?;
    Ok(range.broadcast_lt(&lengths)?.to_dtype(DType::F32)?)
}

/// Same as [`sequence_mask`] but shaped `[b, 1, max_len]`, the layout every
/// channel-first module consumes
pub fn channel_mask(lengths: &Tensor, max_len: usize) -> Result<Tensor> {
    Ok(sequence_mask(lengths, max_len)?.unsqueeze(1)?)
}

/// Build a length tensor from host values
pub fn lengths_tensor(lengths: &[usize], device: &Device) -> Result<Tensor> {
    let data: Vec<u32> = lengths.iter().map(|&l| l as u32).collect();
    Ok(Tensor::from_vec(data, lengths.len(), device)?)
}

/// Expand per-token durations into a hard alignment path
///
/// * `duration` - `[b, 1, t_x]` integer-valued durations (frames per token)
/// * `mask` - `[b, 1, t_y, t_x]` joint text/frame mask
///
/// Returns `[b, 1, t_y, t_x]` where frame `y` is assigned to token `x` when
/// `cum[x-1] <= y < cum[x]`.
pub fn generate_path(duration: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (b, _, t_y, t_x) = mask.dims4()?;
    let cum_duration = duration.to_dtype(DType::F32)?.cumsum(D::Minus1)?;
    let cum_flat = cum_duration.reshape((b * t_x,))?;

    // [b * t_x, t_y]: frames covered up to and including token x
    let path = sequence_mask(&cum_flat, t_y)?.reshape((b, t_x, t_y))?;
    // Subtract the coverage of token x-1 to keep only token x's own span
    let shifted = path.pad_with_zeros(1, 1, 0)?.narrow(1, 0, t_x)?;
    let path = (path - shifted)?;

    let path = path.unsqueeze(1)?.transpose(2, 3)?;
    Ok(path.broadcast_mul(&mask.to_dtype(DType::F32)?)?)
}

/// Copy a `[b, d, segment_size]` window out of `x` starting at `ids_start[i]`
///
/// Frames past the end of `x` are zero-filled.
pub fn slice_segments(x: &Tensor, ids_start: &[usize], segment_size: usize) -> Result<Tensor> {
    let (b, d, t) = x.dims3()?;
    if ids_start.len() != b {
        anyhow::bail!(
            "slice_segments: {} start indices for batch of {}",
            ids_start.len(),
            b
        );
    }

    let mut segments = Vec::with_capacity(b);
    for (i, &start) in ids_start.iter().enumerate() {
        let item = x.narrow(0, i, 1)?;
        let start = start.min(t);
        let available = (t - start).min(segment_size);
        let seg = if available == 0 {
            Tensor::zeros((1, d, segment_size), x.dtype(), x.device())?
        } else {
            item.narrow(2, start, available)?
                .pad_with_zeros(2, 0, segment_size - available)?
        };
        segments.push(seg);
    }
    Ok(Tensor::cat(&segments, 0)?)
}

/// Pick a random training window per batch item and slice it out
///
/// Start indices are drawn uniformly from `[0, len - segment_size]`; items
/// shorter than the window start at 0 and are zero-padded.
pub fn rand_slice_segments(
    x: &Tensor,
    lengths: &[usize],
    segment_size: usize,
) -> Result<(Tensor, Vec<usize>)> {
    let b = x.dim(0)?;
    let u: Vec<f32> = Tensor::rand(0f32, 1f32, (b,), x.device())?.to_vec1()?;
    let ids_start: Vec<usize> = lengths
        .iter()
        .zip(u.iter())
        .map(|(&len, &r)| {
            let max_start = (len + 1).saturating_sub(segment_size).max(1);
            ((r * max_start as f32) as usize).min(max_start - 1)
        })
        .collect();
    let segments = slice_segments(x, &ids_start, segment_size)?;
    Ok((segments, ids_start))
}

/// WaveNet gate: `tanh(a + b)[:n] * sigmoid(a + b)[n:]` along channels
pub fn fused_add_tanh_sigmoid_multiply(a: &Tensor, b: &Tensor, n_channels: usize) -> Result<Tensor> {
    let in_act = a.broadcast_add(b)?;
    let t_act = in_act.narrow(1, 0, n_channels)?.tanh()?;
    let s_act = candle_nn::ops::sigmoid(&in_act.narrow(1, n_channels, n_channels)?)?;
    Ok((t_act * s_act)?)
}

/// Leaky ReLU for slopes in `[0, 1)`
pub fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    Ok(x.maximum(&(x * slope)?)?)
}

/// Numerically stable `log(1 + exp(x))`
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok((x.relu()? + tail)?)
}

/// `log(sigmoid(x))`
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    Ok(softplus(&x.neg()?)?.neg()?)
}

/// Reverse the channel axis (dim 1)
pub fn flip_channels(x: &Tensor) -> Result<Tensor> {
    let c = x.dim(1)?;
    let idx: Vec<u32> = (0..c as u32).rev().collect();
    let idx = Tensor::from_vec(idx, c, x.device())?;
    Ok(x.index_select(&idx, 1)?)
}

/// Sum over every axis except the batch axis, giving `[b]`
pub fn sum_except_batch(x: &Tensor) -> Result<Tensor> {
    let b = x.dim(0)?;
    Ok(x.reshape((b, ()))?.sum(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_mask() {
        let device = Device::Cpu;
        let lengths = lengths_tensor(&[3, 1], &device).unwrap();
        let mask: Vec<Vec<f32>> = sequence_mask(&lengths, 4).unwrap().to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1.0, 1.0, 1.0, 0.0], vec![1.0, 0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_generate_path_spans() {
        let device = Device::Cpu;
        // Token durations 2, 1, 3 -> frames [0,0,1,2,2,2]
        let duration = Tensor::new(&[[[2.0f32, 1.0, 3.0]]], &device).unwrap();
        let mask = Tensor::ones((1, 1, 6, 3), DType::F32, &device).unwrap();
        let path = generate_path(&duration, &mask).unwrap();
        assert_eq!(path.dims(), &[1, 1, 6, 3]);

        let rows: Vec<Vec<f32>> = path.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        let expected_token = [0usize, 0, 1, 2, 2, 2];
        for (y, row) in rows.iter().enumerate() {
            for (x, &v) in row.iter().enumerate() {
                let want = if x == expected_token[y] { 1.0 } else { 0.0 };
                assert_eq!(v, want, "frame {} token {}", y, x);
            }
        }
    }

    #[test]
    fn test_generate_path_respects_mask() {
        let device = Device::Cpu;
        let duration = Tensor::new(&[[[2.0f32, 2.0]]], &device).unwrap();
        // Only the first 3 frames are valid
        let y_mask = Tensor::new(&[1.0f32, 1.0, 1.0, 0.0], &device)
            .unwrap()
            .reshape((1, 1, 4, 1))
            .unwrap();
        let mask = y_mask.broadcast_as((1, 1, 4, 2)).unwrap().contiguous().unwrap();
        let path = generate_path(&duration, &mask).unwrap();
        let total: f32 = path.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 3.0);
    }

    #[test]
    fn test_slice_segments_pads_past_end() {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 10f32, &device).unwrap().reshape((1, 1, 10)).unwrap();
        let seg = slice_segments(&x, &[7], 5).unwrap();
        let values: Vec<f32> = seg.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![7.0, 8.0, 9.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rand_slice_segments_in_range() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (3, 4, 40), &device).unwrap();
        let (seg, ids) = rand_slice_segments(&x, &[40, 20, 8], 10).unwrap();
        assert_eq!(seg.dims3().unwrap(), (3, 4, 10));
        assert!(ids[0] <= 30);
        assert!(ids[1] <= 10);
        assert_eq!(ids[2], 0);
    }

    #[test]
    fn test_softplus_and_log_sigmoid() {
        let device = Device::Cpu;
        let x = Tensor::new(&[-30.0f32, 0.0, 30.0], &device).unwrap();
        let sp: Vec<f32> = softplus(&x).unwrap().to_vec1().unwrap();
        assert!(sp[0].abs() < 1e-6);
        assert!((sp[1] - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((sp[2] - 30.0).abs() < 1e-4);

        let ls: Vec<f32> = log_sigmoid(&x).unwrap().to_vec1().unwrap();
        assert!((ls[1] + std::f32::consts::LN_2).abs() < 1e-6);
        assert!(ls[2].abs() < 1e-6);
    }

    #[test]
    fn test_flip_channels() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[1.0f32], [2.0], [3.0]]], &device).unwrap();
        let y: Vec<f32> = flip_channels(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_leaky_relu() {
        let device = Device::Cpu;
        let x = Tensor::new(&[-2.0f32, 3.0], &device).unwrap();
        let y: Vec<f32> = leaky_relu(&x, LRELU_SLOPE).unwrap().to_vec1().unwrap();
        assert!((y[0] + 0.2).abs() < 1e-6);
        assert_eq!(y[1], 3.0);
    }
}
