//! Monotonic alignment search
//!
//! Finds the hard monotonic text-to-frame alignment that maximises the
//! summed log-likelihood of the latent frames under the text prior. Each
//! frame is assigned to exactly one token, tokens advance by at most one per
//! frame and every token receives at least one frame.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

const MAX_NEG_VAL: f32 = -1e9;
const LOG_2PI: f64 = 1.837_877_066_409_345_3;

/// Gaussian log-likelihood of every latent frame under every token prior
///
/// * `z_p` - `[b, d, t_y]` flowed posterior latents
/// * `m_p`, `logs_p` - `[b, d, t_x]` prior mean / log-std
///
/// Returns `[b, t_y, t_x]`.
pub fn log_likelihood_matrix(z_p: &Tensor, m_p: &Tensor, logs_p: &Tensor) -> Result<Tensor> {
    let s_p_sq_r = (logs_p * -2.0)?.exp()?;
    // [b, 1, t_x]
    let neg_cent1 = logs_p.affine(-1.0, -0.5 * LOG_2PI)?.sum_keepdim(1)?;
    // [b, t_y, d] x [b, d, t_x]
    let z_p_t = z_p.transpose(1, 2)?.contiguous()?;
    let neg_cent2 = (z_p_t.sqr()? * -0.5)?.matmul(&s_p_sq_r)?;
    let neg_cent3 = z_p_t.matmul(&(m_p * &s_p_sq_r)?)?;
    let neg_cent4 = ((m_p.sqr()? * -0.5)? * &s_p_sq_r)?.sum_keepdim(1)?;

    let neg_cent = (neg_cent2 + neg_cent3)?
        .broadcast_add(&neg_cent1)?
        .broadcast_add(&neg_cent4)?;
    Ok(neg_cent)
}

/// Joint text/frame mask `[b, 1, t_y, t_x]` from `x_mask [b, 1, t_x]` and `y_mask [b, 1, t_y]`
pub fn attention_mask(x_mask: &Tensor, y_mask: &Tensor) -> Result<Tensor> {
    Ok(x_mask.unsqueeze(2)?.broadcast_mul(&y_mask.unsqueeze(3)?)?)
}

/// Batched maximum path
///
/// * `neg_cent` - `[b, t_y, t_x]` scores
/// * `mask` - `[b, t_y, t_x]` joint mask
///
/// Returns a 0/1 `[b, t_y, t_x]` path on the device of `neg_cent`. Items
/// whose valid token count exceeds their frame count are rejected.
pub fn maximum_path(neg_cent: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let device = neg_cent.device().clone();
    let (b, t_y, t_x) = neg_cent.dims3()?;

    let values: Vec<Vec<Vec<f32>>> = neg_cent
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_vec3()?;
    let mask: Vec<Vec<Vec<f32>>> = mask.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_vec3()?;

    let mut path = vec![0f32; b * t_y * t_x];
    for (i, (item_values, item_mask)) in values.into_iter().zip(mask.iter()).enumerate() {
        let valid_y = item_mask.iter().filter(|row| row.first().is_some_and(|&v| v > 0.0)).count();
        let valid_x = item_mask
            .first()
            .map(|row| row.iter().filter(|&&v| v > 0.0).count())
            .unwrap_or(0);
        if valid_x > valid_y {
            anyhow::bail!(
                "no monotonic alignment for batch item {}: {} tokens but only {} frames",
                i,
                valid_x,
                valid_y
            );
        }

        let mut flat: Vec<f32> = item_values.into_iter().flatten().collect();
        let item_path = &mut path[i * t_y * t_x..(i + 1) * t_y * t_x];
        maximum_path_single(&mut flat, item_path, t_x, valid_y, valid_x);
    }

    Ok(Tensor::from_vec(path, (b, t_y, t_x), &device)?)
}

/// Single-item DP over the top-left `t_y x t_x` block of a row-major
/// `stride`-wide matrix; `values` is overwritten with accumulated scores
pub fn maximum_path_single(values: &mut [f32], path: &mut [f32], stride: usize, t_y: usize, t_x: usize) {
    if t_y == 0 || t_x == 0 {
        return;
    }
    let at = |y: usize, x: usize| y * stride + x;

    for y in 0..t_y {
        let x_start = (t_x + y).saturating_sub(t_y);
        let x_end = t_x.min(y + 1);
        for x in x_start..x_end {
            let v_cur = if x == y { MAX_NEG_VAL } else { values[at(y - 1, x)] };
            let v_prev = if x == 0 {
                if y == 0 {
                    0.0
                } else {
                    MAX_NEG_VAL
                }
            } else {
                values[at(y - 1, x - 1)]
            };
            values[at(y, x)] += v_prev.max(v_cur);
        }
    }

    let mut index = t_x - 1;
    for y in (0..t_y).rev() {
        path[at(y, index)] = 1.0;
        if index != 0 && (index == y || (y > 0 && values[at(y - 1, index)] < values[at(y - 1, index - 1)])) {
            index -= 1;
        }
    }
}
