//! Monotonic rational-quadratic spline with linear tails
//!
//! Element-wise bijection on `[-tail_bound, tail_bound]` parameterised by
//! `num_bins` widths, heights and interior knot derivatives; identity
//! outside the interval. Used as the coupling transform of `ConvFlow`.

use anyhow::Result;
use candle_core::{DType, Tensor, D};

pub const DEFAULT_MIN_BIN_WIDTH: f64 = 1e-3;
pub const DEFAULT_MIN_BIN_HEIGHT: f64 = 1e-3;
pub const DEFAULT_MIN_DERIVATIVE: f64 = 1e-3;

const SEARCH_EPS: f64 = 1e-6;

/// Apply the spline with linear tails
///
/// * `inputs` - `[...]`
/// * `unnormalized_widths`, `unnormalized_heights` - `[..., num_bins]`
/// * `unnormalized_derivatives` - `[..., num_bins - 1]` interior knots
///
/// Returns `(outputs, logabsdet)` both shaped like `inputs`. With `inverse`
/// the inverse map and the log-determinant of the inverse are returned.
pub fn piecewise_rational_quadratic_transform(
    inputs: &Tensor,
    unnormalized_widths: &Tensor,
    unnormalized_heights: &Tensor,
    unnormalized_derivatives: &Tensor,
    inverse: bool,
    tail_bound: f64,
) -> Result<(Tensor, Tensor)> {
    // Boundary derivatives are pinned to 1 so the tails join smoothly
    let constant = ((1.0 - DEFAULT_MIN_DERIVATIVE).exp() - 1.0).ln();
    let rank = unnormalized_derivatives.rank();
    let mut edge_shape = unnormalized_derivatives.dims().to_vec();
    edge_shape[rank - 1] = 1;
    let edge = Tensor::full(constant as f32, edge_shape, inputs.device())?
        .to_dtype(unnormalized_derivatives.dtype())?;
    let derivatives = Tensor::cat(&[&edge, unnormalized_derivatives, &edge], D::Minus1)?;

    let inside = inputs
        .ge(-tail_bound)?
        .mul(&inputs.le(tail_bound)?)?;
    let clamped = inputs.clamp(-tail_bound, tail_bound)?;

    let (spline_out, spline_lad) = rational_quadratic_spline(
        &clamped,
        unnormalized_widths,
        unnormalized_heights,
        &derivatives,
        inverse,
        tail_bound,
    )?;

    let outputs = inside.where_cond(&spline_out, inputs)?;
    let logabsdet = inside.where_cond(&spline_lad, &spline_lad.zeros_like()?)?;
    Ok((outputs, logabsdet))
}

/// Cumulative knot positions spanning `[low, high]` exactly
fn knot_positions(bins: &Tensor, low: f64, high: f64) -> Result<Tensor> {
    let num_bins = bins.dim(D::Minus1)?;
    let cum = bins.cumsum(D::Minus1)?.affine(high - low, low)?;
    let low_edge = cum.narrow(D::Minus1, 0, 1)?.ones_like()?.affine(0.0, low)?;
    let high_edge = low_edge.ones_like()?.affine(0.0, high)?;
    let interior = cum.narrow(D::Minus1, 0, num_bins - 1)?;
    Ok(Tensor::cat(&[&low_edge, &interior, &high_edge], D::Minus1)?)
}

/// Index of the bin containing each input: `sum(x >= knots) - 1`
fn search_sorted(knots: &Tensor, inputs: &Tensor) -> Result<Tensor> {
    let n = knots.dim(D::Minus1)?;
    let last = knots.narrow(D::Minus1, n - 1, 1)?.affine(1.0, SEARCH_EPS)?;
    let knots = Tensor::cat(&[&knots.narrow(D::Minus1, 0, n - 1)?, &last], D::Minus1)?;
    let count = inputs
        .unsqueeze(D::Minus1)?
        .broadcast_ge(&knots)?
        .to_dtype(DType::F32)?
        .sum_keepdim(D::Minus1)?;
    // Valid bins are 0..n-2
    let idx = (count - 1.0)?.clamp(0.0, (n - 2) as f64)?;
    Ok(idx.to_dtype(DType::U32)?)
}

fn gather_last(x: &Tensor, idx: &Tensor) -> Result<Tensor> {
    Ok(x.contiguous()?.gather(idx, D::Minus1)?.squeeze(D::Minus1)?)
}

fn rational_quadratic_spline(
    inputs: &Tensor,
    unnormalized_widths: &Tensor,
    unnormalized_heights: &Tensor,
    derivatives: &Tensor,
    inverse: bool,
    bound: f64,
) -> Result<(Tensor, Tensor)> {
    let num_bins = unnormalized_widths.dim(D::Minus1)?;
    if DEFAULT_MIN_BIN_WIDTH * num_bins as f64 > 1.0 || DEFAULT_MIN_BIN_HEIGHT * num_bins as f64 > 1.0 {
        anyhow::bail!("minimal bin size too large for {} bins", num_bins);
    }
    let (left, right, bottom, top) = (-bound, bound, -bound, bound);

    let widths = candle_nn::ops::softmax(unnormalized_widths, D::Minus1)?
        .affine(1.0 - DEFAULT_MIN_BIN_WIDTH * num_bins as f64, DEFAULT_MIN_BIN_WIDTH)?;
    let cumwidths = knot_positions(&widths, left, right)?;
    let widths = (cumwidths.narrow(D::Minus1, 1, num_bins)? - cumwidths.narrow(D::Minus1, 0, num_bins)?)?;

    let derivatives = crate::models::commons::softplus(derivatives)?.affine(1.0, DEFAULT_MIN_DERIVATIVE)?;

    let heights = candle_nn::ops::softmax(unnormalized_heights, D::Minus1)?
        .affine(1.0 - DEFAULT_MIN_BIN_HEIGHT * num_bins as f64, DEFAULT_MIN_BIN_HEIGHT)?;
    let cumheights = knot_positions(&heights, bottom, top)?;
    let heights = (cumheights.narrow(D::Minus1, 1, num_bins)? - cumheights.narrow(D::Minus1, 0, num_bins)?)?;

    let bin_idx = if inverse {
        search_sorted(&cumheights, inputs)?
    } else {
        search_sorted(&cumwidths, inputs)?
    };

    let input_cumwidths = gather_last(&cumwidths, &bin_idx)?;
    let input_bin_widths = gather_last(&widths, &bin_idx)?;
    let input_cumheights = gather_last(&cumheights, &bin_idx)?;
    let delta = (&heights / &widths)?;
    let input_delta = gather_last(&delta, &bin_idx)?;
    let input_derivatives = gather_last(&derivatives, &bin_idx)?;
    let input_derivatives_plus_one = gather_last(&derivatives.narrow(D::Minus1, 1, num_bins)?, &bin_idx)?;
    let input_heights = gather_last(&heights, &bin_idx)?;

    // d_k + d_{k+1} - 2 * delta_k
    let slope_sum = ((&input_derivatives + &input_derivatives_plus_one)? - (&input_delta * 2.0)?)?;

    if inverse {
        let shifted = (inputs - &input_cumheights)?;
        let a = ((&shifted * &slope_sum)? + (&input_heights * (&input_delta - &input_derivatives)?)?)?;
        let b = ((&input_heights * &input_derivatives)? - (&shifted * &slope_sum)?)?;
        let c = (input_delta.neg()? * &shifted)?;

        let discriminant = (b.sqr()? - ((&a * &c)? * 4.0)?)?.relu()?;
        let root = ((&c * 2.0)? / (b.neg()? - discriminant.sqrt()?)?)?;
        let outputs = ((&root * &input_bin_widths)? + &input_cumwidths)?;

        let theta_one_minus_theta = (&root * root.affine(-1.0, 1.0)?)?;
        let denominator = (&input_delta + (&slope_sum * &theta_one_minus_theta)?)?;
        let derivative_numerator = (input_delta.sqr()?
            * (((&input_derivatives_plus_one * root.sqr()?)? + ((&input_delta * 2.0)? * &theta_one_minus_theta)?)?
                + (&input_derivatives * root.affine(-1.0, 1.0)?.sqr()?)?)?)?;
        let logabsdet = (derivative_numerator.log()? - (denominator.log()? * 2.0)?)?;
        Ok((outputs, logabsdet.neg()?))
    } else {
        let theta = ((inputs - &input_cumwidths)? / &input_bin_widths)?;
        let theta_one_minus_theta = (&theta * theta.affine(-1.0, 1.0)?)?;

        let numerator = (&input_heights
            * ((&input_delta * theta.sqr()?)? + (&input_derivatives * &theta_one_minus_theta)?)?)?;
        let denominator = (&input_delta + (&slope_sum * &theta_one_minus_theta)?)?;
        let outputs = (&input_cumheights + (numerator / &denominator)?)?;

        let derivative_numerator = (input_delta.sqr()?
            * (((&input_derivatives_plus_one * theta.sqr()?)? + ((&input_delta * 2.0)? * &theta_one_minus_theta)?)?
                + (&input_derivatives * theta.affine(-1.0, 1.0)?.sqr()?)?)?)?;
        let logabsdet = (derivative_numerator.log()? - (denominator.log()? * 2.0)?)?;
        Ok((outputs, logabsdet))
    }
}
