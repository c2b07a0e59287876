//! Duration modelling: stochastic (flow) and deterministic predictors

mod deterministic;
mod modules;
pub mod spline;
mod stochastic;

pub use deterministic::DurationPredictor;
pub use modules::{build_flow_chain, ConvFlow, DDSConv, DurationFlow, ElementwiseAffine};
pub use spline::piecewise_rational_quadratic_transform;
pub use stochastic::StochasticDurationPredictor;

use anyhow::Result;
use candle_core::Tensor;

/// Either duration predictor behind one interface
pub enum DurationModel {
    Stochastic(StochasticDurationPredictor),
    Deterministic(DurationPredictor),
}

impl DurationModel {
    /// Per-item duration loss `[b]`, not yet normalised by token count
    ///
    /// * `w` - aligned durations `[b, 1, t]`
    pub fn loss(&self, x: &Tensor, x_mask: &Tensor, w: &Tensor, g: Option<&Tensor>, train: bool) -> Result<Tensor> {
        match self {
            DurationModel::Stochastic(sdp) => sdp.forward(x, x_mask, w, g, train),
            DurationModel::Deterministic(dp) => {
                let logw_ = (w.affine(1.0, 1e-6)?.log()?).broadcast_mul(x_mask)?;
                let logw = dp.forward(x, x_mask, g, train)?;
                let b = x.dim(0)?;
                Ok((logw - logw_)?.sqr()?.reshape((b, ()))?.sum(1)?)
            }
        }
    }

    /// Predicted log-durations `[b, 1, t]`
    pub fn predict(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>, noise_scale_w: f64) -> Result<Tensor> {
        match self {
            DurationModel::Stochastic(sdp) => sdp.reverse(x, x_mask, g, noise_scale_w),
            DurationModel::Deterministic(dp) => dp.forward(x, x_mask, g, false),
        }
    }
}
