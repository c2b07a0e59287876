//! Generator-side training objectives

use super::generator::VitsTrainOutput;
use anyhow::Result;
use candle_core::Tensor;

/// KL divergence between the posterior sample and the text prior
///
/// `Σ((logs_p - logs_q - 0.5) + 0.5 (z_p - m_p)² exp(-2 logs_p)) · mask / Σ mask`
pub fn kl_loss(z_p: &Tensor, logs_q: &Tensor, m_p: &Tensor, logs_p: &Tensor, z_mask: &Tensor) -> Result<Tensor> {
    let kl = (logs_p - logs_q)?.affine(1.0, -0.5)?;
    let spread = ((z_p - m_p)?.sqr()? * (logs_p * -2.0)?.exp()?)?;
    let kl = (kl + (spread * 0.5)?)?;
    let kl = kl.broadcast_mul(z_mask)?.sum_all()?;
    Ok(kl.broadcast_div(&z_mask.sum_all()?)?)
}

/// Total duration loss over the batch
pub fn duration_loss(l_length: &Tensor) -> Result<Tensor> {
    Ok(l_length.sum_all()?)
}

/// Scalar generator losses for one training pass
#[derive(Debug)]
pub struct GeneratorLosses {
    pub kl: Tensor,
    pub duration: Tensor,
    /// `c_kl * kl + duration`
    pub total: Tensor,
}

impl GeneratorLosses {
    pub fn from_output(output: &VitsTrainOutput, c_kl: f64) -> Result<Self> {
        let kl = kl_loss(&output.z_p, &output.logs_q, &output.m_p, &output.logs_p, &output.y_mask)?;
        let duration = duration_loss(&output.l_length)?;
        let total = ((&kl * c_kl)? + &duration)?;
        Ok(Self { kl, duration, total })
    }

    /// Host values `(kl, duration, total)` for logging
    pub fn to_scalars(&self) -> Result<(f32, f32, f32)> {
        Ok((
            self.kl.to_scalar()?,
            self.duration.to_scalar()?,
            self.total.to_scalar()?,
        ))
    }
}
