//! Flow-based stochastic duration predictor
//!
//! Training evaluates a variational bound on `-log p(d | text)` with
//! dequantized durations; inference draws noise and runs the main flow
//! chain backwards to sample log-durations.
//!
//! Checkpoint keys: `pre`, `convs`, `proj`, `post_pre`, `post_convs`,
//! `post_proj`, `cond`, `flows.{i}`, `post_flows.{i}`.

use super::modules::{build_flow_chain, DDSConv, DurationFlow};
use crate::models::commons::{log_sigmoid, sum_except_batch};
use crate::models::layers::{Conv1d, ConvSpec};
use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

const LOG_2PI: f64 = 1.837_877_066_409_345_3;

pub struct StochasticDurationPredictor {
    log_flow: DurationFlow,
    flows: Vec<DurationFlow>,
    post_pre: Conv1d,
    post_proj: Conv1d,
    post_convs: DDSConv,
    post_flows: Vec<DurationFlow>,
    pre: Conv1d,
    proj: Conv1d,
    convs: DDSConv,
    cond: Option<Conv1d>,
}

impl StochasticDurationPredictor {
    /// `filter_channels` is tied to `in_channels`, matching released checkpoints
    pub fn new(
        in_channels: usize,
        kernel_size: usize,
        p_dropout: f32,
        n_flows: usize,
        gin_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let filter_channels = in_channels;

        let flows = build_flow_chain(filter_channels, kernel_size, n_flows, vb.pp("flows"))?;
        let post_flows = build_flow_chain(filter_channels, kernel_size, n_flows, vb.pp("post_flows"))?;

        let post_pre = Conv1d::new(1, filter_channels, 1, ConvSpec::default(), vb.pp("post_pre"))?;
        let post_proj = Conv1d::new(filter_channels, filter_channels, 1, ConvSpec::default(), vb.pp("post_proj"))?;
        let post_convs = DDSConv::new(filter_channels, kernel_size, 3, p_dropout, vb.pp("post_convs"))?;

        let pre = Conv1d::new(in_channels, filter_channels, 1, ConvSpec::default(), vb.pp("pre"))?;
        let proj = Conv1d::new(filter_channels, filter_channels, 1, ConvSpec::default(), vb.pp("proj"))?;
        let convs = DDSConv::new(filter_channels, kernel_size, 3, p_dropout, vb.pp("convs"))?;

        let cond = if gin_channels > 0 {
            Some(Conv1d::new(gin_channels, filter_channels, 1, ConvSpec::default(), vb.pp("cond"))?)
        } else {
            None
        };

        Ok(Self {
            log_flow: DurationFlow::Log,
            flows,
            post_pre,
            post_proj,
            post_convs,
            post_flows,
            pre,
            proj,
            convs,
            cond,
        })
    }

    /// Text-side conditioning shared by training and sampling
    fn condition(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let x = self.pre.forward(&x.detach())?;
        let x = match (g, &self.cond) {
            (Some(g), Some(cond)) => x.broadcast_add(&cond.forward(&g.detach())?)?,
            _ => x,
        };
        let x = self.convs.forward(&x, x_mask, None, train)?;
        Ok(self.proj.forward(&x)?.broadcast_mul(x_mask)?)
    }

    /// Negative variational lower bound per batch item `[b]`
    ///
    /// * `x` - text encoder hidden states `[b, c, t]`
    /// * `w` - aligned durations in frames `[b, 1, t]`
    pub fn forward(
        &self,
        x: &Tensor,
        x_mask: &Tensor,
        w: &Tensor,
        g: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let x = self.condition(x, x_mask, g, train)?;
        let (b, _, t) = x.dims3()?;

        let h_w = self.post_pre.forward(w)?;
        let h_w = self.post_convs.forward(&h_w, x_mask, None, train)?;
        let h_w = self.post_proj.forward(&h_w)?.broadcast_mul(x_mask)?;
        let post_cond = (&x + &h_w)?;

        // Dequantization noise q(u, nu | w)
        let e_q = Tensor::randn(0f32, 1.0, (b, 2, t), x.device())?
            .to_dtype(x.dtype())?
            .broadcast_mul(x_mask)?;
        let mut z_q = e_q.clone();
        let mut logdet_tot_q = Tensor::zeros(b, x.dtype(), x.device())?;
        for flow in &self.post_flows {
            let (z, logdet) = flow.forward(&z_q, x_mask, Some(&post_cond))?;
            z_q = z;
            logdet_tot_q = (logdet_tot_q + logdet)?;
        }
        let z_u = z_q.narrow(1, 0, 1)?;
        let z1 = z_q.narrow(1, 1, 1)?;
        let u = candle_nn::ops::sigmoid(&z_u)?.broadcast_mul(x_mask)?;
        let z0 = (w - u)?.broadcast_mul(x_mask)?;

        let sigmoid_terms = (log_sigmoid(&z_u)? + log_sigmoid(&z_u.neg()?)?)?.broadcast_mul(x_mask)?;
        logdet_tot_q = (logdet_tot_q + sum_except_batch(&sigmoid_terms)?)?;
        let log_q = (sum_except_batch(
            &(e_q.sqr()?.affine(-0.5, -0.5 * LOG_2PI)?).broadcast_mul(x_mask)?,
        )? - logdet_tot_q)?;

        // p(d | text) through the main flow chain
        let (z0, logdet_log) = self.log_flow.forward(&z0, x_mask, None)?;
        let mut logdet_tot = logdet_log;
        let mut z = Tensor::cat(&[&z0, &z1], 1)?;
        for flow in &self.flows {
            let (next, logdet) = flow.forward(&z, x_mask, Some(&x))?;
            z = next;
            logdet_tot = (logdet_tot + logdet)?;
        }
        let nll = (sum_except_batch(&z.sqr()?.affine(0.5, 0.5 * LOG_2PI)?.broadcast_mul(x_mask)?)? - logdet_tot)?;
        Ok((nll + log_q)?)
    }

    /// Sample log-durations `[b, 1, t]`
    pub fn reverse(&self, x: &Tensor, x_mask: &Tensor, g: Option<&Tensor>, noise_scale: f64) -> Result<Tensor> {
        let x = self.condition(x, x_mask, g, false)?;
        let (b, _, t) = x.dims3()?;

        // Reversed chain without the first ConvFlow, which only feeds the discarded channel
        let mut rev: Vec<&DurationFlow> = self.flows.iter().rev().collect();
        let affine = rev.pop();
        rev.pop();
        rev.extend(affine);

        let mut z = (Tensor::randn(0f32, 1.0, (b, 2, t), x.device())?.to_dtype(DType::F32)? * noise_scale)?;
        for flow in rev {
            z = flow.reverse(&z, x_mask, Some(&x))?;
        }
        Ok(z.narrow(1, 0, 1)?)
    }
}
