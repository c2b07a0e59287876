//! Layer normalization over the channel axis of `[b, c, t]` tensors

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{init, LayerNorm, Module, VarBuilder};

/// LayerNorm applied per frame across channels
///
/// Parameters are stored as `gamma` / `beta`; checkpoints exported with
/// `weight` / `bias` names are accepted too.
#[derive(Debug, Clone)]
pub struct ChannelLayerNorm {
    norm: LayerNorm,
}

impl ChannelLayerNorm {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let (gamma_key, beta_key) = if !vb.contains_tensor("gamma") && vb.contains_tensor("weight") {
            ("weight", "bias")
        } else {
            ("gamma", "beta")
        };
        let gamma = vb.get_with_hints(channels, gamma_key, init::Init::Const(1.0))?;
        let beta = vb.get_with_hints(channels, beta_key, init::ZERO)?;
        Ok(Self {
            norm: LayerNorm::new(gamma, beta, 1e-5),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.transpose(1, 2)?.contiguous()?;
        let x = self.norm.forward(&x)?;
        Ok(x.transpose(1, 2)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, D};
    use candle_nn::VarMap;

    #[test]
    fn test_channel_layer_norm_normalizes_channels() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = ChannelLayerNorm::new(16, vb).unwrap();

        let x = (Tensor::randn(0f32, 3.0, (2, 16, 7), &device).unwrap() + 5.0).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims3().unwrap(), (2, 16, 7));

        let mean: Vec<Vec<f32>> = y.mean(1).unwrap().to_vec2().unwrap();
        for row in mean {
            for v in row {
                assert!(v.abs() < 1e-4);
            }
        }
        let var: f32 = y.sqr().unwrap().mean(D::Minus2).unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!((var - 1.0).abs() < 1e-2);
    }
}
