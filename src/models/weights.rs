//! VITS checkpoint loading
//!
//! Reads a safetensors export of the generator and folds weight
//! normalization into plain weights so every layer can ask its
//! `VarBuilder` for `weight`. Both the legacy `weight_g` / `weight_v` pair
//! and the parametrization form (`parametrizations.weight.original0/1`)
//! are handled.

use anyhow::{Context, Result};
use candle_core::{safetensors, DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::{HashMap, HashSet};
use std::path::Path;

const PARAM_G: &str = ".parametrizations.weight.original0";
const PARAM_V: &str = ".parametrizations.weight.original1";

/// Load generator weights from a safetensors file with weight norm folded
pub fn load_vits_weights<P: AsRef<Path>>(path: P, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    tracing::info!("Loading VITS weights from {:?}", path);

    let tensors = safetensors::load(path, device)
        .with_context(|| format!("Failed to load VITS weights from {:?}", path))?;
    tracing::info!("Loaded {} tensors", tensors.len());

    let converted = fold_weight_norm(tensors)?;
    tracing::info!("Converted to {} tensors", converted.len());
    Ok(converted)
}

/// Wrap a folded tensor map in a `VarBuilder`, casting to f32
pub fn var_builder_from_weights(weights: HashMap<String, Tensor>, device: &Device) -> VarBuilder<'static> {
    VarBuilder::from_tensors(weights, DType::F32, device)
}

/// Replace every weight-normalized pair with its effective `weight`
pub fn fold_weight_norm(tensors: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    let mut converted = HashMap::with_capacity(tensors.len());
    let mut consumed = HashSet::new();

    for (name, tensor) in tensors.iter() {
        let pair = if let Some(base) = name.strip_suffix(".weight_v") {
            Some((base, format!("{}.weight_g", base)))
        } else {
            name.strip_suffix(PARAM_V)
                .map(|base| (base, format!("{}{}", base, PARAM_G)))
        };

        let Some((base, g_name)) = pair else {
            continue;
        };
        let weight = match tensors.get(&g_name) {
            Some(weight_g) => apply_weight_norm(weight_g, tensor)
                .with_context(|| format!("Failed to fold weight norm for {}", base))?,
            None => {
                tracing::warn!("{} has no magnitude tensor, using direction as weight", name);
                tensor.clone()
            }
        };
        converted.insert(format!("{}.weight", base), weight);
        consumed.insert(name.clone());
        consumed.insert(g_name);
    }

    for (name, tensor) in tensors {
        if !consumed.contains(&name) {
            converted.insert(name, tensor);
        }
    }
    Ok(converted)
}

/// Apply weight normalization: weight = g * (v / ||v||), norm over all dims but the first
pub fn apply_weight_norm(weight_g: &Tensor, weight_v: &Tensor) -> Result<Tensor> {
    let rank = weight_v.rank();
    let v_flat = if rank > 1 {
        weight_v.flatten(1, rank - 1)?
    } else {
        weight_v.unsqueeze(1)?
    };
    let norm = v_flat.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12, f64::MAX)?;

    let mut norm_shape = vec![weight_v.dims()[0]];
    norm_shape.resize(rank.max(1), 1);
    let norm = norm.reshape(norm_shape.clone())?;

    let weight_g = weight_g.reshape(norm_shape)?;
    let v_normalized = weight_v.broadcast_div(&norm)?;
    weight_g.broadcast_mul(&v_normalized).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_norm() {
        let device = Device::Cpu;
        let weight_v = Tensor::new(&[[[1.0f32, 2.0, 3.0]]], &device).unwrap(); // [1, 1, 3]
        let weight_g = Tensor::new(&[[[2.0f32]]], &device).unwrap(); // [1, 1, 1]

        let weight = apply_weight_norm(&weight_g, &weight_v).unwrap();

        // ||v|| = sqrt(14); weight = 2 * v / sqrt(14)
        let values: Vec<f32> = weight.flatten_all().unwrap().to_vec1().unwrap();
        assert!((values[0] - 0.535).abs() < 0.01);
        assert!((values[1] - 1.069).abs() < 0.01);
        assert!((values[2] - 1.604).abs() < 0.01);
    }

    #[test]
    fn test_fold_weight_norm_both_layouts() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        let v = Tensor::randn(0f32, 1.0, (4, 2, 3), &device).unwrap();
        let g = Tensor::ones((4, 1, 1), DType::F32, &device).unwrap();
        tensors.insert("dec.conv_pre.weight_v".to_string(), v.clone());
        tensors.insert("dec.conv_pre.weight_g".to_string(), g.clone());
        tensors.insert("dec.ups.0.parametrizations.weight.original1".to_string(), v);
        tensors.insert("dec.ups.0.parametrizations.weight.original0".to_string(), g);
        tensors.insert(
            "dec.conv_pre.bias".to_string(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
        );

        let folded = fold_weight_norm(tensors).unwrap();
        assert_eq!(folded.len(), 3);
        assert!(folded.contains_key("dec.conv_pre.weight"));
        assert!(folded.contains_key("dec.ups.0.weight"));
        assert!(folded.contains_key("dec.conv_pre.bias"));

        // Unit magnitude: every output filter has norm 1
        let w = folded.get("dec.conv_pre.weight").unwrap();
        let norms: Vec<f32> = w
            .flatten(1, 2)
            .unwrap()
            .sqr()
            .unwrap()
            .sum(1)
            .unwrap()
            .to_vec1()
            .unwrap();
        for n in norms {
            assert!((n - 1.0).abs() < 1e-4);
        }
    }
}
