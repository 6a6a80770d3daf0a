//! Folding adapters into base weights

use std::collections::HashMap;
use tch::{Kind, Tensor};

use super::adapter::LoraAdapter;
use super::error::{LoRAError, LoRAResult};
use crate::model::config::projection_key;

/// W' = W + (B @ A) * scaling, computed in f32 and cast back to W's kind
pub fn merge_into_base(
    base_weight: &Tensor,
    lora_a: &Tensor,
    lora_b: &Tensor,
    scaling: f64,
) -> LoRAResult<Tensor> {
    let _guard = tch::no_grad_guard();
    let (out_features, in_features) = base_weight.size2()?;
    let (rank, a_in) = lora_a.size2()?;
    let (b_out, b_rank) = lora_b.size2()?;
    if a_in != in_features || b_out != out_features || b_rank != rank {
        return Err(LoRAError::dimension_mismatch(
            "merge",
            &[out_features, in_features],
            &[b_out, b_rank, rank, a_in],
        ));
    }

    let device = base_weight.device();
    let delta = lora_b
        .f_to_device(device)?
        .f_to_kind(Kind::Float)?
        .f_matmul(&lora_a.f_to_device(device)?.f_to_kind(Kind::Float)?)?;
    let merged = base_weight.f_to_kind(Kind::Float)? + delta * scaling;
    Ok(merged.f_to_kind(base_weight.kind())?)
}

/// Merge every adapted projection of `adapter` into a HF-named state dict.
///
/// Returns the number of weights replaced.
pub fn merge_state_dict(
    state_dict: &mut HashMap<String, Tensor>,
    adapter: &LoraAdapter,
) -> LoRAResult<usize> {
    let mut merged = 0usize;
    for (layer, module, pair) in adapter.iter() {
        let key = projection_key(layer, module)
            .ok_or_else(|| LoRAError::ModuleNotFound(module.to_string()))?;
        let base = state_dict
            .get(&key)
            .ok_or_else(|| LoRAError::ModuleNotFound(key.clone()))?;
        let updated = merge_into_base(base, &pair.lora_a, &pair.lora_b, adapter.scaling())?;
        tracing::debug!("Merged adapter into {}", key);
        state_dict.insert(key, updated);
        merged += 1;
    }
    tracing::info!("Merged {} adapted projections into base weights", merged);
    Ok(merged)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn test_merge_formula() {
        let base = Tensor::zeros([2, 3], (Kind::Float, Device::Cpu));
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0]).view([1, 3]);
        let b = Tensor::from_slice(&[1.0f32, -1.0]).view([2, 1]);
        let merged = merge_into_base(&base, &a, &b, 2.0).expect("test: merge");
        let expected = Tensor::from_slice(&[2.0f32, 4.0, 6.0, -2.0, -4.0, -6.0]).view([2, 3]);
        assert!(merged.allclose(&expected, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_zero_b_keeps_base_and_kind() {
        let base = Tensor::randn([4, 6], (Kind::Float, Device::Cpu)).to_kind(Kind::Half);
        let a = Tensor::randn([2, 6], (Kind::Float, Device::Cpu));
        let b = Tensor::zeros([4, 2], (Kind::Float, Device::Cpu));
        let merged = merge_into_base(&base, &a, &b, 2.0).expect("test: merge");
        assert_eq!(merged.kind(), Kind::Half);
        assert!(merged.to_kind(Kind::Float).allclose(&base.to_kind(Kind::Float), 0.0, 0.0, false));
    }

    #[test]
    fn test_shape_mismatch() {
        let base = Tensor::zeros([4, 6], (Kind::Float, Device::Cpu));
        let a = Tensor::zeros([2, 5], (Kind::Float, Device::Cpu));
        let b = Tensor::zeros([4, 2], (Kind::Float, Device::Cpu));
        assert!(matches!(
            merge_into_base(&base, &a, &b, 1.0),
            Err(LoRAError::DimensionMismatch { .. })
        ));
    }
}
