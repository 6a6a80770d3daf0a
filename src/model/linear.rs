//! Bias-free linear projections over dense or 4-bit weights

use anyhow::Result;
use tch::{Kind, Tensor};

use super::quant::QuantizedTensor;

/// Per-layer correction added on top of a frozen projection.
///
/// Implemented by LoRA adapters; the model only knows layer index and module
/// name of each projection.
pub trait LayerDelta {
    /// Correction for `module` of decoder layer `layer` applied to input `x`,
    /// or `None` when that projection is not adapted.
    fn delta(&self, x: &Tensor, layer: usize, module: &str, train: bool) -> Result<Option<Tensor>>;
}

/// Frozen weight storage, HF layout [out_features, in_features]
#[derive(Debug)]
pub enum LinearWeight {
    Dense(Tensor),
    Quantized(QuantizedTensor),
}

/// A named projection of a decoder layer
#[derive(Debug)]
pub struct Linear {
    weight: LinearWeight,
    layer: usize,
    module: &'static str,
}

impl Linear {
    pub fn new(weight: LinearWeight, layer: usize, module: &'static str) -> Self {
        Self {
            weight,
            layer,
            module,
        }
    }

    /// output = x @ W^T (+ delta)
    pub fn forward(&self, x: &Tensor, delta: Option<&dyn LayerDelta>, train: bool) -> Result<Tensor> {
        let output = match &self.weight {
            LinearWeight::Dense(w) => x.f_matmul(&w.tr())?,
            LinearWeight::Quantized(q) => {
                let w = q.dequantize(x.kind())?;
                x.f_matmul(&w.tr())?
            }
        };

        match delta {
            Some(delta) => match delta.delta(x, self.layer, self.module, train)? {
                Some(correction) => Ok(output + correction.to_kind(x.kind())),
                None => Ok(output),
            },
            None => Ok(output),
        }
    }

    /// Dense copy of the weight in `kind`
    pub fn dense_weight(&self, kind: Kind) -> Result<Tensor> {
        match &self.weight {
            LinearWeight::Dense(w) => Ok(w.to_kind(kind)),
            LinearWeight::Quantized(q) => Ok(q.dequantize(kind)?),
        }
    }

    pub fn numel(&self) -> usize {
        match &self.weight {
            LinearWeight::Dense(w) => w.numel(),
            LinearWeight::Quantized(q) => q.numel(),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.weight, LinearWeight::Quantized(_))
    }

    pub fn module(&self) -> &'static str {
        self.module
    }
}
