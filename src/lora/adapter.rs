//! Trainable LoRA matrices attached to every target projection
//!
//! Each adapted projection gets `A` [r, in] and `B` [out, r] in a shared
//! [`nn::VarStore`]. The forward correction is
//! `dropout(x) @ A^T @ B^T * (alpha / r)`, computed in f32. `B` starts at zero
//! so a fresh adapter does not change the base model.

use std::collections::HashMap;
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};

use super::config::AdapterConfig;
use super::error::{LoRAError, LoRAResult};
use crate::constants::ADAPTER_WEIGHTS_FILE;
use crate::model::config::{module_block, LlamaConfig};
use crate::model::linear::LayerDelta;
use crate::model::weights;

const PEFT_PREFIX: &str = "base_model.model.";

/// Which half of a LoRA pair a tensor holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraPart {
    A,
    B,
}

impl LoraPart {
    fn suffix(self) -> &'static str {
        match self {
            LoraPart::A => "lora_A",
            LoraPart::B => "lora_B",
        }
    }
}

/// PEFT tensor name of one half of the pair on `module` in `layer`
pub fn peft_key(layer: usize, module: &str, part: LoraPart) -> Option<String> {
    module_block(module).map(|block| {
        format!(
            "{}model.layers.{}.{}.{}.{}.weight",
            PEFT_PREFIX,
            layer,
            block,
            module,
            part.suffix()
        )
    })
}

/// Split a PEFT tensor name into (layer, module, part)
pub fn parse_peft_key(key: &str) -> Option<(usize, String, LoraPart)> {
    let rest = key.strip_prefix(PEFT_PREFIX)?.strip_prefix("model.layers.")?;
    let rest = rest.strip_suffix(".weight")?;
    let mut parts = rest.split('.');
    let layer = parts.next()?.parse().ok()?;
    let block = parts.next()?;
    let module = parts.next()?;
    let part = match parts.next()? {
        "lora_A" => LoraPart::A,
        "lora_B" => LoraPart::B,
        _ => return None,
    };
    if parts.next().is_some() || module_block(module) != Some(block) {
        return None;
    }
    Some((layer, module.to_string(), part))
}

/// One A/B pair
#[derive(Debug)]
pub struct LoraLayer {
    /// [r, in_features]
    pub lora_a: Tensor,
    /// [out_features, r]
    pub lora_b: Tensor,
}

impl LoraLayer {
    fn new(path: &nn::Path, rank: i64, in_features: i64, out_features: i64) -> Self {
        // Kaiming uniform with a = sqrt(5): bound = 1 / sqrt(fan_in)
        let bound = 1.0 / (in_features as f64).sqrt();
        let lora_a = path.var(
            "lora_a",
            &[rank, in_features],
            nn::Init::Uniform {
                lo: -bound,
                up: bound,
            },
        );
        let lora_b = path.var("lora_b", &[out_features, rank], nn::Init::Const(0.0));
        Self { lora_a, lora_b }
    }

    pub fn num_parameters(&self) -> usize {
        self.lora_a.numel() + self.lora_b.numel()
    }
}

/// LoRA adapters for a whole decoder stack
pub struct LoraAdapter {
    vs: nn::VarStore,
    /// Indexed by decoder layer, then module name
    layers: Vec<HashMap<String, LoraLayer>>,
    config: AdapterConfig,
    scaling: f64,
}

impl std::fmt::Debug for LoraAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraAdapter")
            .field("layers", &self.layers.len())
            .field("r", &self.config.r)
            .field("target_modules", &self.config.target_modules)
            .field("scaling", &self.scaling)
            .finish()
    }
}

impl LoraAdapter {
    /// Create freshly initialized adapters for every target module in every layer
    pub fn new(model_config: &LlamaConfig, config: AdapterConfig, device: Device) -> LoRAResult<Self> {
        config.validate()?;
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let rank = config.r as i64;

        let mut layers = Vec::with_capacity(model_config.num_hidden_layers);
        for idx in 0..model_config.num_hidden_layers {
            let layer_path = root.sub(format!("layer{}", idx));
            let mut modules = HashMap::new();
            for module in &config.target_modules {
                let (in_features, out_features) = model_config
                    .module_dims(module)
                    .ok_or_else(|| LoRAError::ModuleNotFound(module.clone()))?;
                let max = in_features.min(out_features);
                if config.r > max {
                    return Err(LoRAError::InvalidRank { rank: config.r, max });
                }
                let layer = LoraLayer::new(
                    &layer_path.sub(module.as_str()),
                    rank,
                    in_features as i64,
                    out_features as i64,
                );
                modules.insert(module.clone(), layer);
            }
            layers.push(modules);
        }

        let scaling = config.scaling();
        let adapter = Self {
            vs,
            layers,
            config,
            scaling,
        };
        tracing::info!(
            "Created LoRA adapter: r={}, alpha={}, {} projections, {} trainable parameters",
            adapter.config.r,
            adapter.config.lora_alpha,
            adapter.num_adapted(),
            adapter.trainable_parameters()
        );
        Ok(adapter)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn layer(&self, layer: usize, module: &str) -> Option<&LoraLayer> {
        self.layers.get(layer).and_then(|m| m.get(module))
    }

    /// Number of adapted projections
    pub fn num_adapted(&self) -> usize {
        self.layers.iter().map(HashMap::len).sum()
    }

    pub fn trainable_parameters(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|m| m.values())
            .map(LoraLayer::num_parameters)
            .sum()
    }

    /// (layer, module, pair) in layer order, modules sorted by name
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str, &LoraLayer)> {
        self.layers.iter().enumerate().flat_map(|(idx, modules)| {
            let mut entries: Vec<(&String, &LoraLayer)> = modules.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            entries
                .into_iter()
                .map(move |(module, layer)| (idx, module.as_str(), layer))
        })
    }

    /// `scaling * B @ A` for one projection, [out, in] in f32
    pub fn delta_weight(&self, layer: usize, module: &str) -> Option<Tensor> {
        self.layer(layer, module).map(|pair| {
            let _guard = tch::no_grad_guard();
            pair.lora_b.matmul(&pair.lora_a) * self.scaling
        })
    }

    /// Tensors under PEFT names
    pub fn state_dict(&self) -> Vec<(String, Tensor)> {
        let mut tensors = Vec::with_capacity(self.num_adapted() * 2);
        for (idx, module, pair) in self.iter() {
            if let (Some(a_key), Some(b_key)) = (
                peft_key(idx, module, LoraPart::A),
                peft_key(idx, module, LoraPart::B),
            ) {
                tensors.push((a_key, pair.lora_a.detach()));
                tensors.push((b_key, pair.lora_b.detach()));
            }
        }
        tensors
    }

    /// Write `adapter_model.safetensors` and `adapter_config.json` to `dir`
    pub fn save_pretrained(&self, dir: &Path) -> LoRAResult<()> {
        std::fs::create_dir_all(dir)?;
        let metadata: HashMap<String, String> =
            [("format".to_string(), "pt".to_string())].into_iter().collect();
        let bytes = weights::serialize_tensors(&self.state_dict(), Some(metadata))?;
        std::fs::write(dir.join(ADAPTER_WEIGHTS_FILE), bytes)?;

        let mut config = self.config.clone();
        config.inference_mode = true;
        config.save(dir)?;

        tracing::info!(
            "Saved adapter ({} tensors) to {}",
            self.num_adapted() * 2,
            dir.display()
        );
        Ok(())
    }

    /// Load a PEFT adapter directory for `model_config`
    pub fn load_pretrained(dir: &Path, model_config: &LlamaConfig, device: Device) -> LoRAResult<Self> {
        let config = AdapterConfig::load(dir)?;
        let adapter = Self::new(model_config, config, device)?;

        let data = std::fs::read(dir.join(ADAPTER_WEIGHTS_FILE))?;
        let tensors = weights::deserialize_tensors(&data, device, Some(Kind::Float))?;

        let mut loaded = 0usize;
        let _guard = tch::no_grad_guard();
        for (key, tensor) in tensors {
            let (layer, module, part) = parse_peft_key(&key)
                .ok_or_else(|| LoRAError::weight_format(format!("Unexpected adapter tensor '{}'", key)))?;
            let pair = adapter
                .layer(layer, &module)
                .ok_or_else(|| LoRAError::ModuleNotFound(format!("layer {} {}", layer, module)))?;
            let target = match part {
                LoraPart::A => &pair.lora_a,
                LoraPart::B => &pair.lora_b,
            };
            if target.size() != tensor.size() {
                return Err(LoRAError::dimension_mismatch(key, &target.size(), &tensor.size()));
            }
            target.shallow_clone().f_copy_(&tensor)?;
            loaded += 1;
        }

        let expected = adapter.num_adapted() * 2;
        if loaded != expected {
            return Err(LoRAError::weight_format(format!(
                "Adapter in {} holds {} tensors, expected {}",
                dir.display(),
                loaded,
                expected
            )));
        }
        tracing::info!("Loaded adapter from {}", dir.display());
        Ok(adapter)
    }
}

impl LayerDelta for LoraAdapter {
    fn delta(&self, x: &Tensor, layer: usize, module: &str, train: bool) -> anyhow::Result<Option<Tensor>> {
        let Some(pair) = self.layer(layer, module) else {
            return Ok(None);
        };
        let mut hidden = x.f_to_kind(Kind::Float)?;
        if train && self.config.lora_dropout > 0.0 {
            hidden = hidden.dropout(self.config.lora_dropout, true);
        }
        let out = hidden
            .f_matmul(&pair.lora_a.tr())?
            .f_matmul(&pair.lora_b.tr())?;
        Ok(Some(out * self.scaling))
    }
}
