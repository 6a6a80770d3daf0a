//! `config.json` for Llama-architecture causal LMs

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

/// Sub-block of a decoder layer holding `module`
pub fn module_block(module: &str) -> Option<&'static str> {
    match module {
        "q_proj" | "k_proj" | "v_proj" | "o_proj" => Some("self_attn"),
        "gate_proj" | "up_proj" | "down_proj" => Some("mlp"),
        _ => None,
    }
}

/// HF state-dict name of a decoder projection weight
pub fn projection_key(layer: usize, module: &str) -> Option<String> {
    module_block(module).map(|block| format!("model.layers.{}.{}.{}.weight", layer, block, module))
}

/// `eos_token_id` is a single id or a list in the wild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn first(&self) -> Option<u32> {
        match self {
            TokenIds::Single(id) => Some(*id),
            TokenIds::Many(ids) => ids.first().copied(),
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        match self {
            TokenIds::Single(x) => *x == id,
            TokenIds::Many(ids) => ids.contains(&id),
        }
    }
}

/// RoPE scaling block. Only linear position interpolation is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RopeScaling {
    #[serde(rename = "type", default)]
    pub scaling_type: Option<String>,
    #[serde(default)]
    pub rope_type: Option<String>,
    pub factor: f64,
}

impl RopeScaling {
    fn kind(&self) -> &str {
        self.scaling_type
            .as_deref()
            .or(self.rope_type.as_deref())
            .unwrap_or("linear")
    }
}

/// Llama model configuration, as found in `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub vocab_size: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub hidden_act: Option<String>,
    #[serde(default)]
    pub model_type: Option<String>,
}

impl LlamaConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse model config {}", path.display()))?;
        config.check()?;

        tracing::info!(
            "Model config: layers={}, hidden={}, heads={}/{}, vocab={}, rope_theta={}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_kv_heads(),
            config.vocab_size,
            config.rope_theta
        );
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if let Some(model_type) = &self.model_type {
            if model_type != "llama" {
                tracing::warn!("model_type '{}' is loaded as a Llama architecture", model_type);
            }
        }
        if let Some(act) = &self.hidden_act {
            if act != "silu" {
                return Err(anyhow!("Unsupported hidden activation '{}'", act));
            }
        }
        if self.num_attention_heads == 0 || self.num_kv_heads() == 0 {
            return Err(anyhow!("Attention head counts must be positive"));
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(anyhow!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads,
                self.num_kv_heads()
            ));
        }
        if self.head_dim() % 2 != 0 {
            return Err(anyhow!("head_dim must be even for rotary embeddings"));
        }
        Ok(())
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Factor positions are divided by, if linear scaling is configured
    pub fn linear_rope_factor(&self) -> Option<f64> {
        let scaling = self.rope_scaling.as_ref()?;
        match scaling.kind() {
            "linear" => Some(scaling.factor),
            "default" => None,
            other => {
                tracing::warn!("RoPE scaling '{}' is not supported, ignoring it", other);
                None
            }
        }
    }

    /// (in_features, out_features) of an adaptable projection
    pub fn module_dims(&self, module: &str) -> Option<(usize, usize)> {
        let q_out = self.num_attention_heads * self.head_dim();
        let kv_out = self.num_kv_heads() * self.head_dim();
        let dims = match module {
            "q_proj" => (self.hidden_size, q_out),
            "k_proj" | "v_proj" => (self.hidden_size, kv_out),
            "o_proj" => (q_out, self.hidden_size),
            "gate_proj" | "up_proj" => (self.hidden_size, self.intermediate_size),
            "down_proj" => (self.intermediate_size, self.hidden_size),
            _ => return None,
        };
        Some(dims)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const DEEPSEEK_CONFIG: &str = r#"{
        "architectures": ["LlamaForCausalLM"],
        "bos_token_id": 32013,
        "eos_token_id": 32021,
        "hidden_act": "silu",
        "hidden_size": 2048,
        "intermediate_size": 5504,
        "max_position_embeddings": 16384,
        "model_type": "llama",
        "num_attention_heads": 16,
        "num_hidden_layers": 24,
        "num_key_value_heads": 16,
        "rms_norm_eps": 1e-06,
        "rope_scaling": {"factor": 4.0, "type": "linear"},
        "rope_theta": 100000,
        "tie_word_embeddings": false,
        "torch_dtype": "bfloat16",
        "vocab_size": 32256
    }"#;

    #[test]
    fn test_parse_deepseek_config() {
        let config: LlamaConfig = serde_json::from_str(DEEPSEEK_CONFIG).expect("test: parse");
        config.check().expect("test: config valid");
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.num_kv_heads(), 16);
        assert_eq!(config.linear_rope_factor(), Some(4.0));
        assert_eq!(config.eos_token_id.as_ref().and_then(TokenIds::first), Some(32021));
        assert_eq!(config.module_dims("down_proj"), Some((5504, 2048)));
        assert_eq!(config.module_dims("lm_head"), None);
    }

    #[test]
    fn test_eos_list() {
        let ids: TokenIds = serde_json::from_str("[2, 7]").expect("test: parse");
        assert_eq!(ids.first(), Some(2));
        assert!(ids.contains(7));
    }

    #[test]
    fn test_projection_key() {
        assert_eq!(
            projection_key(3, "gate_proj").as_deref(),
            Some("model.layers.3.mlp.gate_proj.weight")
        );
        assert_eq!(
            projection_key(0, "o_proj").as_deref(),
            Some("model.layers.0.self_attn.o_proj.weight")
        );
        assert_eq!(projection_key(0, "embed_tokens"), None);
    }
}
