//! `adapter_config.json` in the PEFT layout

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{LoRAError, LoRAResult};
use crate::config::LoraConfig;
use crate::constants::{ADAPTER_CONFIG_FILE, TARGET_MODULES};

fn default_peft_type() -> String {
    "LORA".to_string()
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

fn default_bias() -> String {
    "none".to_string()
}

/// PEFT LoRA adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub lora_dropout: f64,
    pub target_modules: Vec<String>,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub inference_mode: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

impl AdapterConfig {
    pub fn from_lora(lora: &LoraConfig, base_model: &str) -> Self {
        Self {
            peft_type: default_peft_type(),
            task_type: default_task_type(),
            r: lora.r,
            lora_alpha: lora.alpha,
            lora_dropout: lora.dropout,
            target_modules: lora.target_modules.clone(),
            bias: default_bias(),
            base_model_name_or_path: Some(base_model.to_string()),
            inference_mode: false,
            fan_in_fan_out: false,
        }
    }

    /// Multiplier applied to `B @ A`
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    pub fn validate(&self) -> LoRAResult<()> {
        if self.peft_type != "LORA" {
            return Err(LoRAError::config(format!(
                "Unsupported peft_type '{}'",
                self.peft_type
            )));
        }
        if self.r == 0 {
            return Err(LoRAError::InvalidRank {
                rank: self.r,
                max: usize::MAX,
            });
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(LoRAError::config(format!(
                "lora_dropout must be in [0, 1), got {}",
                self.lora_dropout
            )));
        }
        if self.bias != "none" {
            return Err(LoRAError::config(format!("Unsupported bias mode '{}'", self.bias)));
        }
        if self.fan_in_fan_out {
            return Err(LoRAError::config("fan_in_fan_out adapters are not supported"));
        }
        if self.target_modules.is_empty() {
            return Err(LoRAError::config("target_modules must not be empty"));
        }
        if let Some(unknown) = self
            .target_modules
            .iter()
            .find(|m| !TARGET_MODULES.contains(&m.as_str()))
        {
            return Err(LoRAError::ModuleNotFound(unknown.clone()));
        }
        Ok(())
    }

    pub fn save(&self, dir: &Path) -> LoRAResult<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(ADAPTER_CONFIG_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> LoRAResult<Self> {
        let content = std::fs::read_to_string(dir.join(ADAPTER_CONFIG_FILE))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_and_scaling() {
        let config = AdapterConfig::from_lora(&LoraConfig::default(), "base");
        assert_eq!(config.peft_type, "LORA");
        assert_eq!(config.task_type, "CAUSAL_LM");
        assert_eq!(config.bias, "none");
        assert!((config.scaling() - 2.0).abs() < 1e-12);
        config.validate().expect("test: valid");
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().expect("test: tempdir");
        let config = AdapterConfig::from_lora(&LoraConfig::default(), "deepseek");
        config.save(dir.path()).expect("test: save");
        let loaded = AdapterConfig::load(dir.path()).expect("test: load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_reads_minimal_peft_file() {
        let json = r#"{"r": 8, "lora_alpha": 16, "target_modules": ["q_proj", "v_proj"]}"#;
        let config: AdapterConfig = serde_json::from_str(json).expect("test: parse");
        config.validate().expect("test: valid");
        assert_eq!(config.r, 8);
        assert!((config.scaling() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_unknown_module() {
        let mut config = AdapterConfig::from_lora(&LoraConfig::default(), "base");
        config.target_modules.push("lm_head".to_string());
        assert!(matches!(config.validate(), Err(LoRAError::ModuleNotFound(_))));
    }
}
