//! Layered configuration for the fine-tuning pipeline
//!
//! Values are resolved in three layers, later ones winning:
//! - built-in defaults from [`crate::constants`]
//! - an optional TOML/JSON file (explicit path or `testgen.toml`)
//! - `TESTGEN__<SECTION>__<KEY>` environment overrides

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::Kind;

use crate::constants;

/// Config file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "testgen.toml";

/// Root configuration combining all pipeline stages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Base model identification and placement
    #[serde(default)]
    pub model: ModelConfig,

    /// Training data location and sequence limits
    #[serde(default)]
    pub data: DataConfig,

    /// LoRA adapter hyperparameters
    #[serde(default)]
    pub lora: LoraConfig,

    /// 4-bit base weight quantization
    #[serde(default)]
    pub quantization: QuantizationConfig,

    /// Optimizer, schedule and checkpointing
    #[serde(default)]
    pub training: TrainingConfig,

    /// Smoke-test generation parameters
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Merged model and GGUF output
    #[serde(default)]
    pub export: ExportConfig,
}

/// Floating point storage types accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DTypeName {
    Float32,
    Float16,
    Bfloat16,
}

impl DTypeName {
    pub fn kind(self) -> Kind {
        match self {
            DTypeName::Float32 => Kind::Float,
            DTypeName::Float16 => Kind::Half,
            DTypeName::Bfloat16 => Kind::BFloat16,
        }
    }

    /// Name used for `torch_dtype` in `config.json`
    pub fn torch_name(self) -> &'static str {
        match self {
            DTypeName::Float32 => "float32",
            DTypeName::Float16 => "float16",
            DTypeName::Bfloat16 => "bfloat16",
        }
    }
}

/// 4-bit code book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// NormalFloat4, quantiles of N(0, 1)
    Nf4,
    /// Sign + 3-bit float
    Fp4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hugging Face Hub id, or a local directory holding config + safetensors
    pub name: String,
    /// Hub revision (branch, tag or commit)
    pub revision: Option<String>,
    /// `auto`, `cpu`, `cuda` or `cuda:N`
    pub device: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: constants::MODEL_NAME.to_string(),
            revision: None,
            device: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub training_file: PathBuf,
    pub max_seq_length: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            training_file: PathBuf::from(constants::TRAINING_FILE),
            max_seq_length: constants::MAX_SEQ_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub r: usize,
    pub alpha: f64,
    pub dropout: f64,
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: constants::LORA_R,
            alpha: constants::LORA_ALPHA,
            dropout: constants::LORA_DROPOUT,
            target_modules: constants::TARGET_MODULES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    /// Load the decoder projections in 4-bit
    pub load_in_4bit: bool,
    pub quant_type: QuantType,
    /// Dtype the dequantized weights and activations are computed in
    pub compute_dtype: DTypeName,
    /// Quantize the per-block scales as well
    pub double_quant: bool,
    pub block_size: usize,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            quant_type: QuantType::Nf4,
            compute_dtype: DTypeName::Bfloat16,
            double_quant: true,
            block_size: constants::QUANT_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Final adapter and per-epoch checkpoints
    pub output_dir: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub warmup_ratio: f64,
    pub logging_steps: usize,
    pub save_total_limit: usize,
    pub max_grad_norm: f64,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(constants::OUTPUT_DIR),
            epochs: constants::EPOCHS,
            batch_size: constants::BATCH_SIZE,
            gradient_accumulation_steps: constants::GRADIENT_ACCUM,
            learning_rate: constants::LEARNING_RATE,
            weight_decay: constants::WEIGHT_DECAY,
            warmup_ratio: constants::WARMUP_RATIO,
            logging_steps: constants::LOGGING_STEPS,
            save_total_limit: constants::SAVE_TOTAL_LIMIT,
            max_grad_norm: constants::MAX_GRAD_NORM,
            seed: constants::SEED,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f64,
    /// false = greedy decoding
    pub do_sample: bool,
    pub seed: Option<u64>,
    /// Characters of the completion echoed after the smoke test
    pub preview_chars: usize,
    /// Prompt file replacing the built-in smoke-test prompt
    pub prompt_file: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: constants::MAX_NEW_TOKENS,
            temperature: constants::TEMPERATURE,
            top_p: constants::TOP_P,
            repetition_penalty: constants::REPETITION_PENALTY,
            do_sample: true,
            seed: None,
            preview_chars: constants::SMOKE_PREVIEW_CHARS,
            prompt_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub merged_dir: PathBuf,
    /// Storage dtype of the merged weights
    pub merge_dtype: DTypeName,
    /// Safetensors shard limit in bytes
    pub max_shard_size: u64,
    /// Checkout of llama.cpp holding the converter script and `llama-quantize`
    pub llama_cpp_dir: PathBuf,
    /// Python interpreter for the converter script
    pub python: String,
    pub gguf_file: PathBuf,
    /// `f32`, `f16`, `bf16`, `q8_0`, or a k-quant such as `q4_k_m`
    pub gguf_outtype: String,
    pub ollama_model_name: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            merged_dir: PathBuf::from(constants::MERGED_DIR),
            merge_dtype: DTypeName::Float16,
            max_shard_size: 5 * 1024 * 1024 * 1024,
            llama_cpp_dir: PathBuf::from(constants::LLAMA_CPP_DIR),
            python: "python".to_string(),
            gguf_file: PathBuf::from(constants::GGUF_FILE),
            gguf_outtype: constants::GGUF_OUTTYPE.to_string(),
            ollama_model_name: constants::OLLAMA_MODEL_NAME.to_string(),
        }
    }
}

impl TuneConfig {
    /// Load defaults, then the config file, then `TESTGEN__*` environment overrides.
    ///
    /// An explicit `path` must exist; otherwise `testgen.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file_source = match path {
            Some(p) => File::from(p.to_path_buf()).required(true),
            None => File::from(PathBuf::from(DEFAULT_CONFIG_FILE)).required(false),
        };

        let settings = Config::builder()
            // Start with defaults
            .add_source(Config::try_from(&TuneConfig::default())?)
            .add_source(file_source)
            // Load from environment variables with TESTGEN_ prefix
            .add_source(
                Environment::with_prefix("TESTGEN")
                    .separator("__")
                    .try_parsing(true),
            );

        settings.build()?.try_deserialize()
    }

    /// Load configuration from a single file without layering
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("toml");

        let config = match extension {
            "json" => serde_json::from_str(&contents)?,
            _ => toml::from_str(&contents)?,
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("toml");

        let contents = match extension {
            "json" => serde_json::to_string_pretty(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lora.r == 0 {
            anyhow::bail!("lora.r must be at least 1");
        }
        if !(0.0..1.0).contains(&self.lora.dropout) {
            anyhow::bail!("lora.dropout must be in [0, 1), got {}", self.lora.dropout);
        }
        if self.lora.target_modules.is_empty() {
            anyhow::bail!("lora.target_modules must not be empty");
        }
        if let Some(unknown) = self
            .lora
            .target_modules
            .iter()
            .find(|m| !constants::TARGET_MODULES.contains(&m.as_str()))
        {
            anyhow::bail!("Unknown LoRA target module '{}'", unknown);
        }

        let t = &self.training;
        if t.batch_size == 0 {
            anyhow::bail!("training.batch_size must be at least 1");
        }
        if t.gradient_accumulation_steps == 0 {
            anyhow::bail!("training.gradient_accumulation_steps must be at least 1");
        }
        if t.epochs == 0 {
            anyhow::bail!("training.epochs must be at least 1");
        }
        if !(0.0..=1.0).contains(&t.warmup_ratio) {
            anyhow::bail!("training.warmup_ratio must be in [0, 1], got {}", t.warmup_ratio);
        }
        if t.learning_rate <= 0.0 {
            anyhow::bail!("training.learning_rate must be positive");
        }

        if self.data.max_seq_length < 2 {
            anyhow::bail!("data.max_seq_length must be at least 2");
        }
        let block_size = self.quantization.block_size;
        if block_size == 0 || block_size % 2 != 0 {
            anyhow::bail!(
                "quantization.block_size must be a positive even number, got {}",
                block_size
            );
        }

        let g = &self.generation;
        if !(g.top_p > 0.0 && g.top_p <= 1.0) {
            anyhow::bail!("generation.top_p must be in (0, 1], got {}", g.top_p);
        }
        if g.temperature < 0.0 {
            anyhow::bail!("generation.temperature must not be negative");
        }
        if g.repetition_penalty <= 0.0 {
            anyhow::bail!("generation.repetition_penalty must be positive");
        }

        Ok(())
    }

    /// Optimizer steps per epoch, counting a trailing partial accumulation
    pub fn steps_per_epoch(&self, examples: usize) -> usize {
        let micro_batches = examples.div_ceil(self.training.batch_size.max(1));
        micro_batches.div_ceil(self.training.gradient_accumulation_steps.max(1))
    }

    pub fn total_steps(&self, examples: usize) -> usize {
        self.steps_per_epoch(examples) * self.training.epochs
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = TuneConfig::default();
        assert_eq!(config.model.name, constants::MODEL_NAME);
        assert_eq!(config.training.epochs, 4);
        assert_eq!(config.training.batch_size, 1);
        assert_eq!(config.training.gradient_accumulation_steps, 4);
        assert_eq!(config.data.max_seq_length, 4096);
        assert_eq!(config.lora.r, 16);
        assert_eq!(config.lora.target_modules.len(), 7);
        assert_eq!(config.quantization.quant_type, QuantType::Nf4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_step_math() {
        let config = TuneConfig::default();
        assert_eq!(config.steps_per_epoch(100), 25);
        assert_eq!(config.steps_per_epoch(101), 26);
        assert_eq!(config.total_steps(100), 100);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TuneConfig::default();
        config.lora.target_modules.push("lm_head".to_string());
        assert!(config.validate().is_err());

        let mut config = TuneConfig::default();
        config.training.gradient_accumulation_steps = 0;
        assert!(config.validate().is_err());

        let mut config = TuneConfig::default();
        config.generation.top_p = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_even_block_size() {
        let mut config = TuneConfig::default();
        for block_size in [0, 63] {
            config.quantization.block_size = block_size;
            let err = config.validate().expect_err("test: should fail");
            assert!(err.to_string().contains("positive even number"), "{}", err);
        }
        config.quantization.block_size = 32;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::tempdir().expect("test: create temp dir");
        let path = dir.path().join("testgen.toml");
        let mut config = TuneConfig::default();
        config.training.epochs = 2;
        config.export.gguf_outtype = "q8_0".to_string();
        config.to_file(&path).expect("test: save config");

        let loaded = TuneConfig::from_file(&path).expect("test: load config");
        assert_eq!(loaded.training.epochs, 2);
        assert_eq!(loaded.export.gguf_outtype, "q8_0");
        assert_eq!(loaded.quantization.compute_dtype, DTypeName::Bfloat16);
    }
}
