//! Default hyperparameters and well-known names for the fine-tuning run
//!
//! These seed [`crate::config::TuneConfig::default`], so a run without any
//! configuration file reproduces exactly this setup.

/// Base model fetched from the Hugging Face Hub
pub const MODEL_NAME: &str = "deepseek-ai/deepseek-coder-1.3b-instruct";
/// JSONL chat dataset
pub const TRAINING_FILE: &str = "training.jsonl";
/// Adapter output directory (also holds epoch checkpoints)
pub const OUTPUT_DIR: &str = "./react-testgen-lora";
/// Standalone merged fp16 model directory
pub const MERGED_DIR: &str = "./react-testgen-merged";

pub const EPOCHS: usize = 4;
pub const BATCH_SIZE: usize = 1;
pub const GRADIENT_ACCUM: usize = 4;
pub const LEARNING_RATE: f64 = 2e-4;
pub const MAX_SEQ_LENGTH: usize = 4096;
pub const LORA_R: usize = 16;
pub const LORA_ALPHA: f64 = 32.0;
pub const LORA_DROPOUT: f64 = 0.05;

pub const WEIGHT_DECAY: f64 = 0.01;
pub const WARMUP_RATIO: f64 = 0.1;
pub const LOGGING_STEPS: usize = 5;
pub const SAVE_TOTAL_LIMIT: usize = 2;
pub const MAX_GRAD_NORM: f64 = 0.3;
pub const SEED: u64 = 42;

/// Projections wrapped with adapters in every decoder layer
pub const TARGET_MODULES: [&str; 7] = [
    "q_proj",
    "k_proj",
    "v_proj",
    "o_proj",
    "gate_proj",
    "up_proj",
    "down_proj",
];

/// Chat markup
pub const END_MARKER: &str = "<|end|>";
pub const KNOWN_ROLES: [&str; 3] = ["system", "user", "assistant"];

/// Smoke-test generation defaults
pub const MAX_NEW_TOKENS: usize = 1500;
pub const TEMPERATURE: f64 = 0.3;
pub const TOP_P: f64 = 0.9;
pub const REPETITION_PENALTY: f64 = 1.1;
pub const SMOKE_PREVIEW_CHARS: usize = 2000;

/// Export defaults
pub const GGUF_FILE: &str = "react-testgen.gguf";
pub const GGUF_OUTTYPE: &str = "q4_k_m";
pub const OLLAMA_MODEL_NAME: &str = "react-testgen";
pub const LLAMA_CPP_DIR: &str = "llama.cpp";

/// NF4 block sizes (weights, and the second-level absmax blocks)
pub const QUANT_BLOCK_SIZE: usize = 64;
pub const QUANT_ABSMAX_BLOCK_SIZE: usize = 256;

/// Standard on-disk file names
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
pub const MODEL_CONFIG_FILE: &str = "config.json";
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";
pub const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
pub const SPECIAL_TOKENS_FILE: &str = "special_tokens_map.json";

/// Label value ignored by the loss
pub const IGNORE_INDEX: i64 = -100;
