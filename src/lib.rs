//! QLoRA fine-tuning of a code model for React component test generation.
//!
//! The pipeline flattens chat-format JSONL into training text, trains LoRA
//! adapters over a 4-bit quantized Llama base, merges them into a
//! half-precision copy, runs a smoke-test generation, and hands the merged
//! model to llama.cpp for GGUF conversion.

pub mod config;
pub mod constants;
pub mod data;
pub mod export;
pub mod inference;
pub mod lora;
pub mod model;
pub mod pipeline;
pub mod training;

#[cfg(test)]
#[allow(dead_code, clippy::expect_used, clippy::unwrap_used)]
#[path = "../tests/fixtures/tiny_model.rs"]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::TuneConfig;
pub use data::{ChatMessage, ChatTokenizer, FormattedExample, TrainingRecord};
pub use lora::{AdapterConfig, LoRAError, LoraAdapter};
pub use model::{LlamaConfig, LlamaModel};
pub use pipeline::{Pipeline, RunSummary};
