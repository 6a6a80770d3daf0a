//! Llama-architecture base model: config, weights, quantization and forward pass

pub mod config;
pub mod device;
pub mod hub;
pub mod linear;
pub mod llama;
pub mod quant;
pub mod rope;
pub mod weights;

pub use config::{module_block, projection_key, LlamaConfig, TokenIds};
pub use device::resolve_device;
pub use hub::resolve_model_dir;
pub use linear::LayerDelta;
pub use llama::{KvCache, LlamaModel, LoadOptions, QuantSpec};
pub use quant::{QuantError, QuantizedTensor};
