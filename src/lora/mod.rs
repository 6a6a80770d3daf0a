//! LoRA adapters: PEFT configuration, trainable A/B pairs, and merging

pub mod adapter;
pub mod config;
pub mod error;
pub mod merge;

pub use adapter::{parse_peft_key, peft_key, LoraAdapter, LoraLayer, LoraPart};
pub use config::AdapterConfig;
pub use error::{LoRAError, LoRAResult};
pub use merge::{merge_into_base, merge_state_dict};
