//! Error types for LoRA adapters

use thiserror::Error;

/// Errors raised while building, persisting or merging adapters
#[derive(Error, Debug)]
pub enum LoRAError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dimension mismatch for {name}: expected {expected}, got {actual}")]
    DimensionMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid rank {rank}: must be between 1 and {max}")]
    InvalidRank { rank: usize, max: usize },

    #[error("Tensor operation failed: {0}")]
    TensorOp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Weight format error: {0}")]
    WeightFormat(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoRAError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        LoRAError::Config(msg.into())
    }

    pub fn dimension_mismatch<S: Into<String>>(name: S, expected: &[i64], actual: &[i64]) -> Self {
        LoRAError::DimensionMismatch {
            name: name.into(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }

    pub fn weight_format<S: Into<String>>(msg: S) -> Self {
        LoRAError::WeightFormat(msg.into())
    }
}

pub type LoRAResult<T> = Result<T, LoRAError>;

impl From<tch::TchError> for LoRAError {
    fn from(err: tch::TchError) -> Self {
        LoRAError::TensorOp(err.to_string())
    }
}
