//! Training data: JSONL chat records, flattening, and tokenized batches

pub mod dataset;
pub mod encode;
pub mod tokenizer;

pub use dataset::{
    format_messages, format_record, load_training_data, parse_line, write_formatted,
    ChatMessage, DatasetStats, FormattedExample, TrainingRecord,
};
pub use encode::{collate, encode_examples, Batch, EncodedExample};
pub use tokenizer::ChatTokenizer;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading, formatting or tokenizing training data
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse line {line}: {source}")]
    MalformedLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse line {line} in {}: {source}", .path.display())]
    MalformedLineInFile {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    MalformedFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No training examples found in {}", .0.display())]
    EmptyDataset(PathBuf),

    #[error("Serialization failed: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Tensor operation failed: {0}")]
    TensorOp(#[from] tch::TchError),
}

impl DataError {
    /// Attach the file name to a line-level parse error
    pub fn in_file(self, path: &Path) -> Self {
        match self {
            DataError::MalformedLine { line, source } => DataError::MalformedLineInFile {
                path: path.to_path_buf(),
                line,
                source,
            },
            other => other,
        }
    }

    pub fn tokenizer<S: Into<String>>(msg: S) -> Self {
        DataError::Tokenizer(msg.into())
    }
}

pub type DataResult<T> = Result<T, DataError>;
