//! Adapter and merged-model export, GGUF conversion, Ollama Modelfile

pub mod gguf;
pub mod merged;
pub mod modelfile;

pub use gguf::{convert_to_gguf, DryRunRunner, GgufOptions, GgufOuttype, ProcessRunner, ToolOutput, ToolRunner};
pub use merged::{merge_and_save, save_adapter, MergeOptions, MergeSummary};
pub use modelfile::{render_modelfile, write_modelfile, ModelfileParams};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to start {tool}: {source}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Required tool not found at {}", .0.display())]
    MissingTool(PathBuf),

    #[error("Unsupported GGUF output type '{0}'")]
    InvalidOuttype(String),

    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExportError {
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ExportError::Io { path, source }
    }
}

pub type ExportResult<T> = Result<T, ExportError>;
