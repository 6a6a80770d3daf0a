//! Ollama `Modelfile` for the converted GGUF

use std::path::{Path, PathBuf};

use super::{ExportError, ExportResult};
use crate::config::TuneConfig;
use crate::constants::END_MARKER;
use crate::inference::prompt::SYSTEM_PROMPT;

pub const MODELFILE_NAME: &str = "Modelfile";

/// Values written into the Modelfile
#[derive(Debug, Clone)]
pub struct ModelfileParams {
    /// GGUF path, relative to the Modelfile
    pub gguf_file: PathBuf,
    pub temperature: f64,
    pub top_p: f64,
    pub repeat_penalty: f64,
    pub num_ctx: usize,
    pub system: String,
}

impl ModelfileParams {
    pub fn from_config(config: &TuneConfig) -> Self {
        let gguf_file = config
            .export
            .gguf_file
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| config.export.gguf_file.clone());
        Self {
            gguf_file,
            temperature: config.generation.temperature,
            top_p: config.generation.top_p,
            repeat_penalty: config.generation.repetition_penalty,
            num_ctx: config.data.max_seq_length,
            system: SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Render a Modelfile whose template reproduces the training chat format
pub fn render_modelfile(params: &ModelfileParams) -> String {
    let template = format!(
        "{{{{ if .System }}}}<|system|>\n{{{{ .System }}}}\n{{{{ end }}}}<|user|>\n{{{{ .Prompt }}}}\n<|assistant|>\n{{{{ .Response }}}}{}\n",
        END_MARKER
    );
    let mut out = String::new();
    out.push_str(&format!("FROM ./{}\n\n", params.gguf_file.display()));
    out.push_str(&format!("TEMPLATE \"\"\"{}\"\"\"\n\n", template));
    out.push_str(&format!("PARAMETER temperature {}\n", params.temperature));
    out.push_str(&format!("PARAMETER top_p {}\n", params.top_p));
    out.push_str(&format!("PARAMETER repeat_penalty {}\n", params.repeat_penalty));
    out.push_str(&format!("PARAMETER num_ctx {}\n", params.num_ctx));
    out.push_str(&format!("PARAMETER stop \"{}\"\n\n", END_MARKER));
    out.push_str(&format!("SYSTEM \"\"\"{}\"\"\"\n", params.system));
    out
}

/// Write `Modelfile` into `dir`
pub fn write_modelfile(dir: &Path, params: &ModelfileParams) -> ExportResult<PathBuf> {
    std::fs::create_dir_all(dir).map_err(ExportError::io(dir))?;
    let path = dir.join(MODELFILE_NAME);
    std::fs::write(&path, render_modelfile(params)).map_err(ExportError::io(&path))?;
    tracing::info!("Wrote {}", path.display());
    Ok(path)
}
