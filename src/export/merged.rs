//! Saving the trained adapter and writing a standalone merged model

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tch::Device;

use crate::config::DTypeName;
use crate::constants::{GENERATION_CONFIG_FILE, MODEL_CONFIG_FILE};
use crate::data::ChatTokenizer;
use crate::lora::{merge_state_dict, LoraAdapter};
use crate::model::{weights, LlamaConfig};

/// Save adapter weights, `adapter_config.json` and tokenizer files to `dir`
pub fn save_adapter(adapter: &LoraAdapter, tokenizer: &ChatTokenizer, dir: &Path) -> Result<()> {
    adapter
        .save_pretrained(dir)
        .with_context(|| format!("Failed to save adapter to {}", dir.display()))?;
    tokenizer
        .save_pretrained(dir)
        .with_context(|| format!("Failed to save tokenizer to {}", dir.display()))?;
    tracing::info!("Adapter saved to {}", dir.display());
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub device: Device,
    pub dtype: DTypeName,
    pub max_shard_size: u64,
}

#[derive(Debug, Clone)]
pub struct MergeSummary {
    pub merged_dir: PathBuf,
    pub merged_projections: usize,
    pub weight_files: Vec<PathBuf>,
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Copy `config.json` with `torch_dtype` set to the merged dtype
fn write_model_config(base_dir: &Path, merged_dir: &Path, dtype: DTypeName) -> Result<()> {
    let mut config = read_json(&base_dir.join(MODEL_CONFIG_FILE))?;
    if let Value::Object(map) = &mut config {
        map.insert(
            "torch_dtype".to_string(),
            Value::String(dtype.torch_name().to_string()),
        );
    }
    write_json(&merged_dir.join(MODEL_CONFIG_FILE), &config)
}

/// Copy `generation_config.json`, or derive one from the model config
fn write_generation_config(base_dir: &Path, merged_dir: &Path, config: &LlamaConfig) -> Result<()> {
    let src = base_dir.join(GENERATION_CONFIG_FILE);
    let value = if src.exists() {
        read_json(&src)?
    } else {
        serde_json::json!({
            "_from_model_config": true,
            "bos_token_id": config.bos_token_id,
            "eos_token_id": config.eos_token_id,
        })
    };
    write_json(&merged_dir.join(GENERATION_CONFIG_FILE), &value)
}

/// Load the unquantized base, fold the adapter into it, and write a
/// standalone model directory (weights, config, generation config, tokenizer)
pub fn merge_and_save(
    base_dir: &Path,
    adapter_dir: &Path,
    merged_dir: &Path,
    tokenizer: &ChatTokenizer,
    opts: &MergeOptions,
) -> Result<MergeSummary> {
    let _guard = tch::no_grad_guard();
    let config = LlamaConfig::from_file(&base_dir.join(MODEL_CONFIG_FILE))?;

    tracing::info!(
        "Loading base weights from {} as {}",
        base_dir.display(),
        opts.dtype.torch_name()
    );
    let mut state = weights::load_state_dict(base_dir, opts.device, Some(opts.dtype.kind()))?;
    let adapter = LoraAdapter::load_pretrained(adapter_dir, &config, opts.device)
        .with_context(|| format!("Failed to load adapter from {}", adapter_dir.display()))?;

    let merged_projections = merge_state_dict(&mut state, &adapter).context("Adapter merge failed")?;
    drop(adapter);

    let weight_files = weights::save_state_dict(merged_dir, &state, opts.max_shard_size)?;
    write_model_config(base_dir, merged_dir, opts.dtype)?;
    write_generation_config(base_dir, merged_dir, &config)?;
    tokenizer
        .save_pretrained(merged_dir)
        .with_context(|| format!("Failed to save tokenizer to {}", merged_dir.display()))?;

    tracing::info!(
        "Merged model ({} projections) saved to {}",
        merged_projections,
        merged_dir.display()
    );
    Ok(MergeSummary {
        merged_dir: merged_dir.to_path_buf(),
        merged_projections,
        weight_files,
    })
}
