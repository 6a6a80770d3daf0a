//! Safetensors state-dict loading and saving

use anyhow::{anyhow, Context, Result};
use safetensors::tensor::{SafeTensors, TensorView};
use safetensors::Dtype;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

use crate::constants::{SINGLE_WEIGHTS_FILE, WEIGHTS_INDEX_FILE};

/// `model.safetensors.index.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightsIndex {
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub weight_map: BTreeMap<String, String>,
}

fn kind_for_dtype(dtype: Dtype) -> Result<Kind> {
    let kind = match dtype {
        Dtype::F32 => Kind::Float,
        Dtype::F16 => Kind::Half,
        Dtype::BF16 => Kind::BFloat16,
        Dtype::F64 => Kind::Double,
        Dtype::I32 => Kind::Int,
        Dtype::I64 => Kind::Int64,
        Dtype::I16 => Kind::Int16,
        Dtype::I8 => Kind::Int8,
        Dtype::U8 => Kind::Uint8,
        Dtype::BOOL => Kind::Bool,
        other => return Err(anyhow!("Unsupported safetensors dtype: {:?}", other)),
    };
    Ok(kind)
}

fn dtype_for_kind(kind: Kind) -> Result<Dtype> {
    let dtype = match kind {
        Kind::Float => Dtype::F32,
        Kind::Half => Dtype::F16,
        Kind::BFloat16 => Dtype::BF16,
        Kind::Double => Dtype::F64,
        Kind::Int => Dtype::I32,
        Kind::Int64 => Dtype::I64,
        Kind::Int16 => Dtype::I16,
        Kind::Int8 => Dtype::I8,
        Kind::Uint8 => Dtype::U8,
        Kind::Bool => Dtype::BOOL,
        other => return Err(anyhow!("Unsupported tensor kind for safetensors: {:?}", other)),
    };
    Ok(dtype)
}

fn is_float(kind: Kind) -> bool {
    matches!(kind, Kind::Float | Kind::Half | Kind::BFloat16 | Kind::Double)
}

/// Convert a safetensors view to a tensor on `device`.
///
/// Floating point tensors are cast to `float_kind` when given; integer tensors
/// keep their stored type.
pub fn view_to_tensor(
    view: &TensorView<'_>,
    device: Device,
    float_kind: Option<Kind>,
) -> Result<Tensor> {
    let kind = kind_for_dtype(view.dtype())?;
    let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();

    // Create tensor from raw bytes on CPU, then convert and move
    let mut tensor = Tensor::f_from_data_size(view.data(), &shape, kind)?;
    if let Some(target) = float_kind {
        if is_float(kind) && kind != target {
            tensor = tensor.f_to_kind(target)?;
        }
    }
    Ok(tensor.f_to_device(device)?)
}

/// Raw bytes, dtype and shape of a tensor for safetensors serialization
fn tensor_to_safetensors_data(tensor: &Tensor) -> Result<(Dtype, Vec<usize>, Vec<u8>)> {
    let cpu_tensor = tensor.to_device(Device::Cpu).contiguous();
    let kind = cpu_tensor.kind();
    let dtype = dtype_for_kind(kind)?;
    let shape: Vec<usize> = cpu_tensor.size().iter().map(|&d| d as usize).collect();
    let numel: usize = shape.iter().try_fold(1usize, |acc, &dim| {
        acc.checked_mul(dim)
            .ok_or_else(|| anyhow!("Tensor numel overflow: shape {:?}", shape))
    })?;
    let elem_size = kind.elt_size_in_bytes();
    let byte_len = numel
        .checked_mul(elem_size)
        .ok_or_else(|| anyhow!("Tensor byte length overflow: {} * {}", numel, elem_size))?;
    let mut bytes = vec![0u8; byte_len];
    cpu_tensor.f_copy_data_u8(&mut bytes, numel)?;
    Ok((dtype, shape, bytes))
}

/// Byte size of a tensor's storage
pub fn tensor_bytes(t: &Tensor) -> u64 {
    (t.numel() * t.kind().elt_size_in_bytes()) as u64
}

/// Serialize named tensors into one safetensors buffer
pub fn serialize_tensors(
    pairs: &[(String, Tensor)],
    metadata: Option<HashMap<String, String>>,
) -> Result<Vec<u8>> {
    let _guard = tch::no_grad_guard();
    if pairs.is_empty() {
        return Err(anyhow!("No tensors to serialize"));
    }

    let mut tensor_data = Vec::with_capacity(pairs.len());
    for (key, tensor) in pairs {
        let (dtype, shape, bytes) = tensor_to_safetensors_data(tensor)
            .with_context(|| format!("Failed to extract data for tensor '{}'", key))?;
        tensor_data.push((key.as_str(), dtype, shape, bytes));
    }

    let mut views = Vec::with_capacity(tensor_data.len());
    for (key, dtype, shape, bytes) in &tensor_data {
        let view = TensorView::new(*dtype, shape.clone(), bytes)
            .map_err(|e| anyhow!("Invalid tensor view for '{}': {}", key, e))?;
        views.push((*key, view));
    }

    safetensors::tensor::serialize(views, &metadata)
        .map_err(|e| anyhow!("safetensors serialization failed: {}", e))
}

/// Deserialize every tensor of a safetensors buffer
pub fn deserialize_tensors(
    data: &[u8],
    device: Device,
    float_kind: Option<Kind>,
) -> Result<HashMap<String, Tensor>> {
    let tensors = SafeTensors::deserialize(data)
        .map_err(|e| anyhow!("safetensors deserialization failed: {}", e))?;

    let mut result = HashMap::new();
    for (name, view) in tensors.tensors() {
        let tensor = view_to_tensor(&view, device, float_kind)
            .with_context(|| format!("Failed to load tensor '{}'", name))?;
        result.insert(name, tensor);
    }
    Ok(result)
}

/// Locate the weight files of a model directory.
///
/// Prefers `model.safetensors`, then the shard list of the index, then any
/// `model-*.safetensors` in name order.
pub fn find_weight_files(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let single_file = model_dir.join(SINGLE_WEIGHTS_FILE);
    if single_file.exists() {
        return Ok(vec![single_file]);
    }

    let index_path = model_dir.join(WEIGHTS_INDEX_FILE);
    if index_path.exists() {
        let index = read_index(&index_path)?;
        let mut files: Vec<String> = index.weight_map.values().cloned().collect();
        files.sort();
        files.dedup();
        return Ok(files.into_iter().map(|f| model_dir.join(f)).collect());
    }

    let mut shard_files = Vec::new();
    for entry in std::fs::read_dir(model_dir)
        .with_context(|| format!("Failed to list {}", model_dir.display()))?
    {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with("model-") && name.ends_with(".safetensors") {
                shard_files.push(entry.path());
            }
        }
    }
    shard_files.sort();

    if shard_files.is_empty() {
        return Err(anyhow!(
            "No safetensors weights found in {}",
            model_dir.display()
        ));
    }
    Ok(shard_files)
}

pub fn read_index(path: &Path) -> Result<WeightsIndex> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load the full state dict of a model directory
pub fn load_state_dict(
    model_dir: &Path,
    device: Device,
    float_kind: Option<Kind>,
) -> Result<HashMap<String, Tensor>> {
    let files = find_weight_files(model_dir)?;
    let mut weights = HashMap::new();

    for file in &files {
        let data = std::fs::read(file)
            .with_context(|| format!("Failed to read weights from {}", file.display()))?;
        let tensors = deserialize_tensors(&data, device, float_kind)
            .with_context(|| format!("Failed to load {}", file.display()))?;
        tracing::debug!("Loaded {} tensors from {}", tensors.len(), file.display());
        weights.extend(tensors);
    }

    tracing::info!(
        "Loaded {} tensors from {} file(s) in {}",
        weights.len(),
        files.len(),
        model_dir.display()
    );
    Ok(weights)
}

/// Write a state dict, splitting into shards above `max_shard_size` bytes.
///
/// Tensors are written in name order. A single shard is written as
/// `model.safetensors`; more get `model-0000i-of-0000n.safetensors` plus an
/// index file.
pub fn save_state_dict(
    dir: &Path,
    state_dict: &HashMap<String, Tensor>,
    max_shard_size: u64,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut names: Vec<&String> = state_dict.keys().collect();
    names.sort();

    let mut shards: Vec<Vec<&String>> = vec![Vec::new()];
    let mut current = 0u64;
    let mut total_size = 0u64;
    for name in names {
        let size = state_dict.get(name).map(tensor_bytes).unwrap_or(0);
        let needs_new_shard = shards.last().is_some_and(|s| !s.is_empty())
            && current + size > max_shard_size;
        if needs_new_shard {
            shards.push(Vec::new());
            current = 0;
        }
        if let Some(shard) = shards.last_mut() {
            shard.push(name);
        }
        current += size;
        total_size += size;
    }

    let metadata: HashMap<String, String> =
        [("format".to_string(), "pt".to_string())].into_iter().collect();
    let shard_count = shards.len();
    let mut written = Vec::with_capacity(shard_count);
    let mut index = WeightsIndex::default();

    for (i, shard) in shards.iter().enumerate() {
        let file_name = if shard_count == 1 {
            SINGLE_WEIGHTS_FILE.to_string()
        } else {
            format!("model-{:05}-of-{:05}.safetensors", i + 1, shard_count)
        };

        let pairs: Vec<(String, Tensor)> = shard
            .iter()
            .filter_map(|name| {
                state_dict
                    .get(*name)
                    .map(|t| ((*name).clone(), t.shallow_clone()))
            })
            .collect();
        let bytes = serialize_tensors(&pairs, Some(metadata.clone()))?;

        let path = dir.join(&file_name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        for name in shard {
            index.weight_map.insert((*name).clone(), file_name.clone());
        }
        written.push(path);
    }

    if shard_count > 1 {
        index
            .metadata
            .insert("total_size".to_string(), serde_json::Value::from(total_size));
        let index_path = dir.join(WEIGHTS_INDEX_FILE);
        std::fs::write(&index_path, serde_json::to_string_pretty(&index)?)
            .with_context(|| format!("Failed to write {}", index_path.display()))?;
    }

    tracing::info!(
        "Saved {} tensors ({:.1} MB) in {} shard(s) to {}",
        state_dict.len(),
        total_size as f64 / (1024.0 * 1024.0),
        shard_count,
        dir.display()
    );
    Ok(written)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> HashMap<String, Tensor> {
        let mut state = HashMap::new();
        state.insert(
            "a.weight".to_string(),
            Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).view([2, 2]),
        );
        state.insert(
            "b.weight".to_string(),
            Tensor::from_slice(&[5.0f32, 6.0]).to_kind(Kind::Half),
        );
        state.insert("c.ids".to_string(), Tensor::from_slice(&[7i64, 8, 9]));
        state
    }

    #[test]
    fn test_single_file_roundtrip() {
        let dir = tempdir().expect("test: create temp dir");
        let files = save_state_dict(dir.path(), &sample_state(), u64::MAX)
            .expect("test: save state");
        assert_eq!(files.len(), 1);
        assert!(dir.path().join(SINGLE_WEIGHTS_FILE).exists());

        let loaded = load_state_dict(dir.path(), Device::Cpu, None).expect("test: load state");
        assert_eq!(loaded.len(), 3);
        let a = loaded.get("a.weight").expect("test: a present");
        assert_eq!(a.size(), vec![2, 2]);
        assert_eq!(
            Vec::<f32>::try_from(a.view([-1])).expect("test: a values"),
            vec![1.0, 2.0, 3.0, 4.0]
        );
        assert_eq!(loaded.get("b.weight").expect("test: b").kind(), Kind::Half);
        assert_eq!(loaded.get("c.ids").expect("test: c").kind(), Kind::Int64);
    }

    #[test]
    fn test_sharded_save_writes_index() {
        let dir = tempdir().expect("test: create temp dir");
        // Every tensor exceeds the limit on its own, so each gets a shard
        let files = save_state_dict(dir.path(), &sample_state(), 1).expect("test: save state");
        assert_eq!(files.len(), 3);

        let index = read_index(&dir.path().join(WEIGHTS_INDEX_FILE)).expect("test: index");
        assert_eq!(index.weight_map.len(), 3);
        assert_eq!(
            index.weight_map.get("a.weight").map(String::as_str),
            Some("model-00001-of-00003.safetensors")
        );

        let loaded = load_state_dict(dir.path(), Device::Cpu, Some(Kind::Float))
            .expect("test: load state");
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get("b.weight").expect("test: b").kind(), Kind::Float);
        assert_eq!(loaded.get("c.ids").expect("test: c").kind(), Kind::Int64);
    }

    #[test]
    fn test_missing_weights_is_error() {
        let dir = tempdir().expect("test: create temp dir");
        assert!(find_weight_files(dir.path()).is_err());
    }
}
