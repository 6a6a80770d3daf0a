//! Adapter persistence and merging against a tiny on-disk model

mod common;

use tch::{Device, Kind, Tensor};
use tempfile::tempdir;
use testgen_core::config::{DTypeName, LoraConfig};
use testgen_core::constants::TARGET_MODULES;
use testgen_core::export::{merge_and_save, save_adapter, MergeOptions};
use testgen_core::lora::{parse_peft_key, LoraPart};
use testgen_core::model::LoadOptions;
use testgen_core::{AdapterConfig, ChatTokenizer, LlamaModel, LoraAdapter};

fn dense_opts() -> LoadOptions {
    LoadOptions {
        device: Device::Cpu,
        kind: Kind::Float,
        quantization: None,
    }
}

fn adapter_config(r: usize) -> AdapterConfig {
    let lora = LoraConfig {
        r,
        alpha: 8.0,
        dropout: 0.0,
        ..LoraConfig::default()
    };
    AdapterConfig::from_lora(&lora, "tiny")
}

/// Give every B matrix random values so the adapter changes the output
fn perturb(adapter: &LoraAdapter) {
    tch::manual_seed(7);
    tch::no_grad(|| {
        for (_, _, layer) in adapter.iter() {
            let mut b = layer.lora_b.shallow_clone();
            let noise = Tensor::randn(b.size(), (Kind::Float, Device::Cpu)) * 0.5;
            b.copy_(&noise);
        }
    });
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
    (a - b).abs().max().double_value(&[])
}

#[test]
fn test_saved_adapter_uses_peft_layout() {
    let dir = tempdir().expect("test: tempdir");
    let config = common::tiny_config();
    let adapter = LoraAdapter::new(&config, adapter_config(4), Device::Cpu).expect("test: adapter");
    adapter.save_pretrained(dir.path()).expect("test: save");

    let saved: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("adapter_config.json")).expect("test: read"),
    )
    .expect("test: parse");
    assert_eq!(saved["peft_type"], "LORA");
    assert_eq!(saved["task_type"], "CAUSAL_LM");
    assert_eq!(saved["r"], 4);

    let bytes = std::fs::read(dir.path().join("adapter_model.safetensors")).expect("test: read");
    let tensors = safetensors::SafeTensors::deserialize(&bytes).expect("test: deserialize");
    // 2 layers x 7 modules x (A, B)
    assert_eq!(tensors.len(), 28);
    for name in tensors.names() {
        let (layer, module, part) = parse_peft_key(name).expect("test: peft key");
        let (in_f, out_f) = config.module_dims(&module).expect("test: dims");
        let shape = tensors.tensor(name).expect("test: tensor").shape().to_vec();
        match part {
            LoraPart::A => assert_eq!(shape, vec![4, in_f]),
            LoraPart::B => assert_eq!(shape, vec![out_f, 4]),
        }
        assert!(layer < 2);
    }
}

#[test]
fn test_adapter_reload_reproduces_output() {
    let dir = tempdir().expect("test: tempdir");
    let config = common::tiny_config();
    let model = LlamaModel::from_weights(
        config.clone(),
        common::tiny_state_dict(&config, 3),
        dense_opts(),
    )
    .expect("test: model");

    let adapter = LoraAdapter::new(&config, adapter_config(4), Device::Cpu).expect("test: adapter");
    perturb(&adapter);
    adapter.save_pretrained(dir.path()).expect("test: save");
    let reloaded = LoraAdapter::load_pretrained(dir.path(), &config, Device::Cpu).expect("test: load");

    let input = Tensor::from_slice(&[1i64, 16, 10, 17, 3]).view([1, 5]);
    let _guard = tch::no_grad_guard();
    let a = model.forward(&input, None, Some(&adapter), false).expect("test: forward");
    let b = model.forward(&input, None, Some(&reloaded), false).expect("test: forward");
    assert!(max_abs_diff(&a, &b) < 1e-6);
}

#[test]
fn test_merged_model_matches_base_plus_adapter() {
    let dir = tempdir().expect("test: tempdir");
    let base_dir = dir.path().join("base");
    let adapter_dir = dir.path().join("adapter");
    let merged_dir = dir.path().join("merged");
    common::write_tiny_model(&base_dir, 11);

    let config = common::tiny_config();
    let tokenizer = ChatTokenizer::from_dir(&base_dir, Some(2)).expect("test: tokenizer");
    let adapter = LoraAdapter::new(&config, adapter_config(4), Device::Cpu).expect("test: adapter");
    perturb(&adapter);
    save_adapter(&adapter, &tokenizer, &adapter_dir).expect("test: save adapter");

    let summary = merge_and_save(
        &base_dir,
        &adapter_dir,
        &merged_dir,
        &tokenizer,
        &MergeOptions {
            device: Device::Cpu,
            dtype: DTypeName::Float32,
            max_shard_size: 4096,
        },
    )
    .expect("test: merge");
    assert_eq!(summary.merged_projections, 14);
    // Small shard limit forces an index file
    assert!(summary.weight_files.len() > 1);
    assert!(merged_dir.join("model.safetensors.index.json").exists());
    assert!(merged_dir.join("generation_config.json").exists());
    assert!(merged_dir.join("tokenizer.json").exists());

    let merged_config: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(merged_dir.join("config.json")).expect("test: read"),
    )
    .expect("test: parse");
    assert_eq!(merged_config["torch_dtype"], "float32");

    let base = LlamaModel::load(&base_dir, dense_opts()).expect("test: base");
    let merged = LlamaModel::load(&merged_dir, dense_opts()).expect("test: merged");
    let input = Tensor::from_slice(&[1i64, 4, 7, 5, 16, 10, 17]).view([1, 7]);
    let _guard = tch::no_grad_guard();
    let expected = base.forward(&input, None, Some(&adapter), false).expect("test: forward");
    let actual = merged.forward(&input, None, None, false).expect("test: forward");
    let without = base.forward(&input, None, None, false).expect("test: forward");

    assert!(max_abs_diff(&expected, &actual) < 1e-4);
    assert!(max_abs_diff(&without, &actual) > 1e-4);

    for layer in 0..config.num_hidden_layers {
        for module in TARGET_MODULES {
            let base_w = base
                .projection_weight(layer, module, Kind::Float)
                .expect("test: base weight");
            let merged_w = merged
                .projection_weight(layer, module, Kind::Float)
                .expect("test: merged weight");
            let delta = adapter.delta_weight(layer, module).expect("test: delta");
            assert!(
                max_abs_diff(&(base_w + delta), &merged_w) < 1e-5,
                "layer {} {} is not W + scaling * B @ A",
                layer,
                module
            );
        }
    }
    assert!(merged.projection_weight(9, "q_proj", Kind::Float).is_err());
    assert!(merged.projection_weight(0, "lm_head", Kind::Float).is_err());
}

#[test]
fn test_half_precision_merge_sets_dtype() {
    let dir = tempdir().expect("test: tempdir");
    let base_dir = dir.path().join("base");
    let adapter_dir = dir.path().join("adapter");
    let merged_dir = dir.path().join("merged");
    common::write_tiny_model(&base_dir, 5);

    let config = common::tiny_config();
    let tokenizer = ChatTokenizer::from_dir(&base_dir, None).expect("test: tokenizer");
    let adapter = LoraAdapter::new(&config, adapter_config(2), Device::Cpu).expect("test: adapter");
    save_adapter(&adapter, &tokenizer, &adapter_dir).expect("test: save adapter");

    merge_and_save(
        &base_dir,
        &adapter_dir,
        &merged_dir,
        &tokenizer,
        &MergeOptions {
            device: Device::Cpu,
            dtype: DTypeName::Float16,
            max_shard_size: u64::MAX,
        },
    )
    .expect("test: merge");

    let bytes = std::fs::read(merged_dir.join("model.safetensors")).expect("test: read");
    let tensors = safetensors::SafeTensors::deserialize(&bytes).expect("test: deserialize");
    let q = tensors
        .tensor("model.layers.0.self_attn.q_proj.weight")
        .expect("test: q_proj");
    assert_eq!(q.dtype(), safetensors::Dtype::F16);
}
