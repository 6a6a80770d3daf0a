//! Two-layer GQA Llama and a 32-word tokenizer, small enough for CPU tests.
//!
//! Compiled into the library's unit tests and into `tests/common`; both
//! parents expose `constants`, `model` and `LlamaConfig`.

use std::collections::HashMap;
use std::path::Path;
use tch::{Device, Kind, Tensor};

use super::constants::TARGET_MODULES;
use super::model::{projection_key, weights};
use super::LlamaConfig;

pub const TINY_CONFIG_JSON: &str = include_str!("tiny_config.json");
pub const TINY_TOKENIZER_JSON: &str = include_str!("tiny_tokenizer.json");
pub const TINY_TOKENIZER_CONFIG_JSON: &str = include_str!("tiny_tokenizer_config.json");

pub fn tiny_config() -> LlamaConfig {
    serde_json::from_str(TINY_CONFIG_JSON).expect("test: parse tiny config")
}

/// Random HF-named weights for `config`
pub fn tiny_state_dict(config: &LlamaConfig, seed: i64) -> HashMap<String, Tensor> {
    tch::manual_seed(seed);
    let opts = (Kind::Float, Device::Cpu);
    let normal = |shape: &[i64]| Tensor::randn(shape, opts) * 0.02;
    let h = config.hidden_size as i64;
    let v = config.vocab_size as i64;

    let mut state = HashMap::new();
    state.insert("model.embed_tokens.weight".to_string(), normal(&[v, h]));
    for layer in 0..config.num_hidden_layers {
        for module in TARGET_MODULES {
            let (in_f, out_f) = config.module_dims(module).expect("test: module dims");
            let key = projection_key(layer, module).expect("test: projection key");
            state.insert(key, normal(&[out_f as i64, in_f as i64]));
        }
        for norm in ["input_layernorm", "post_attention_layernorm"] {
            state.insert(
                format!("model.layers.{}.{}.weight", layer, norm),
                Tensor::ones([h], opts),
            );
        }
    }
    state.insert("model.norm.weight".to_string(), Tensor::ones([h], opts));
    state.insert("lm_head.weight".to_string(), normal(&[v, h]));
    state
}

/// Write `tokenizer.json` and a `tokenizer_config.json` naming `</s>` as EOS
pub fn write_tiny_tokenizer(dir: &Path) {
    std::fs::create_dir_all(dir).expect("test: create tokenizer dir");
    std::fs::write(dir.join("tokenizer.json"), TINY_TOKENIZER_JSON)
        .expect("test: write tokenizer.json");
    std::fs::write(dir.join("tokenizer_config.json"), TINY_TOKENIZER_CONFIG_JSON)
        .expect("test: write tokenizer_config.json");
}

/// Write config, weights and tokenizer of the tiny model into `dir`
pub fn write_tiny_model(dir: &Path, seed: i64) {
    std::fs::create_dir_all(dir).expect("test: create model dir");
    std::fs::write(dir.join("config.json"), TINY_CONFIG_JSON).expect("test: write config.json");
    let config = tiny_config();
    weights::save_state_dict(dir, &tiny_state_dict(&config, seed), u64::MAX)
        .expect("test: save weights");
    write_tiny_tokenizer(dir);
}
