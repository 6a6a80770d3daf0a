//! Shared fixtures: a two-layer Llama model and a word-level tokenizer on disk

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use testgen_core::{constants, model, LlamaConfig};

#[path = "../fixtures/tiny_model.rs"]
mod tiny_model;

pub use tiny_model::*;

/// Chat record whose words are all in the tiny vocabulary
pub fn training_line(body: &str) -> String {
    serde_json::json!({
        "messages": [
            {"role": "system", "content": "test the component"},
            {"role": "user", "content": "render the Spinner"},
            {"role": "assistant", "content": body}
        ]
    })
    .to_string()
}
