//! Tokenizer wrapper that resolves the special tokens the trainer needs

use serde_json::Value;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use super::{DataError, DataResult};
use crate::constants::{SPECIAL_TOKENS_FILE, TOKENIZER_CONFIG_FILE, TOKENIZER_FILE};

/// A `tokenizers::Tokenizer` plus resolved EOS and pad tokens.
///
/// Models without a pad token reuse EOS for padding; the substitution is
/// recorded so that saved tokenizer files carry it.
pub struct ChatTokenizer {
    inner: Tokenizer,
    source_dir: PathBuf,
    eos_token: String,
    eos_id: u32,
    pad_token: String,
    pad_id: u32,
    pad_from_eos: bool,
}

/// Special tokens may be plain strings or `AddedToken` objects
fn token_content(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("content").and_then(|v| v.as_str()).map(str::to_owned),
        _ => None,
    }
}

fn read_json(path: &Path) -> DataResult<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_json::from_str(&content).map_err(|source| DataError::MalformedFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

fn lookup_special(configs: &[&Value], key: &str) -> Option<String> {
    configs
        .iter()
        .find_map(|cfg| cfg.get(key).and_then(token_content))
}

impl ChatTokenizer {
    /// Load `tokenizer.json` and the special-token configs from a model directory.
    ///
    /// `fallback_eos_id` comes from the model's `config.json` and is used when
    /// the tokenizer configs don't name an EOS token.
    pub fn from_dir(dir: &Path, fallback_eos_id: Option<u32>) -> DataResult<Self> {
        let tokenizer_path = dir.join(TOKENIZER_FILE);
        let inner = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            DataError::tokenizer(format!(
                "Failed to load tokenizer from {}: {}",
                tokenizer_path.display(),
                e
            ))
        })?;

        let tok_config = read_json(&dir.join(TOKENIZER_CONFIG_FILE))?.unwrap_or(Value::Null);
        let special_map = read_json(&dir.join(SPECIAL_TOKENS_FILE))?.unwrap_or(Value::Null);
        let configs = [&tok_config, &special_map];

        let (eos_token, eos_id) = match lookup_special(&configs, "eos_token") {
            Some(token) => {
                let id = inner.token_to_id(&token).ok_or_else(|| {
                    DataError::tokenizer(format!("EOS token '{}' is not in the vocabulary", token))
                })?;
                (token, id)
            }
            None => {
                let id = fallback_eos_id
                    .ok_or_else(|| DataError::tokenizer("No EOS token configured for tokenizer"))?;
                let token = inner.id_to_token(id).ok_or_else(|| {
                    DataError::tokenizer(format!("EOS id {} is not in the vocabulary", id))
                })?;
                (token, id)
            }
        };

        let pad = lookup_special(&configs, "pad_token")
            .and_then(|token| inner.token_to_id(&token).map(|id| (token, id)));
        let (pad_token, pad_id, pad_from_eos) = match pad {
            Some((token, id)) => (token, id, false),
            None => {
                tracing::info!("Tokenizer has no pad token, using EOS '{}' for padding", eos_token);
                (eos_token.clone(), eos_id, true)
            }
        };

        Ok(Self {
            inner,
            source_dir: dir.to_path_buf(),
            eos_token,
            eos_id,
            pad_token,
            pad_id,
            pad_from_eos,
        })
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> DataResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| DataError::tokenizer(format!("Encoding failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> DataResult<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| DataError::tokenizer(format!("Decoding failed: {}", e)))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn pad_token(&self) -> &str {
        &self.pad_token
    }

    pub fn pad_from_eos(&self) -> bool {
        self.pad_from_eos
    }

    /// Copy the tokenizer files next to saved weights.
    ///
    /// When padding reuses EOS, the pad token is written into the copied configs.
    pub fn save_pretrained(&self, dir: &Path) -> DataResult<()> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| DataError::Io { path, source }
        };
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;

        let tokenizer_dst = dir.join(TOKENIZER_FILE);
        std::fs::copy(self.source_dir.join(TOKENIZER_FILE), &tokenizer_dst)
            .map_err(io_err(&tokenizer_dst))?;

        for name in [TOKENIZER_CONFIG_FILE, SPECIAL_TOKENS_FILE] {
            let src = self.source_dir.join(name);
            let dst = dir.join(name);
            let mut value = match read_json(&src)? {
                Some(v) => v,
                None if self.pad_from_eos && name == TOKENIZER_CONFIG_FILE => {
                    serde_json::json!({ "eos_token": self.eos_token })
                }
                None => continue,
            };
            if self.pad_from_eos {
                if let Value::Object(map) = &mut value {
                    map.insert("pad_token".to_string(), Value::String(self.pad_token.clone()));
                }
            }
            let text = serde_json::to_string_pretty(&value)
                .map_err(|source| DataError::Serialize { source })?;
            std::fs::write(&dst, text).map_err(io_err(&dst))?;
        }

        tracing::debug!("Saved tokenizer files to {}", dir.display());
        Ok(())
    }
}

impl std::fmt::Debug for ChatTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTokenizer")
            .field("source_dir", &self.source_dir)
            .field("eos_token", &self.eos_token)
            .field("pad_token", &self.pad_token)
            .field("pad_from_eos", &self.pad_from_eos)
            .finish()
    }
}
