//! Base model resolution: local directory or Hugging Face Hub download

use anyhow::{anyhow, Context, Result};
use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};

use crate::constants::{
    GENERATION_CONFIG_FILE, MODEL_CONFIG_FILE, SINGLE_WEIGHTS_FILE, SPECIAL_TOKENS_FILE,
    TOKENIZER_CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_INDEX_FILE,
};
use crate::model::weights::WeightsIndex;

/// Return a directory holding `config.json`, tokenizer and safetensors weights.
///
/// `name` is used as-is when it is an existing directory, otherwise it is a Hub
/// model id fetched into the local Hub cache.
pub async fn resolve_model_dir(name: &str, revision: Option<&str>) -> Result<PathBuf> {
    let local = Path::new(name);
    if local.is_dir() {
        tracing::info!("Using local model directory {}", local.display());
        return Ok(local.to_path_buf());
    }

    let mut builder = ApiBuilder::new().with_progress(true);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    let api = builder
        .build()
        .map_err(|e| anyhow!("Failed to initialize HF API: {}", e))?;

    let repo = match revision {
        Some(rev) => api.repo(Repo::with_revision(
            name.to_string(),
            RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(name.to_string()),
    };

    tracing::info!("Fetching {} from the Hugging Face Hub", name);
    let config_path = fetch(&repo, MODEL_CONFIG_FILE).await?;
    fetch(&repo, TOKENIZER_FILE).await?;
    for optional in [TOKENIZER_CONFIG_FILE, SPECIAL_TOKENS_FILE, GENERATION_CONFIG_FILE] {
        if let Err(e) = repo.get(optional).await {
            tracing::debug!("Optional file {} not fetched: {}", optional, e);
        }
    }

    match repo.get(SINGLE_WEIGHTS_FILE).await {
        Ok(path) => tracing::debug!("Fetched {}", path.display()),
        Err(_) => {
            let index_path = fetch(&repo, WEIGHTS_INDEX_FILE).await?;
            let content = tokio::fs::read_to_string(&index_path)
                .await
                .with_context(|| format!("Failed to read {}", index_path.display()))?;
            let index: WeightsIndex = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", index_path.display()))?;
            let mut shards: Vec<&String> = index.weight_map.values().collect();
            shards.sort();
            shards.dedup();
            for shard in shards {
                fetch(&repo, shard).await?;
            }
        }
    }

    config_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("Hub cache path {} has no parent", config_path.display()))
}

async fn fetch(repo: &ApiRepo, file: &str) -> Result<PathBuf> {
    repo.get(file)
        .await
        .map_err(|e| anyhow!("Failed to download {}: {}", file, e))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_directory_is_used_directly() {
        let dir = tempdir().expect("test: tempdir");
        let name = dir.path().to_str().expect("test: utf8 path");
        let resolved = resolve_model_dir(name, None).await.expect("test: resolve");
        assert_eq!(resolved, dir.path());
    }
}
