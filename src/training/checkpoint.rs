//! Per-epoch adapter checkpoints with rotation

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::TRAINER_STATE_FILE;
use crate::lora::LoraAdapter;

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// One logged optimizer step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    /// Fractional epoch at the time of logging
    pub epoch: f64,
    pub loss: f64,
    pub learning_rate: f64,
    pub grad_norm: f64,
}

/// `trainer_state.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub log_history: Vec<LogEntry>,
    pub saved_at: DateTime<Utc>,
}

impl TrainerState {
    pub fn new(max_steps: usize, num_train_epochs: usize) -> Self {
        Self {
            global_step: 0,
            epoch: 0.0,
            max_steps,
            num_train_epochs,
            log_history: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(TRAINER_STATE_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(TRAINER_STATE_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// A checkpoint directory on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub step: usize,
    pub path: PathBuf,
}

/// Writes `checkpoint-{step}` directories under the output directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    /// 0 keeps every checkpoint
    save_total_limit: usize,
}

impl CheckpointManager {
    pub fn new(output_dir: &Path, save_total_limit: usize) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            save_total_limit,
        }
    }

    /// Save adapter and trainer state, then drop the oldest checkpoints
    pub fn save(&self, adapter: &LoraAdapter, state: &TrainerState) -> Result<PathBuf> {
        let dir = self
            .output_dir
            .join(format!("{}{}", CHECKPOINT_PREFIX, state.global_step));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        adapter
            .save_pretrained(&dir)
            .with_context(|| format!("Failed to save adapter checkpoint to {}", dir.display()))?;
        let mut state = state.clone();
        state.saved_at = Utc::now();
        state.save(&dir)?;

        tracing::info!("Saved checkpoint to {}", dir.display());
        self.rotate()?;
        Ok(dir)
    }

    /// Checkpoints sorted by step
    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        let mut checkpoints = Vec::new();
        if !self.output_dir.exists() {
            return Ok(checkpoints);
        }
        for entry in std::fs::read_dir(&self.output_dir)
            .with_context(|| format!("Failed to list {}", self.output_dir.display()))?
        {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(step) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|s| s.parse().ok())
            {
                checkpoints.push(CheckpointInfo { step, path });
            }
        }
        checkpoints.sort_by_key(|c| c.step);
        Ok(checkpoints)
    }

    /// Keep only the newest `save_total_limit` checkpoints
    pub fn rotate(&self) -> Result<()> {
        if self.save_total_limit == 0 {
            return Ok(());
        }
        let checkpoints = self.list()?;
        if checkpoints.len() <= self.save_total_limit {
            return Ok(());
        }

        let to_remove = checkpoints.len() - self.save_total_limit;
        for checkpoint in checkpoints.into_iter().take(to_remove) {
            match std::fs::remove_dir_all(&checkpoint.path) {
                Ok(()) => tracing::debug!("Removed old checkpoint {}", checkpoint.path.display()),
                Err(e) => tracing::warn!("Failed to remove old checkpoint: {}", e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rotation_keeps_newest() {
        let dir = tempdir().expect("test: tempdir");
        for step in [3, 12, 6, 9] {
            std::fs::create_dir_all(dir.path().join(format!("checkpoint-{}", step)))
                .expect("test: mkdir");
        }
        std::fs::create_dir_all(dir.path().join("checkpoint-final")).expect("test: mkdir");

        let manager = CheckpointManager::new(dir.path(), 2);
        manager.rotate().expect("test: rotate");
        let steps: Vec<usize> = manager.list().expect("test: list").iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![9, 12]);
        assert!(dir.path().join("checkpoint-final").exists());
    }

    #[test]
    fn test_zero_limit_keeps_everything() {
        let dir = tempdir().expect("test: tempdir");
        for step in 1..=4 {
            std::fs::create_dir_all(dir.path().join(format!("checkpoint-{}", step)))
                .expect("test: mkdir");
        }
        let manager = CheckpointManager::new(dir.path(), 0);
        manager.rotate().expect("test: rotate");
        assert_eq!(manager.list().expect("test: list").len(), 4);
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempdir().expect("test: tempdir");
        let mut state = TrainerState::new(20, 4);
        state.global_step = 5;
        state.log_history.push(LogEntry {
            step: 5,
            epoch: 1.0,
            loss: 1.25,
            learning_rate: 2e-4,
            grad_norm: 0.3,
        });
        state.save(dir.path()).expect("test: save");
        let loaded = TrainerState::load(dir.path()).expect("test: load");
        assert_eq!(loaded.global_step, 5);
        assert_eq!(loaded.log_history, state.log_history);
    }

    #[test]
    fn test_missing_output_dir_lists_nothing() {
        let dir = tempdir().expect("test: tempdir");
        let manager = CheckpointManager::new(&dir.path().join("absent"), 2);
        assert!(manager.list().expect("test: list").is_empty());
    }
}
