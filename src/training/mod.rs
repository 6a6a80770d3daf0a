//! Supervised fine-tuning: schedule, loop and checkpoints

pub mod checkpoint;
pub mod schedule;
pub mod trainer;

pub use checkpoint::{CheckpointInfo, CheckpointManager, LogEntry, TrainerState};
pub use schedule::CosineSchedule;
pub use trainer::{causal_lm_loss, SftTrainer, TrainOutcome};
