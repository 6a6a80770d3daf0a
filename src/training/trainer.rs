//! Supervised fine-tuning loop over LoRA parameters
//!
//! The base model is frozen; only the adapter's variable store is optimized.
//! Loss is the standard shifted next-token cross entropy over every
//! non-padding position.

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::time::Instant;
use tch::nn::{self, OptimizerConfig};
use tch::{Kind, Reduction, Tensor};

use super::checkpoint::{CheckpointManager, LogEntry, TrainerState};
use super::schedule::CosineSchedule;
use crate::config::TrainingConfig;
use crate::constants::IGNORE_INDEX;
use crate::data::{collate, EncodedExample};
use crate::lora::LoraAdapter;
use crate::model::LlamaModel;

/// Mean next-token cross entropy of `logits` [b, t, v] against `labels` [b, t]
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.size3()?;
    if seq_len < 2 {
        return Err(anyhow!("Sequence of length {} has no next-token target", seq_len));
    }
    let shifted_logits = logits
        .f_narrow(1, 0, seq_len - 1)?
        .f_reshape([batch * (seq_len - 1), vocab])?;
    let shifted_labels = labels
        .f_to_device(logits.device())?
        .f_narrow(1, 1, seq_len - 1)?
        .f_reshape([batch * (seq_len - 1)])?;
    Ok(shifted_logits.f_cross_entropy_loss::<Tensor>(
        &shifted_labels,
        None,
        Reduction::Mean,
        IGNORE_INDEX,
        0.0,
    )?)
}

/// Steps and losses of a finished run
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub state: TrainerState,
    /// Mean loss of the last epoch
    pub final_loss: f64,
    pub tokens_seen: usize,
}

pub struct SftTrainer<'a> {
    model: &'a LlamaModel,
    adapter: &'a LoraAdapter,
    config: &'a TrainingConfig,
    optimizer: nn::Optimizer,
    checkpoints: CheckpointManager,
    pad_id: i64,
    show_progress: bool,
}

impl<'a> SftTrainer<'a> {
    pub fn new(
        model: &'a LlamaModel,
        adapter: &'a LoraAdapter,
        config: &'a TrainingConfig,
        pad_id: i64,
    ) -> Result<Self> {
        let optimizer = nn::AdamW {
            wd: config.weight_decay,
            ..Default::default()
        }
        .build(adapter.var_store(), config.learning_rate)
        .context("Failed to build AdamW optimizer")?;

        Ok(Self {
            model,
            adapter,
            config,
            optimizer,
            checkpoints: CheckpointManager::new(&config.output_dir, config.save_total_limit),
            pad_id,
            show_progress: true,
        })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn steps_per_epoch(&self, examples: usize) -> usize {
        let micro_batches = examples.div_ceil(self.config.batch_size.max(1));
        micro_batches.div_ceil(self.config.gradient_accumulation_steps.max(1))
    }

    fn progress_bar(&self, total: usize) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }

    /// L2 norm over all adapter gradients, before clipping
    fn grad_norm(&self) -> f64 {
        let _guard = tch::no_grad_guard();
        self.adapter
            .var_store()
            .trainable_variables()
            .iter()
            .map(|v| v.grad())
            .filter(Tensor::defined)
            .map(|g| g.to_kind(Kind::Float).norm().double_value(&[]).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Run every epoch over `examples`, checkpointing after each one
    pub fn train(&mut self, examples: &[EncodedExample]) -> Result<TrainOutcome> {
        if examples.is_empty() {
            return Err(anyhow!("No tokenized examples to train on"));
        }

        let batch_size = self.config.batch_size.max(1);
        let accum = self.config.gradient_accumulation_steps.max(1);
        let steps_per_epoch = self.steps_per_epoch(examples.len());
        let total_steps = steps_per_epoch * self.config.epochs;
        let schedule = CosineSchedule::new(self.config.learning_rate, total_steps, self.config.warmup_ratio);

        tracing::info!(
            "Training: {} examples, {} epochs, batch {} x accumulation {}, {} optimizer steps ({} warmup)",
            examples.len(),
            self.config.epochs,
            batch_size,
            accum,
            total_steps,
            schedule.warmup_steps()
        );

        let mut state = TrainerState::new(total_steps, self.config.epochs);
        let pb = self.progress_bar(total_steps)?;
        let start = Instant::now();
        let mut tokens_seen = 0usize;
        let mut final_loss = f64::NAN;

        // Losses since the last log line, one entry per optimizer step
        let mut pending_losses: Vec<f64> = Vec::new();

        for epoch in 0..self.config.epochs {
            let mut order: Vec<usize> = (0..examples.len()).collect();
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);

            let micro_batches: Vec<&[usize]> = order.chunks(batch_size).collect();
            let n_micro = micro_batches.len();
            let mut window_loss = 0.0;
            let mut window_len = 0usize;
            let mut epoch_loss = 0.0;
            let mut epoch_steps = 0usize;

            self.optimizer.zero_grad();
            for (i, indices) in micro_batches.into_iter().enumerate() {
                let batch_examples: Vec<&EncodedExample> =
                    indices.iter().map(|&idx| &examples[idx]).collect();
                let batch = collate(&batch_examples, self.pad_id, self.model.device())?;
                tokens_seen += batch.tokens;

                let logits = self.model.forward(
                    &batch.input_ids,
                    Some(&batch.attention_mask),
                    Some(self.adapter),
                    true,
                )?;
                let loss = causal_lm_loss(&logits, &batch.labels)?;
                let loss_value = loss.double_value(&[]);
                if !loss_value.is_finite() {
                    return Err(anyhow!(
                        "Non-finite loss {} at epoch {} micro-batch {}",
                        loss_value,
                        epoch + 1,
                        i
                    ));
                }
                (loss / accum as f64).backward();
                window_loss += loss_value;
                window_len += 1;

                let last_in_epoch = i + 1 == n_micro;
                if window_len < accum && !last_in_epoch {
                    continue;
                }

                let grad_norm = self.grad_norm();
                if self.config.max_grad_norm > 0.0 {
                    self.optimizer.clip_grad_norm(self.config.max_grad_norm);
                }
                let lr = schedule.lr_at(state.global_step);
                self.optimizer.set_lr(lr);
                self.optimizer.step();
                self.optimizer.zero_grad();

                let step_loss = window_loss / window_len as f64;
                window_loss = 0.0;
                window_len = 0;
                state.global_step += 1;
                state.epoch = state.global_step as f64 / steps_per_epoch.max(1) as f64;
                pending_losses.push(step_loss);
                epoch_loss += step_loss;
                epoch_steps += 1;

                tracing::debug!(
                    "Step {}: loss={:.4}, lr={:.3e}, grad_norm={:.4}",
                    state.global_step,
                    step_loss,
                    lr,
                    grad_norm
                );

                if self.config.logging_steps > 0 && state.global_step % self.config.logging_steps == 0 {
                    let mean = pending_losses.iter().sum::<f64>() / pending_losses.len() as f64;
                    pending_losses.clear();
                    tracing::info!(
                        "step {}/{} | epoch {:.2} | loss {:.4} | lr {:.3e} | grad_norm {:.4}",
                        state.global_step,
                        total_steps,
                        state.epoch,
                        mean,
                        lr,
                        grad_norm
                    );
                    state.log_history.push(LogEntry {
                        step: state.global_step,
                        epoch: state.epoch,
                        loss: mean,
                        learning_rate: lr,
                        grad_norm,
                    });
                }

                pb.set_message(format!("epoch {} loss {:.4}", epoch + 1, step_loss));
                pb.inc(1);
            }

            final_loss = epoch_loss / epoch_steps.max(1) as f64;
            tracing::info!(
                "Epoch {}/{} finished: mean loss {:.4}, {:.1}s elapsed",
                epoch + 1,
                self.config.epochs,
                final_loss,
                start.elapsed().as_secs_f64()
            );
            self.checkpoints.save(self.adapter, &state)?;
        }

        pb.finish_with_message(format!("done, loss {:.4}", final_loss));
        tracing::info!(
            "Training finished: {} steps, {} tokens in {:.1}s",
            state.global_step,
            tokens_seen,
            start.elapsed().as_secs_f64()
        );

        Ok(TrainOutcome {
            state,
            final_loss,
            tokens_seen,
        })
    }
}
