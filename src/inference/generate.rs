//! Autoregressive generation with a KV cache

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tch::{Device, Kind, Tensor};

use super::sampling::{Sampler, SamplingConfig};
use crate::constants::END_MARKER;
use crate::data::ChatTokenizer;
use crate::model::{KvCache, LayerDelta, LlamaModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Eos,
    EndMarker,
    MaxTokens,
}

/// Newly generated tokens and their decoded text
#[derive(Debug, Clone)]
pub struct Generation {
    pub token_ids: Vec<u32>,
    pub text: String,
    pub prompt_tokens: usize,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

impl Generation {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.token_ids.len() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Token ids that end generation
#[derive(Debug, Clone)]
pub struct StopTokens {
    eos: Vec<u32>,
    end_marker: Option<u32>,
}

impl StopTokens {
    pub fn new(tokenizer: &ChatTokenizer, model: &LlamaModel) -> Self {
        let mut eos = vec![tokenizer.eos_id()];
        if let Some(ids) = &model.config().eos_token_id {
            match ids {
                crate::model::TokenIds::Single(id) => eos.push(*id),
                crate::model::TokenIds::Many(list) => eos.extend(list.iter().copied()),
            }
        }
        eos.sort_unstable();
        eos.dedup();
        Self {
            eos,
            end_marker: tokenizer.token_to_id(END_MARKER),
        }
    }

    pub fn check(&self, id: u32) -> Option<StopReason> {
        if self.eos.contains(&id) {
            Some(StopReason::Eos)
        } else if self.end_marker == Some(id) {
            Some(StopReason::EndMarker)
        } else {
            None
        }
    }
}

fn last_logits(logits: &Tensor) -> Result<Vec<f32>> {
    let (_, seq_len, _) = logits.size3()?;
    let last = logits
        .f_select(1, seq_len - 1)?
        .f_view([-1])?
        .f_to_kind(Kind::Float)?
        .f_to_device(Device::Cpu)?;
    Ok(Vec::<f32>::try_from(&last)?)
}

/// Generate a completion for `prompt`, returning only the new tokens.
///
/// The prompt is encoded with special tokens; the completion is decoded with
/// special tokens skipped and cut at the end marker if it appears as text.
pub fn generate(
    model: &LlamaModel,
    delta: Option<&dyn LayerDelta>,
    tokenizer: &ChatTokenizer,
    prompt: &str,
    config: &SamplingConfig,
) -> Result<Generation> {
    let _guard = tch::no_grad_guard();
    let start = Instant::now();

    let prompt_ids = tokenizer
        .encode(prompt, true)
        .context("Failed to tokenize prompt")?;
    let prompt_tokens = prompt_ids.len();
    let max_positions = model.config().max_position_embeddings;
    if prompt_tokens + config.max_new_tokens > max_positions {
        tracing::warn!(
            "Prompt ({}) plus {} new tokens exceeds max_position_embeddings ({})",
            prompt_tokens,
            config.max_new_tokens,
            max_positions
        );
    }

    let stops = StopTokens::new(tokenizer, model);
    let mut sampler = Sampler::new(config.clone());
    let mut cache = KvCache::new(model.num_layers());
    let mut history = prompt_ids.clone();
    let mut generated: Vec<u32> = Vec::with_capacity(config.max_new_tokens);
    let mut stop_reason = StopReason::MaxTokens;

    let input: Vec<i64> = prompt_ids.iter().map(|&id| i64::from(id)).collect();
    let mut input = Tensor::f_from_slice(&input)?.f_view([1, -1])?;

    for _ in 0..config.max_new_tokens {
        let logits = model.forward_cached(&input, &mut cache, delta)?;
        let mut next_logits = last_logits(&logits)?;
        let next = sampler.next_token(&mut next_logits, &history);

        if let Some(reason) = stops.check(next) {
            stop_reason = reason;
            break;
        }
        generated.push(next);
        history.push(next);
        input = Tensor::f_from_slice(&[i64::from(next)])?.f_view([1, 1])?;
    }

    let mut text = tokenizer
        .decode(&generated, true)
        .context("Failed to decode completion")?;
    if let Some(pos) = text.find(END_MARKER) {
        text.truncate(pos);
        stop_reason = StopReason::EndMarker;
    }

    let generation = Generation {
        token_ids: generated,
        text,
        prompt_tokens,
        stop_reason,
        elapsed: start.elapsed(),
    };
    tracing::info!(
        "Generated {} tokens from a {}-token prompt in {:.1}s ({:.1} tok/s), stop: {:?}",
        generation.token_ids.len(),
        prompt_tokens,
        generation.elapsed.as_secs_f64(),
        generation.tokens_per_second(),
        generation.stop_reason
    );
    Ok(generation)
}
