//! Next-token selection: repetition penalty, temperature, nucleus sampling

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::GenerationConfig;

#[derive(Debug, Clone)]
pub struct SamplingConfig {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f64,
    pub do_sample: bool,
    pub seed: Option<u64>,
}

impl From<&GenerationConfig> for SamplingConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            repetition_penalty: config.repetition_penalty,
            do_sample: config.do_sample,
            seed: config.seed,
        }
    }
}

impl SamplingConfig {
    /// Sampling is skipped when disabled or when temperature is zero
    pub fn is_greedy(&self) -> bool {
        !self.do_sample || self.temperature <= 0.0
    }
}

/// Penalize every token already present in `seen`: positive logits are divided
/// by `penalty`, negative ones multiplied
pub fn apply_repetition_penalty(logits: &mut [f32], seen: &[u32], penalty: f64) {
    if (penalty - 1.0).abs() < f64::EPSILON {
        return;
    }
    let penalty = penalty as f32;
    let mut visited = vec![false; logits.len()];
    for &id in seen {
        let idx = id as usize;
        if idx >= logits.len() || visited[idx] {
            continue;
        }
        visited[idx] = true;
        let logit = logits[idx];
        logits[idx] = if logit > 0.0 { logit / penalty } else { logit * penalty };
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    for (idx, &value) in logits.iter().enumerate() {
        if value > logits[best] {
            best = idx;
        }
    }
    best as u32
}

/// Softmax of `logits / temperature`, computed stably
fn softmax(logits: &[f32], temperature: f64) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = logits
        .iter()
        .map(|&l| ((l as f64 - max) / temperature).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Smallest set of most likely tokens whose probability mass reaches `top_p`,
/// as (token, probability) sorted by decreasing probability
pub fn top_p_candidates(probs: &[f64], top_p: f64) -> Vec<(u32, f64)> {
    let mut sorted: Vec<(u32, f64)> = probs
        .iter()
        .enumerate()
        .map(|(idx, &p)| (idx as u32, p))
        .collect();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut cumulative = 0.0;
    let mut keep = 0usize;
    for (_, p) in &sorted {
        keep += 1;
        cumulative += p;
        if cumulative >= top_p {
            break;
        }
    }
    sorted.truncate(keep.max(1));
    sorted
}

/// Stateful token picker holding the sampling RNG
#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Choose the next token from last-position `logits` given the ids so far
    pub fn next_token(&mut self, logits: &mut [f32], history: &[u32]) -> u32 {
        apply_repetition_penalty(logits, history, self.config.repetition_penalty);
        if self.config.is_greedy() {
            return argmax(logits);
        }

        let probs = softmax(logits, self.config.temperature);
        let candidates = top_p_candidates(&probs, self.config.top_p);
        let total: f64 = candidates.iter().map(|(_, p)| p).sum();
        let mut target = self.rng.gen::<f64>() * total;
        for &(id, p) in &candidates {
            if target < p {
                return id;
            }
            target -= p;
        }
        candidates.last().map(|&(id, _)| id).unwrap_or_else(|| argmax(logits))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(do_sample: bool, temperature: f64, top_p: f64) -> SamplingConfig {
        SamplingConfig {
            max_new_tokens: 8,
            temperature,
            top_p,
            repetition_penalty: 1.0,
            do_sample,
            seed: Some(42),
        }
    }

    #[test]
    fn test_repetition_penalty_signs() {
        let mut logits = vec![2.0f32, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 1], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 1.0]);
    }

    #[test]
    fn test_greedy_is_argmax() {
        let mut sampler = Sampler::new(config(false, 0.3, 0.9));
        let mut logits = vec![0.1f32, 3.0, 2.9, -1.0];
        assert_eq!(sampler.next_token(&mut logits, &[]), 1);

        let mut zero_temp = Sampler::new(config(true, 0.0, 0.9));
        let mut logits = vec![0.1f32, 3.0, 2.9, -1.0];
        assert_eq!(zero_temp.next_token(&mut logits, &[]), 1);
    }

    #[test]
    fn test_top_p_keeps_smallest_prefix() {
        let probs = [0.1, 0.5, 0.3, 0.1];
        let kept: Vec<u32> = top_p_candidates(&probs, 0.75).iter().map(|c| c.0).collect();
        assert_eq!(kept, vec![1, 2]);
        let kept: Vec<u32> = top_p_candidates(&probs, 0.5).iter().map(|c| c.0).collect();
        assert_eq!(kept, vec![1]);
        assert_eq!(top_p_candidates(&probs, 1.0).len(), 4);
    }

    #[test]
    fn test_sampling_stays_in_nucleus() {
        let mut sampler = Sampler::new(config(true, 1.0, 0.5));
        for _ in 0..50 {
            // Token 2 alone holds more than half the mass
            let mut logits = vec![0.0f32, 0.0, 5.0, 0.0];
            assert_eq!(sampler.next_token(&mut logits, &[]), 2);
        }
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let draw = || {
            let mut sampler = Sampler::new(config(true, 1.0, 1.0));
            (0..20)
                .map(|_| sampler.next_token(&mut vec![0.0f32; 16], &[]))
                .collect::<Vec<u32>>()
        };
        assert_eq!(draw(), draw());
    }
}
