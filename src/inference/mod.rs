//! Text generation for the post-merge smoke test

pub mod generate;
pub mod prompt;
pub mod sampling;

pub use generate::{generate, Generation, StopReason, StopTokens};
pub use prompt::{build_prompt, preview, smoke_test_prompt};
pub use sampling::{apply_repetition_penalty, top_p_candidates, Sampler, SamplingConfig};
