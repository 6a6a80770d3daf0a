//! Llama causal language model (RMSNorm, RoPE, GQA, SwiGLU)
//!
//! Base weights are frozen. Each decoder projection is a [`Linear`] that can be
//! stored 4-bit and consults an optional [`LayerDelta`] during the forward pass,
//! which is how adapters are trained without touching the base.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tch::{Device, Kind, Tensor};

use super::config::LlamaConfig;
use super::linear::{LayerDelta, Linear, LinearWeight};
use super::quant::QuantizedTensor;
use super::rope::RotaryEmbedding;
use super::weights;
use crate::config::QuantType;
use crate::constants::MODEL_CONFIG_FILE;

/// 4-bit storage settings for the decoder projections
#[derive(Debug, Clone, Copy)]
pub struct QuantSpec {
    pub quant_type: QuantType,
    pub block_size: usize,
    pub double_quant: bool,
}

/// Where and how to materialize the model
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub device: Device,
    /// Dtype of activations and unquantized weights
    pub kind: Kind,
    pub quantization: Option<QuantSpec>,
}

/// Cached keys and values for incremental decoding
#[derive(Debug, Default)]
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
    len: i64,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| None).collect(),
            len: 0,
        }
    }

    /// Number of cached positions
    pub fn len(&self) -> i64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Which keys each query may attend to in one forward pass
#[derive(Debug)]
enum AttnMask {
    /// Single-token decode step over an unpadded cache
    Full,
    /// Causal prefix without cache or padding
    Causal,
    /// Boolean [batch|1, 1, seq, past+seq], true where attention is allowed
    Explicit(Tensor),
}

/// Fused scaled dot-product attention over [b, heads, t, d] inputs
fn attend(q: &Tensor, k: &Tensor, v: &Tensor, mask: &AttnMask, head_dim: i64) -> Result<Tensor> {
    let scale = 1.0 / (head_dim as f64).sqrt();
    let (mask, is_causal) = match mask {
        AttnMask::Full => (None, false),
        AttnMask::Causal => (None, true),
        AttnMask::Explicit(m) => (Some(m), false),
    };
    Ok(Tensor::f_scaled_dot_product_attention(
        q, k, v, mask, 0.0, is_causal, scale,
    )?)
}

/// RMSNorm computed in f32, weight kept in f32
#[derive(Debug)]
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(weight: Tensor, eps: f64) -> Self {
        Self {
            weight: weight.to_kind(Kind::Float),
            eps,
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let kind = x.kind();
        let xf = x.to_kind(Kind::Float);
        let variance = xf
            .pow_tensor_scalar(2)
            .mean_dim(&[-1i64][..], true, Kind::Float);
        let normed = xf * (variance + self.eps).rsqrt();
        (normed * &self.weight).to_kind(kind)
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: i64,
    num_kv_heads: i64,
    head_dim: i64,
}

/// [b, kv_heads, t, d] -> [b, kv_heads * n_rep, t, d]
fn repeat_kv(x: &Tensor, n_rep: i64) -> Tensor {
    if n_rep == 1 {
        return x.shallow_clone();
    }
    let size = x.size();
    let (b, kv_heads, t, d) = (size[0], size[1], size[2], size[3]);
    x.unsqueeze(2)
        .expand([b, kv_heads, n_rep, t, d], false)
        .reshape([b, kv_heads * n_rep, t, d])
}

impl Attention {
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: &AttnMask,
        delta: Option<&dyn LayerDelta>,
        train: bool,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = x.size3()?;
        let (h, kvh, d) = (self.num_heads, self.num_kv_heads, self.head_dim);

        // [batch, seq, heads*dim] -> [batch, heads, seq, dim]
        let q = self
            .q_proj
            .forward(x, delta, train)?
            .reshape([batch, seq_len, h, d])
            .transpose(1, 2);
        let k = self
            .k_proj
            .forward(x, delta, train)?
            .reshape([batch, seq_len, kvh, d])
            .transpose(1, 2);
        let v = self
            .v_proj
            .forward(x, delta, train)?
            .reshape([batch, seq_len, kvh, d])
            .transpose(1, 2);

        let q = RotaryEmbedding::apply(&q, cos, sin);
        let k = RotaryEmbedding::apply(&k, cos, sin);

        let (k, v) = match cache {
            Some(slot) => {
                let (k, v) = match slot.take() {
                    Some((past_k, past_v)) => {
                        (Tensor::cat(&[past_k, k], 2), Tensor::cat(&[past_v, v], 2))
                    }
                    None => (k, v),
                };
                *slot = Some((k.shallow_clone(), v.shallow_clone()));
                (k, v)
            }
            None => (k, v),
        };

        let n_rep = h / kvh;
        let k = repeat_kv(&k, n_rep);
        let v = repeat_kv(&v, n_rep);

        let output = attend(&q, &k, &v, mask, d)?
            .transpose(1, 2)
            .contiguous()
            .reshape([batch, seq_len, h * d]);
        self.o_proj.forward(&output, delta, train)
    }
}

#[derive(Debug)]
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn forward(&self, x: &Tensor, delta: Option<&dyn LayerDelta>, train: bool) -> Result<Tensor> {
        // SwiGLU: down(silu(gate(x)) * up(x))
        let gate = self.gate_proj.forward(x, delta, train)?.silu();
        let up = self.up_proj.forward(x, delta, train)?;
        self.down_proj.forward(&(gate * up), delta, train)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    idx: usize,
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: &AttnMask,
        delta: Option<&dyn LayerDelta>,
        train: bool,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(x);
        let attn = self
            .self_attn
            .forward(&normed, cos, sin, mask, delta, train, cache)
            .with_context(|| format!("attention forward failed in layer {}", self.idx))?;
        let x = x + attn;

        let normed = self.post_attention_layernorm.forward(&x);
        let mlp = self
            .mlp
            .forward(&normed, delta, train)
            .with_context(|| format!("mlp forward failed in layer {}", self.idx))?;
        Ok(x + mlp)
    }

    fn linears(&self) -> [&Linear; 7] {
        [
            &self.self_attn.q_proj,
            &self.self_attn.k_proj,
            &self.self_attn.v_proj,
            &self.self_attn.o_proj,
            &self.mlp.gate_proj,
            &self.mlp.up_proj,
            &self.mlp.down_proj,
        ]
    }
}

/// Llama decoder-only model with LM head
#[derive(Debug)]
pub struct LlamaModel {
    config: LlamaConfig,
    embed_tokens: Tensor,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Tensor,
    rope: RotaryEmbedding,
    device: Device,
    kind: Kind,
}

struct WeightSource {
    weights: HashMap<String, Tensor>,
    opts: LoadOptions,
}

impl WeightSource {
    /// Remove a staged tensor and move it alone to the target device
    fn take(&mut self, name: &str) -> Result<Tensor> {
        let tensor = self
            .weights
            .remove(name)
            .ok_or_else(|| anyhow!("Missing weight '{}'", name))?;
        Ok(tensor
            .f_to_kind(self.opts.kind)?
            .f_to_device(self.opts.device)?
            .detach())
    }

    fn linear(&mut self, prefix: &str, layer: usize, module: &'static str) -> Result<Linear> {
        let name = format!("{}.{}.weight", prefix, module);
        let weight = self.take(&name)?;
        let weight = match self.opts.quantization {
            Some(spec) => LinearWeight::Quantized(
                QuantizedTensor::quantize(&weight, spec.quant_type, spec.block_size, spec.double_quant)
                    .with_context(|| format!("Failed to quantize '{}'", name))?,
            ),
            None => LinearWeight::Dense(weight),
        };
        Ok(Linear::new(weight, layer, module))
    }
}

impl LlamaModel {
    /// Load `config.json` and safetensors weights from a model directory
    ///
    /// Weights are staged on the CPU in their stored dtype. Each projection is
    /// moved and quantized on its own, so the device never holds the full
    /// dense model.
    pub fn load(model_dir: &Path, opts: LoadOptions) -> Result<Self> {
        let config = LlamaConfig::from_file(&model_dir.join(MODEL_CONFIG_FILE))?;
        let weights = weights::load_state_dict(model_dir, Device::Cpu, None)?;
        Self::from_weights(config, weights, opts)
    }

    /// Build the model from a HF-named state dict, consuming it
    pub fn from_weights(
        config: LlamaConfig,
        weights: HashMap<String, Tensor>,
        opts: LoadOptions,
    ) -> Result<Self> {
        let _guard = tch::no_grad_guard();
        let mut src = WeightSource { weights, opts };

        let embed_tokens = src.take("model.embed_tokens.weight")?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for idx in 0..config.num_hidden_layers {
            let attn_prefix = format!("model.layers.{}.self_attn", idx);
            let mlp_prefix = format!("model.layers.{}.mlp", idx);
            let self_attn = Attention {
                q_proj: src.linear(&attn_prefix, idx, "q_proj")?,
                k_proj: src.linear(&attn_prefix, idx, "k_proj")?,
                v_proj: src.linear(&attn_prefix, idx, "v_proj")?,
                o_proj: src.linear(&attn_prefix, idx, "o_proj")?,
                num_heads: config.num_attention_heads as i64,
                num_kv_heads: config.num_kv_heads() as i64,
                head_dim: config.head_dim() as i64,
            };
            let mlp = Mlp {
                gate_proj: src.linear(&mlp_prefix, idx, "gate_proj")?,
                up_proj: src.linear(&mlp_prefix, idx, "up_proj")?,
                down_proj: src.linear(&mlp_prefix, idx, "down_proj")?,
            };
            let input_layernorm = RmsNorm::new(
                src.take(&format!("model.layers.{}.input_layernorm.weight", idx))?,
                config.rms_norm_eps,
            );
            let post_attention_layernorm = RmsNorm::new(
                src.take(&format!("model.layers.{}.post_attention_layernorm.weight", idx))?,
                config.rms_norm_eps,
            );
            layers.push(DecoderLayer {
                idx,
                input_layernorm,
                self_attn,
                post_attention_layernorm,
                mlp,
            });
            tracing::debug!("Built decoder layer {}", idx);
        }

        let norm = RmsNorm::new(src.take("model.norm.weight")?, config.rms_norm_eps);
        let lm_head = if config.tie_word_embeddings {
            embed_tokens.shallow_clone()
        } else {
            match src.take("lm_head.weight") {
                Ok(w) => w,
                Err(_) => {
                    tracing::warn!("lm_head.weight not found, tying to embeddings");
                    embed_tokens.shallow_clone()
                }
            }
        };

        if !src.weights.is_empty() {
            let mut unused: Vec<&String> = src.weights.keys().collect();
            unused.sort();
            tracing::debug!("Ignoring {} unused tensors: {:?}", unused.len(), unused);
        }

        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.rope_theta,
            config.linear_rope_factor(),
            opts.device,
        );

        tracing::info!(
            "Built Llama model: {} layers on {:?} ({:?}{})",
            layers.len(),
            opts.device,
            opts.kind,
            if opts.quantization.is_some() { ", 4-bit projections" } else { "" }
        );

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
            device: opts.device,
            kind: opts.kind,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Total base parameters (quantized weights count their logical size)
    pub fn parameter_count(&self) -> usize {
        let linears: usize = self
            .layers
            .iter()
            .flat_map(|l| l.linears())
            .map(Linear::numel)
            .sum();
        let norms: usize = self
            .layers
            .iter()
            .map(|l| l.input_layernorm.weight.numel() + l.post_attention_layernorm.weight.numel())
            .sum::<usize>()
            + self.norm.weight.numel();
        let head = if self.config.tie_word_embeddings {
            0
        } else {
            self.lm_head.numel()
        };
        self.embed_tokens.numel() + linears + norms + head
    }

    /// Dense weight of `module` in `layer`, e.g. for merge verification
    pub fn projection_weight(&self, layer: usize, module: &str, kind: Kind) -> Result<Tensor> {
        let layer = self
            .layers
            .get(layer)
            .ok_or_else(|| anyhow!("Layer {} out of range", layer))?;
        let linear = layer
            .linears()
            .into_iter()
            .find(|l| l.module() == module)
            .ok_or_else(|| anyhow!("Unknown projection '{}'", module))?;
        linear.dense_weight(kind)
    }

    /// Causal mask shifted by `past` cached positions, combined with key padding
    fn attention_mask(
        &self,
        batch: i64,
        seq_len: i64,
        past: i64,
        attention_mask: Option<&Tensor>,
    ) -> Result<AttnMask> {
        if attention_mask.is_none() {
            if past == 0 {
                return Ok(AttnMask::Causal);
            }
            if seq_len == 1 {
                return Ok(AttnMask::Full);
            }
        }
        let total = past + seq_len;
        let causal = Tensor::ones([seq_len, total], (Kind::Float, self.device))
            .tril(past)
            .to_kind(Kind::Bool)
            .view([1, 1, seq_len, total]);

        match attention_mask {
            Some(mask) => {
                let keys = mask
                    .f_to_device(self.device)?
                    .f_ne(0)?
                    .f_view([batch, 1, 1, total])?;
                Ok(AttnMask::Explicit(causal.f_logical_and(&keys)?))
            }
            None => Ok(AttnMask::Explicit(causal)),
        }
    }

    fn forward_impl(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        delta: Option<&dyn LayerDelta>,
        train: bool,
        mut cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.size2()?;
        let past = cache.as_ref().map(|c| c.len).unwrap_or(0);

        let input_ids = input_ids.f_to_device(self.device)?;
        let mut hidden = Tensor::f_embedding(&self.embed_tokens, &input_ids, -1, false, false)?;
        let (cos, sin) = self.rope.cos_sin(past, seq_len, self.kind);
        let mask = self.attention_mask(batch, seq_len, past, attention_mask)?;

        for layer in &self.layers {
            let slot = cache
                .as_deref_mut()
                .and_then(|c| c.layers.get_mut(layer.idx));
            hidden = layer.forward(&hidden, &cos, &sin, &mask, delta, train, slot)?;
        }
        if let Some(c) = cache {
            c.len += seq_len;
        }

        let hidden = self.norm.forward(&hidden);
        Ok(hidden.f_matmul(&self.lm_head.tr())?.f_to_kind(Kind::Float)?)
    }

    /// Full-sequence forward pass returning f32 logits [batch, seq, vocab]
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        delta: Option<&dyn LayerDelta>,
        train: bool,
    ) -> Result<Tensor> {
        self.forward_impl(input_ids, attention_mask, delta, train, None)
    }

    /// Incremental forward pass for generation; appends to `cache`
    pub fn forward_cached(
        &self,
        input_ids: &Tensor,
        cache: &mut KvCache,
        delta: Option<&dyn LayerDelta>,
    ) -> Result<Tensor> {
        self.forward_impl(input_ids, None, delta, false, Some(cache))
    }
}
