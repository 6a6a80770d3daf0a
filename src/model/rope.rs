//! Rotary position embeddings with optional linear position interpolation

use tch::{Device, Kind, Tensor};

/// Rotary embedding over the full head dimension (rotate-half layout)
#[derive(Debug)]
pub struct RotaryEmbedding {
    /// [head_dim / 2]
    inv_freq: Tensor,
    /// Positions are divided by this factor
    scaling_factor: f64,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64, linear_factor: Option<f64>, device: Device) -> Self {
        let half = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| (1.0 / theta.powf((2 * i) as f64 / head_dim as f64)) as f32)
            .collect();

        Self {
            inv_freq: Tensor::from_slice(&inv_freq).to_device(device),
            scaling_factor: linear_factor.unwrap_or(1.0),
        }
    }

    /// cos/sin tables for positions `start..start + len`, each [len, head_dim]
    pub fn cos_sin(&self, start: i64, len: i64, kind: Kind) -> (Tensor, Tensor) {
        let device = self.inv_freq.device();
        let positions = Tensor::arange_start(start, start + len, (Kind::Float, device))
            / self.scaling_factor;
        let freqs = positions.unsqueeze(1) * self.inv_freq.unsqueeze(0);
        let emb = Tensor::cat(&[&freqs, &freqs], -1);
        (emb.cos().to_kind(kind), emb.sin().to_kind(kind))
    }

    /// Rotate `x` [batch, heads, seq, head_dim] by precomputed tables
    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Tensor {
        let cos = cos.unsqueeze(0).unsqueeze(0);
        let sin = sin.unsqueeze(0).unsqueeze(0);
        x * cos + rotate_half(x) * sin
    }
}

fn rotate_half(x: &Tensor) -> Tensor {
    let half = x.size()[x.dim() - 1] / 2;
    let x1 = x.narrow(-1, 0, half);
    let x2 = x.narrow(-1, half, half);
    Tensor::cat(&[-x2, x1], -1)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_is_identity() {
        let rope = RotaryEmbedding::new(8, 10000.0, None, Device::Cpu);
        let (cos, sin) = rope.cos_sin(0, 1, Kind::Float);
        let x = Tensor::randn([1, 2, 1, 8], (Kind::Float, Device::Cpu));
        let rotated = RotaryEmbedding::apply(&x, &cos, &sin);
        let diff = (rotated - &x).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let rope = RotaryEmbedding::new(8, 10000.0, Some(4.0), Device::Cpu);
        let (cos, sin) = rope.cos_sin(3, 5, Kind::Float);
        let x = Tensor::randn([1, 1, 5, 8], (Kind::Float, Device::Cpu));
        let rotated = RotaryEmbedding::apply(&x, &cos, &sin);
        let before = x.norm().double_value(&[]);
        let after = rotated.norm().double_value(&[]);
        assert!((before - after).abs() < 1e-4);
    }

    #[test]
    fn test_linear_scaling_divides_positions() {
        let scaled = RotaryEmbedding::new(4, 10000.0, Some(4.0), Device::Cpu);
        let plain = RotaryEmbedding::new(4, 10000.0, None, Device::Cpu);
        let (cos_scaled, _) = scaled.cos_sin(8, 1, Kind::Float);
        let (cos_plain, _) = plain.cos_sin(2, 1, Kind::Float);
        let diff = (cos_scaled - cos_plain).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }
}
