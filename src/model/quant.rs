//! Blockwise 4-bit weight quantization (NF4 / FP4)
//!
//! Weights are split into blocks of `block_size` elements. Each block stores
//! its absolute maximum and one 4-bit code per element, the index of the
//! nearest code-book value after dividing by that maximum. Two codes are
//! packed per byte, high nibble first.
//!
//! With double quantization the block maxima are themselves centered on their
//! mean and stored as int8 in blocks of 256 with one f32 scale each.

use tch::{Device, Kind, Tensor};
use thiserror::Error;

use crate::config::QuantType;
use crate::constants::QUANT_ABSMAX_BLOCK_SIZE;

/// NF4 code book (quantiles of a standard normal, rescaled to [-1, 1])
pub const NF4_CODE: [f32; 16] = [
    -1.0,
    -0.696_192_800_998_687_7,
    -0.525_073_051_452_636_7,
    -0.394_917_488_098_144_5,
    -0.284_441_381_692_886_35,
    -0.184_773_430_228_233_34,
    -0.091_050_036_251_544_95,
    0.0,
    0.079_580_299_556_255_34,
    0.160_930_201_411_247_25,
    0.246_112_301_945_686_34,
    0.337_915_241_718_292_24,
    0.440_709_829_330_444_34,
    0.562_617_003_917_694_1,
    0.722_956_836_223_602_3,
    1.0,
];

/// FP4 (E2M1) code book, sorted ascending
pub const FP4_CODE: [f32; 16] = [
    -1.0,
    -0.666_666_7,
    -0.5,
    -0.333_333_3,
    -0.25,
    -0.166_666_7,
    -0.005_208_333,
    0.0,
    0.0,
    0.005_208_333,
    0.166_666_7,
    0.25,
    0.333_333_3,
    0.5,
    0.666_666_7,
    1.0,
];

#[derive(Error, Debug)]
pub enum QuantError {
    #[error("Invalid block size {0}: must be a positive even number")]
    InvalidBlockSize(usize),

    #[error("Cannot quantize tensor of kind {0:?}")]
    UnsupportedKind(Kind),

    #[error("Cannot quantize an empty tensor")]
    Empty,

    #[error("Tensor operation failed: {0}")]
    TensorOp(#[from] tch::TchError),
}

pub type QuantResult<T> = Result<T, QuantError>;

impl QuantType {
    pub fn code(self) -> &'static [f32; 16] {
        match self {
            QuantType::Nf4 => &NF4_CODE,
            QuantType::Fp4 => &FP4_CODE,
        }
    }
}

/// Per-block scales, either plain f32 or double quantized
#[derive(Debug)]
enum BlockScales {
    Plain(Tensor),
    Double {
        /// int8 [blocks rounded up to the second-level block size]
        codes: Tensor,
        /// f32 [second-level blocks]
        scales: Tensor,
        offset: f64,
        n_blocks: i64,
    },
}

/// A 4-bit quantized weight matrix
#[derive(Debug)]
pub struct QuantizedTensor {
    /// uint8 [padded_numel / 2]
    packed: Tensor,
    scales: BlockScales,
    quant_type: QuantType,
    block_size: i64,
    shape: Vec<i64>,
    numel: i64,
}

/// Byte -> (high code value, low code value) table, [256, 2]
fn dequant_table(quant_type: QuantType, device: Device) -> Tensor {
    let code = quant_type.code();
    let mut table = Vec::with_capacity(512);
    for byte in 0..256usize {
        table.push(code[byte >> 4]);
        table.push(code[byte & 0x0f]);
    }
    Tensor::from_slice(&table).view([256, 2]).to_device(device)
}

/// Index of the nearest code for each element of `normalized` (values in [-1, 1])
fn nearest_code(normalized: &Tensor, quant_type: QuantType) -> Tensor {
    let code = quant_type.code();
    let mut idx = Tensor::zeros(normalized.size(), (Kind::Int64, normalized.device()));
    // Code book is ascending, so the index is the number of midpoints below the value
    for pair in code.windows(2) {
        let midpoint = f64::from((pair[0] + pair[1]) / 2.0);
        idx += normalized.gt(midpoint).to_kind(Kind::Int64);
    }
    idx
}

fn quantize_absmax(absmax: &Tensor) -> BlockScales {
    let n_blocks = absmax.size()[0];
    let offset = absmax.mean(Kind::Float).double_value(&[]);
    let centered = absmax - offset;

    let block = QUANT_ABSMAX_BLOCK_SIZE as i64;
    let padded = (n_blocks + block - 1) / block * block;
    let centered = if padded > n_blocks {
        Tensor::cat(
            &[
                centered,
                Tensor::zeros([padded - n_blocks], (Kind::Float, absmax.device())),
            ],
            0,
        )
    } else {
        centered
    };

    let blocks = centered.view([-1, block]);
    let scales = blocks.abs().amax(&[1i64][..], false).clamp_min(1e-12);
    let codes = (&blocks / scales.unsqueeze(1) * 127.0)
        .round()
        .clamp(-127.0, 127.0)
        .to_kind(Kind::Int8)
        .view([-1]);

    BlockScales::Double {
        codes,
        scales,
        offset,
        n_blocks,
    }
}

impl BlockScales {
    fn absmax(&self) -> Tensor {
        match self {
            BlockScales::Plain(absmax) => absmax.shallow_clone(),
            BlockScales::Double {
                codes,
                scales,
                offset,
                n_blocks,
            } => {
                let block = QUANT_ABSMAX_BLOCK_SIZE as i64;
                let restored = codes.to_kind(Kind::Float).view([-1, block]) / 127.0
                    * scales.unsqueeze(1);
                restored.view([-1]).narrow(0, 0, *n_blocks) + *offset
            }
        }
    }

    fn storage_bytes(&self) -> usize {
        match self {
            BlockScales::Plain(absmax) => absmax.numel() * 4,
            BlockScales::Double { codes, scales, .. } => codes.numel() + scales.numel() * 4 + 8,
        }
    }
}

impl QuantizedTensor {
    /// Quantize `weight` blockwise
    pub fn quantize(
        weight: &Tensor,
        quant_type: QuantType,
        block_size: usize,
        double_quant: bool,
    ) -> QuantResult<Self> {
        if block_size == 0 || block_size % 2 != 0 {
            return Err(QuantError::InvalidBlockSize(block_size));
        }
        let kind = weight.kind();
        if !matches!(kind, Kind::Float | Kind::Half | Kind::BFloat16 | Kind::Double) {
            return Err(QuantError::UnsupportedKind(kind));
        }
        let numel = weight.numel() as i64;
        if numel == 0 {
            return Err(QuantError::Empty);
        }

        let _guard = tch::no_grad_guard();
        let block = block_size as i64;
        let device = weight.device();
        let flat = weight.f_to_kind(Kind::Float)?.f_reshape([-1])?;

        let padded = (numel + block - 1) / block * block;
        let flat = if padded > numel {
            Tensor::f_cat(
                &[flat, Tensor::zeros([padded - numel], (Kind::Float, device))],
                0,
            )?
        } else {
            flat
        };

        let blocks = flat.f_view([-1, block])?;
        let absmax = blocks.abs().amax(&[1i64][..], false).clamp_min(1e-12);
        let normalized = &blocks / absmax.unsqueeze(1);

        let codes = nearest_code(&normalized, quant_type).view([-1, 2]);
        let packed = (codes.select(1, 0) * 16 + codes.select(1, 1)).f_to_kind(Kind::Uint8)?;

        let scales = if double_quant {
            quantize_absmax(&absmax)
        } else {
            BlockScales::Plain(absmax)
        };

        Ok(Self {
            packed,
            scales,
            quant_type,
            block_size: block,
            shape: weight.size(),
            numel,
        })
    }

    /// Reconstruct the weight in `kind`
    pub fn dequantize(&self, kind: Kind) -> QuantResult<Tensor> {
        let device = self.packed.device();
        let table = dequant_table(self.quant_type, device);

        let values = table
            .f_index_select(0, &self.packed.f_to_kind(Kind::Int64)?)?
            .f_view([-1, self.block_size])?;
        let absmax = self.scales.absmax();
        let restored = values * absmax.unsqueeze(1);

        Ok(restored
            .f_view([-1])?
            .f_narrow(0, 0, self.numel)?
            .f_view(self.shape.as_slice())?
            .f_to_kind(kind)?)
    }

    pub fn numel(&self) -> usize {
        self.numel as usize
    }

    /// Bytes held by the packed codes and scales
    pub fn storage_bytes(&self) -> usize {
        self.packed.numel() + self.scales.storage_bytes()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn max_abs(t: &Tensor) -> f64 {
        t.abs().max().double_value(&[])
    }

    #[test]
    fn test_code_values_roundtrip_exactly() {
        // One block holding every code value four times, scaled by 2.5
        let code: Vec<f32> = NF4_CODE.iter().map(|c| c * 2.5).collect();
        let values: Vec<f32> = code.iter().cycle().take(64).copied().collect();
        let weight = Tensor::from_slice(&values).view([4, 16]);

        let q = QuantizedTensor::quantize(&weight, QuantType::Nf4, 64, false)
            .expect("test: quantize");
        let restored = q.dequantize(Kind::Float).expect("test: dequantize");

        assert_eq!(restored.size(), vec![4, 16]);
        assert!(max_abs(&(restored - &weight)) < 1e-6);
    }

    /// Half of the widest gap between neighbouring code values
    fn half_gap(code: &[f32; 16]) -> f64 {
        code.windows(2)
            .map(|pair| f64::from(pair[1] - pair[0]) / 2.0)
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_error_is_bounded_per_block() {
        tch::manual_seed(0);
        // Rows of very different magnitude so a global bound would hide per-block error
        let row_scale = Tensor::logspace(-3.0, 1.0, 16, 10.0, (Kind::Float, Device::Cpu));
        let weight = Tensor::randn([16, 192], (Kind::Float, Device::Cpu)) * row_scale.unsqueeze(1);
        let absmax = weight
            .abs()
            .view([-1, 64])
            .amax(&[1i64][..], false);

        for (quant_type, code) in [(QuantType::Nf4, &NF4_CODE), (QuantType::Fp4, &FP4_CODE)] {
            for double_quant in [false, true] {
                let q = QuantizedTensor::quantize(&weight, quant_type, 64, double_quant)
                    .expect("test: quantize");
                let restored = q.dequantize(Kind::Float).expect("test: dequantize");
                let block_err = (restored - &weight)
                    .abs()
                    .view([-1, 64])
                    .amax(&[1i64][..], false);

                // Double quantization perturbs each block max by at most half an int8 step
                // of the centered maxima, which the slack term absorbs.
                let slack = if double_quant {
                    (&absmax - absmax.mean(Kind::Float)).abs().max().double_value(&[]) / 127.0
                } else {
                    0.0
                };
                let bound = &absmax * (half_gap(code) * (1.0 + 1e-4)) + slack + 1e-6;
                let excess = (block_err - bound).max().double_value(&[]);
                assert!(
                    excess <= 0.0,
                    "{:?} (double_quant={}) exceeds per-block bound by {}",
                    quant_type,
                    double_quant,
                    excess
                );
            }
        }
    }

    #[test]
    fn test_padding_preserves_shape() {
        let weight = Tensor::arange(15, (Kind::Float, Device::Cpu)).view([3, 5]) - 7.0;
        let q = QuantizedTensor::quantize(&weight, QuantType::Fp4, 64, true)
            .expect("test: quantize");
        assert_eq!(q.numel(), 15);
        let restored = q.dequantize(Kind::Half).expect("test: dequantize");
        assert_eq!(restored.size(), vec![3, 5]);
        assert_eq!(restored.kind(), Kind::Half);
    }

    #[test]
    fn test_packed_storage_is_half_a_byte_per_weight() {
        let weight = Tensor::ones([128, 64], (Kind::Float, Device::Cpu));
        let q = QuantizedTensor::quantize(&weight, QuantType::Nf4, 64, false)
            .expect("test: quantize");
        // 4096 bytes of codes + 128 f32 block maxima
        assert_eq!(q.storage_bytes(), 128 * 64 / 2 + 128 * 4);
    }

    #[test]
    fn test_rejects_odd_block_size() {
        let weight = Tensor::ones([4], (Kind::Float, Device::Cpu));
        let err = QuantizedTensor::quantize(&weight, QuantType::Nf4, 3, false)
            .expect_err("test: should fail");
        assert!(matches!(err, QuantError::InvalidBlockSize(3)));
    }
}
