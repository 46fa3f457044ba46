//! Element-type emulation.
//!
//! Simulated buffers keep floats as `f32`; every write rounds the values to
//! what the target dtype can represent so numerics match a real chip closely
//! enough for token-level comparisons.

use half::bf16;

use meshinfer::backend::MathFidelity;
use meshinfer::dtype::{DType, BLOCK_FLOAT_GROUP};

/// Round `values` in place to the precision of `dtype`.
pub(crate) fn quantize(dtype: DType, values: &mut [f32]) {
    match dtype {
        DType::BF16 => round_bf16(values),
        DType::BFP8 => block_float(values, 7),
        DType::BFP4 => block_float(values, 3),
        DType::F32 | DType::I32 | DType::U32 => {}
    }
}

fn round_bf16(values: &mut [f32]) {
    for v in values {
        *v = bf16::from_f32(*v).to_f32();
    }
}

/// Groups of [`BLOCK_FLOAT_GROUP`] values share the exponent of their
/// largest magnitude; each value keeps `mantissa_bits` bits plus sign.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn block_float(values: &mut [f32], mantissa_bits: i32) {
    let limit = ((1_i32 << mantissa_bits) - 1) as f32;
    for group in values.chunks_mut(BLOCK_FLOAT_GROUP) {
        let max = group.iter().fold(0.0_f32, |m, v| m.max(v.abs()));
        if max == 0.0 || !max.is_finite() {
            continue;
        }
        let exponent = max.log2().floor() as i32;
        let step = 2.0_f32.powi(exponent + 1 - mantissa_bits);
        for v in group.iter_mut() {
            *v = (*v / step).round().clamp(-limit, limit) * step;
        }
    }
}

/// Precision the matmul unit sees its activations at.
pub(crate) fn apply_fidelity(fidelity: MathFidelity, values: &mut [f32]) {
    match fidelity {
        MathFidelity::LoFi => block_float(values, 7),
        MathFidelity::HiFi2 => round_bf16(values),
        MathFidelity::HiFi4 => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bf16_rounding() {
        let mut v = [1.0_f32, 1.001, 3.14159];
        quantize(DType::BF16, &mut v);
        assert_eq!(v[0], 1.0);
        assert_eq!(v[1], 1.0);
        assert!((v[2] - 3.140625).abs() < 1e-6);
    }

    #[test]
    fn test_block_float_keeps_largest_value_close() {
        let mut v: Vec<f32> = (0..16).map(|i| i as f32 * 0.1).collect();
        let original = v.clone();
        quantize(DType::BFP8, &mut v);
        for (q, o) in v.iter().zip(&original) {
            assert!((q - o).abs() <= 1.5 / 64.0, "{q} vs {o}");
        }
    }

    #[test]
    fn test_bfp4_is_coarser_than_bfp8() {
        let original: Vec<f32> = (0..16).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut b8 = original.clone();
        let mut b4 = original.clone();
        quantize(DType::BFP8, &mut b8);
        quantize(DType::BFP4, &mut b4);
        let err = |q: &[f32]| -> f32 { q.iter().zip(&original).map(|(a, b)| (a - b).abs()).sum() };
        assert!(err(&b4) > err(&b8));
    }

    #[test]
    fn test_small_values_flush_to_zero_in_block() {
        let mut v = vec![0.0_f32; 16];
        v[0] = 100.0;
        v[1] = 0.01;
        quantize(DType::BFP4, &mut v);
        assert_eq!(v[1], 0.0);
        assert!((v[0] - 96.0).abs() < 1e-3 || (v[0] - 112.0).abs() < 1e-3);
    }
}
