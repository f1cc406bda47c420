//! Per-dtype dispatch table.
//!
//! One record per [`DType`], indexed by the enum discriminant: the fused
//! dot-product kernel, the dtype the dot-side ("vector y") operand must be
//! pre-converted to, the row-blocking factor, and the row codec functions.
//! Lookup is O(1) with no per-element branching; an `{op, dtype}` pairing
//! with no kernel here is a contract violation at the call site, not a
//! runtime error.

use half::{bf16, f16};

use crate::dtype::{DType, DTYPE_COUNT};
use crate::quant::decode::*;
use crate::quant::dot;
use crate::quant::encode::*;
use crate::quant::*;
use crate::simd;

/// Fused row dot: `n` elements, raw block/row pointers.
pub type VecDotFn = unsafe fn(n: usize, x: *const u8, y: *const u8) -> f32;
/// Encode one or more rows of f32 into the format's blocks.
pub type FromFloatFn = unsafe fn(x: &[f32], y: *mut u8);
/// Decode blocks into f32.
pub type ToFloatFn = unsafe fn(x: *const u8, y: &mut [f32]);

pub struct TypeTraits {
    pub dtype: DType,
    /// Fused dot against a row of `vec_dot_type`.
    pub vec_dot: Option<VecDotFn>,
    /// Required dtype of the dot-side operand.
    pub vec_dot_type: DType,
    /// Rows processed per dot call (blocked row-multiply factor).
    pub nrows: usize,
    pub from_float: Option<FromFloatFn>,
    pub to_float: Option<ToFloatFn>,
}

// ── byte-level codec adapters ────────────────────────────────────────────

macro_rules! quant_adapters {
    ($from:ident, $to:ident, $enc:ident, $dec:ident, $blk:ty, $qk:expr) => {
        unsafe fn $from(x: &[f32], y: *mut u8) {
            let blocks = std::slice::from_raw_parts_mut(y as *mut $blk, x.len() / $qk);
            $enc(x, blocks);
        }
        unsafe fn $to(x: *const u8, y: &mut [f32]) {
            let blocks = std::slice::from_raw_parts(x as *const $blk, y.len() / $qk);
            $dec(blocks, y);
        }
    };
}

quant_adapters!(from_q4_0, to_q4_0, quantize_row_q4_0, dequantize_row_q4_0, BlockQ4_0, QK);
quant_adapters!(from_q4_1, to_q4_1, quantize_row_q4_1, dequantize_row_q4_1, BlockQ4_1, QK);
quant_adapters!(from_q5_0, to_q5_0, quantize_row_q5_0, dequantize_row_q5_0, BlockQ5_0, QK);
quant_adapters!(from_q5_1, to_q5_1, quantize_row_q5_1, dequantize_row_q5_1, BlockQ5_1, QK);
quant_adapters!(from_q8_0, to_q8_0, quantize_row_q8_0, dequantize_row_q8_0, BlockQ8_0, QK);
quant_adapters!(from_q8_1, to_q8_1, quantize_row_q8_1, dequantize_row_q8_1, BlockQ8_1, QK);
quant_adapters!(from_q4_k, to_q4_k, quantize_row_q4_k, dequantize_row_q4_k, BlockQ4K, QK_K);
quant_adapters!(from_q5_k, to_q5_k, quantize_row_q5_k, dequantize_row_q5_k, BlockQ5K, QK_K);
quant_adapters!(from_q6_k, to_q6_k, quantize_row_q6_k, dequantize_row_q6_k, BlockQ6K, QK_K);
quant_adapters!(from_q8_k, to_q8_k, quantize_row_q8_k, dequantize_row_q8_k, BlockQ8K, QK_K);

unsafe fn from_f32(x: &[f32], y: *mut u8) {
    std::ptr::copy_nonoverlapping(x.as_ptr(), y as *mut f32, x.len());
}
unsafe fn to_f32(x: *const u8, y: &mut [f32]) {
    std::ptr::copy_nonoverlapping(x as *const f32, y.as_mut_ptr(), y.len());
}
unsafe fn from_f16(x: &[f32], y: *mut u8) {
    simd::vec_cvt_f32_to_f16(x.len(), y as *mut f16, x.as_ptr());
}
unsafe fn to_f16(x: *const u8, y: &mut [f32]) {
    simd::vec_cvt_f16_to_f32(y.len(), y.as_mut_ptr(), x as *const f16);
}
unsafe fn from_bf16(x: &[f32], y: *mut u8) {
    let out = std::slice::from_raw_parts_mut(y as *mut bf16, x.len());
    for (o, &v) in out.iter_mut().zip(x) {
        *o = bf16::from_f32(v);
    }
}
unsafe fn to_bf16(x: *const u8, y: &mut [f32]) {
    let src = std::slice::from_raw_parts(x as *const bf16, y.len());
    for (o, &v) in y.iter_mut().zip(src) {
        *o = v.to_f32();
    }
}

// ── the table ────────────────────────────────────────────────────────────

static TYPE_TRAITS: [TypeTraits; DTYPE_COUNT] = [
    TypeTraits {
        dtype: DType::F32,
        vec_dot: Some(dot::vec_dot_f32_bytes),
        vec_dot_type: DType::F32,
        nrows: 1,
        from_float: Some(from_f32),
        to_float: Some(to_f32),
    },
    TypeTraits {
        dtype: DType::F16,
        vec_dot: Some(dot::vec_dot_f16_bytes),
        vec_dot_type: DType::F16,
        nrows: 1,
        from_float: Some(from_f16),
        to_float: Some(to_f16),
    },
    TypeTraits {
        dtype: DType::BF16,
        vec_dot: Some(dot::vec_dot_bf16_bytes),
        vec_dot_type: DType::BF16,
        nrows: 1,
        from_float: Some(from_bf16),
        to_float: Some(to_bf16),
    },
    TypeTraits {
        dtype: DType::Q4_0,
        vec_dot: Some(dot::vec_dot_q4_0_q8_0),
        vec_dot_type: DType::Q8_0,
        nrows: 1,
        from_float: Some(from_q4_0),
        to_float: Some(to_q4_0),
    },
    TypeTraits {
        dtype: DType::Q4_1,
        vec_dot: Some(dot::vec_dot_q4_1_q8_1),
        vec_dot_type: DType::Q8_1,
        nrows: 1,
        from_float: Some(from_q4_1),
        to_float: Some(to_q4_1),
    },
    TypeTraits {
        dtype: DType::Q5_0,
        vec_dot: Some(dot::vec_dot_q5_0_q8_0),
        vec_dot_type: DType::Q8_0,
        nrows: 1,
        from_float: Some(from_q5_0),
        to_float: Some(to_q5_0),
    },
    TypeTraits {
        dtype: DType::Q5_1,
        vec_dot: Some(dot::vec_dot_q5_1_q8_1),
        vec_dot_type: DType::Q8_1,
        nrows: 1,
        from_float: Some(from_q5_1),
        to_float: Some(to_q5_1),
    },
    TypeTraits {
        dtype: DType::Q8_0,
        vec_dot: Some(dot::vec_dot_q8_0_q8_0),
        vec_dot_type: DType::Q8_0,
        nrows: 1,
        from_float: Some(from_q8_0),
        to_float: Some(to_q8_0),
    },
    TypeTraits {
        dtype: DType::Q8_1,
        vec_dot: None,
        vec_dot_type: DType::Q8_1,
        nrows: 1,
        from_float: Some(from_q8_1),
        to_float: Some(to_q8_1),
    },
    TypeTraits {
        dtype: DType::Q4K,
        vec_dot: Some(dot::vec_dot_q4_k_q8_k),
        vec_dot_type: DType::Q8K,
        nrows: 1,
        from_float: Some(from_q4_k),
        to_float: Some(to_q4_k),
    },
    TypeTraits {
        dtype: DType::Q5K,
        vec_dot: Some(dot::vec_dot_q5_k_q8_k),
        vec_dot_type: DType::Q8K,
        nrows: 1,
        from_float: Some(from_q5_k),
        to_float: Some(to_q5_k),
    },
    TypeTraits {
        dtype: DType::Q6K,
        vec_dot: Some(dot::vec_dot_q6_k_q8_k),
        vec_dot_type: DType::Q8K,
        nrows: 1,
        from_float: Some(from_q6_k),
        to_float: Some(to_q6_k),
    },
    TypeTraits {
        dtype: DType::Q8K,
        vec_dot: None,
        vec_dot_type: DType::Q8K,
        nrows: 1,
        from_float: Some(from_q8_k),
        to_float: Some(to_q8_k),
    },
    TypeTraits {
        dtype: DType::I32,
        vec_dot: None,
        vec_dot_type: DType::I32,
        nrows: 1,
        from_float: None,
        to_float: None,
    },
    TypeTraits {
        dtype: DType::I64,
        vec_dot: None,
        vec_dot_type: DType::I64,
        nrows: 1,
        from_float: None,
        to_float: None,
    },
];

/// The trait record for a dtype. O(1) array index.
#[inline(always)]
pub fn type_traits(dtype: DType) -> &'static TypeTraits {
    &TYPE_TRAITS[dtype as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_index_matches_discriminant() {
        for (i, t) in TYPE_TRAITS.iter().enumerate() {
            assert_eq!(t.dtype as usize, i, "table slot {i} holds {:?}", t.dtype);
        }
    }

    #[test]
    fn quantized_types_dot_against_q8() {
        assert_eq!(type_traits(DType::Q4_0).vec_dot_type, DType::Q8_0);
        assert_eq!(type_traits(DType::Q4_1).vec_dot_type, DType::Q8_1);
        assert_eq!(type_traits(DType::Q4K).vec_dot_type, DType::Q8K);
        assert_eq!(type_traits(DType::Q6K).vec_dot_type, DType::Q8K);
        assert_eq!(type_traits(DType::F32).vec_dot_type, DType::F32);
    }
}
