//! Macro layers.
//!
//! `simd_primitive!` maps abstract vector operations onto hardware
//! intrinsics per ISA; the vector helpers in [`crate::simd`] and the fused
//! quantized dot kernels in [`crate::quant::dot`] are written only in terms
//! of these primitives plus a scalar fallback.

#[macro_use]
pub mod simd_primitive;
