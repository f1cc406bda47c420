/// Maps abstract f32 vector operations to hardware intrinsics, with a
/// scalar fallback.
///
/// ```ignore
/// simd_primitive!(avx2, f32, fma, a, b, c)  // -> _mm256_fmadd_ps(a, b, c)
/// simd_primitive!(scalar, f32, fma, a, b, c) // -> c + a * b
/// ```
///
/// Callers that expand an ISA other than `scalar` must be
/// `#[target_feature]` functions for that ISA; the primitives themselves
/// never test CPU features.
#[macro_export]
macro_rules! simd_primitive {
    // ── scalar fallback ─────────────────────────────────────────────────
    (scalar, f32, lanes) => { 1usize };
    (scalar, f32, zero) => { 0.0f32 };
    (scalar, f32, splat, $v:expr) => { $v };
    (scalar, f32, load, $p:expr) => { unsafe { *$p } };
    (scalar, f32, store, $p:expr, $v:expr) => { unsafe { *$p = $v } };
    (scalar, f32, add, $a:expr, $b:expr) => { $a + $b };
    (scalar, f32, sub, $a:expr, $b:expr) => { $a - $b };
    (scalar, f32, mul, $a:expr, $b:expr) => { $a * $b };
    (scalar, f32, div, $a:expr, $b:expr) => { $a / $b };
    (scalar, f32, fma, $a:expr, $b:expr, $c:expr) => { $a.mul_add($b, $c) };
    (scalar, f32, neg, $a:expr) => { -$a };
    (scalar, f32, abs, $a:expr) => { $a.abs() };
    (scalar, f32, max, $a:expr, $b:expr) => { $a.max($b) };
    (scalar, f32, min, $a:expr, $b:expr) => { $a.min($b) };
    (scalar, f32, sqrt, $a:expr) => { $a.sqrt() };
    (scalar, f32, reduce_sum, $v:expr) => { $v };
    (scalar, f32, reduce_max, $v:expr) => { $v };

    // ── AVX2 (+FMA) ─────────────────────────────────────────────────────
    (avx2, f32, lanes) => { 8usize };
    (avx2, f32, zero) => { std::arch::x86_64::_mm256_setzero_ps() };
    (avx2, f32, splat, $v:expr) => { std::arch::x86_64::_mm256_set1_ps($v) };
    (avx2, f32, load, $p:expr) => { std::arch::x86_64::_mm256_loadu_ps($p) };
    (avx2, f32, store, $p:expr, $v:expr) => { std::arch::x86_64::_mm256_storeu_ps($p, $v) };
    (avx2, f32, add, $a:expr, $b:expr) => { std::arch::x86_64::_mm256_add_ps($a, $b) };
    (avx2, f32, sub, $a:expr, $b:expr) => { std::arch::x86_64::_mm256_sub_ps($a, $b) };
    (avx2, f32, mul, $a:expr, $b:expr) => { std::arch::x86_64::_mm256_mul_ps($a, $b) };
    (avx2, f32, div, $a:expr, $b:expr) => { std::arch::x86_64::_mm256_div_ps($a, $b) };
    (avx2, f32, fma, $a:expr, $b:expr, $c:expr) => { std::arch::x86_64::_mm256_fmadd_ps($a, $b, $c) };
    (avx2, f32, neg, $a:expr) => {
        std::arch::x86_64::_mm256_sub_ps(std::arch::x86_64::_mm256_setzero_ps(), $a)
    };
    (avx2, f32, abs, $a:expr) => {
        std::arch::x86_64::_mm256_andnot_ps(std::arch::x86_64::_mm256_set1_ps(-0.0), $a)
    };
    (avx2, f32, max, $a:expr, $b:expr) => { std::arch::x86_64::_mm256_max_ps($a, $b) };
    (avx2, f32, min, $a:expr, $b:expr) => { std::arch::x86_64::_mm256_min_ps($a, $b) };
    (avx2, f32, sqrt, $a:expr) => { std::arch::x86_64::_mm256_sqrt_ps($a) };
    (avx2, f32, reduce_sum, $v:expr) => {{
        let hi = std::arch::x86_64::_mm256_extractf128_ps($v, 1);
        let lo = std::arch::x86_64::_mm256_castps256_ps128($v);
        let s = std::arch::x86_64::_mm_add_ps(hi, lo);
        let s = std::arch::x86_64::_mm_add_ps(s, std::arch::x86_64::_mm_movehl_ps(s, s));
        let s = std::arch::x86_64::_mm_add_ss(s, std::arch::x86_64::_mm_shuffle_ps(s, s, 1));
        std::arch::x86_64::_mm_cvtss_f32(s)
    }};
    (avx2, f32, reduce_max, $v:expr) => {{
        let hi = std::arch::x86_64::_mm256_extractf128_ps($v, 1);
        let lo = std::arch::x86_64::_mm256_castps256_ps128($v);
        let m = std::arch::x86_64::_mm_max_ps(hi, lo);
        let m = std::arch::x86_64::_mm_max_ps(m, std::arch::x86_64::_mm_movehl_ps(m, m));
        let m = std::arch::x86_64::_mm_max_ss(m, std::arch::x86_64::_mm_shuffle_ps(m, m, 1));
        std::arch::x86_64::_mm_cvtss_f32(m)
    }};

    // ── AVX-512 ─────────────────────────────────────────────────────────
    (avx512, f32, lanes) => { 16usize };
    (avx512, f32, zero) => { std::arch::x86_64::_mm512_setzero_ps() };
    (avx512, f32, splat, $v:expr) => { std::arch::x86_64::_mm512_set1_ps($v) };
    (avx512, f32, load, $p:expr) => { std::arch::x86_64::_mm512_loadu_ps($p) };
    (avx512, f32, store, $p:expr, $v:expr) => { std::arch::x86_64::_mm512_storeu_ps($p, $v) };
    (avx512, f32, add, $a:expr, $b:expr) => { std::arch::x86_64::_mm512_add_ps($a, $b) };
    (avx512, f32, sub, $a:expr, $b:expr) => { std::arch::x86_64::_mm512_sub_ps($a, $b) };
    (avx512, f32, mul, $a:expr, $b:expr) => { std::arch::x86_64::_mm512_mul_ps($a, $b) };
    (avx512, f32, div, $a:expr, $b:expr) => { std::arch::x86_64::_mm512_div_ps($a, $b) };
    (avx512, f32, fma, $a:expr, $b:expr, $c:expr) => { std::arch::x86_64::_mm512_fmadd_ps($a, $b, $c) };
    (avx512, f32, neg, $a:expr) => {
        std::arch::x86_64::_mm512_sub_ps(std::arch::x86_64::_mm512_setzero_ps(), $a)
    };
    (avx512, f32, abs, $a:expr) => { std::arch::x86_64::_mm512_abs_ps($a) };
    (avx512, f32, max, $a:expr, $b:expr) => { std::arch::x86_64::_mm512_max_ps($a, $b) };
    (avx512, f32, min, $a:expr, $b:expr) => { std::arch::x86_64::_mm512_min_ps($a, $b) };
    (avx512, f32, sqrt, $a:expr) => { std::arch::x86_64::_mm512_sqrt_ps($a) };
    (avx512, f32, reduce_sum, $v:expr) => { std::arch::x86_64::_mm512_reduce_add_ps($v) };
    (avx512, f32, reduce_max, $v:expr) => { std::arch::x86_64::_mm512_reduce_max_ps($v) };

    // ── NEON (aarch64) ──────────────────────────────────────────────────
    (neon, f32, lanes) => { 4usize };
    (neon, f32, zero) => { std::arch::aarch64::vdupq_n_f32(0.0) };
    (neon, f32, splat, $v:expr) => { std::arch::aarch64::vdupq_n_f32($v) };
    (neon, f32, load, $p:expr) => { std::arch::aarch64::vld1q_f32($p) };
    (neon, f32, store, $p:expr, $v:expr) => { std::arch::aarch64::vst1q_f32($p, $v) };
    (neon, f32, add, $a:expr, $b:expr) => { std::arch::aarch64::vaddq_f32($a, $b) };
    (neon, f32, sub, $a:expr, $b:expr) => { std::arch::aarch64::vsubq_f32($a, $b) };
    (neon, f32, mul, $a:expr, $b:expr) => { std::arch::aarch64::vmulq_f32($a, $b) };
    (neon, f32, div, $a:expr, $b:expr) => { std::arch::aarch64::vdivq_f32($a, $b) };
    (neon, f32, fma, $a:expr, $b:expr, $c:expr) => { std::arch::aarch64::vfmaq_f32($c, $a, $b) };
    (neon, f32, neg, $a:expr) => { std::arch::aarch64::vnegq_f32($a) };
    (neon, f32, abs, $a:expr) => { std::arch::aarch64::vabsq_f32($a) };
    (neon, f32, max, $a:expr, $b:expr) => { std::arch::aarch64::vmaxq_f32($a, $b) };
    (neon, f32, min, $a:expr, $b:expr) => { std::arch::aarch64::vminq_f32($a, $b) };
    (neon, f32, sqrt, $a:expr) => { std::arch::aarch64::vsqrtq_f32($a) };
    (neon, f32, reduce_sum, $v:expr) => { std::arch::aarch64::vaddvq_f32($v) };
    (neon, f32, reduce_max, $v:expr) => { std::arch::aarch64::vmaxvq_f32($v) };
}
