//! Vector helper routines over the `simd_primitive!` layer.
//!
//! Each helper has one body macro expanded into per-ISA `#[target_feature]`
//! functions plus a scalar fallback, and a public dispatcher that selects on
//! the context's detected [`IsaLevel`]. Kernels call these with raw row
//! pointers; callers guarantee `n` elements are readable/writable.
//!
//! Accumulation rules: the scalar dot paths accumulate in f64, the SIMD dot
//! paths in multiple independent f32 lanes reduced once at the end. Both
//! stay within the documented relative-error bound of a same-length f64
//! reference dot.

use crate::context;
use crate::isa::IsaLevel;
use half::{bf16, f16};

// ── body macros ──────────────────────────────────────────────────────────

macro_rules! vec_dot_f32_body {
    ($isa:ident, $n:expr, $x:expr, $y:expr) => {{
        let n = $n;
        let x = $x;
        let y = $y;
        let lanes = simd_primitive!($isa, f32, lanes);
        let mut acc0 = simd_primitive!($isa, f32, zero);
        let mut acc1 = simd_primitive!($isa, f32, zero);
        let mut i = 0usize;
        while i + 2 * lanes <= n {
            let a0 = simd_primitive!($isa, f32, load, x.add(i));
            let b0 = simd_primitive!($isa, f32, load, y.add(i));
            let a1 = simd_primitive!($isa, f32, load, x.add(i + lanes));
            let b1 = simd_primitive!($isa, f32, load, y.add(i + lanes));
            acc0 = simd_primitive!($isa, f32, fma, a0, b0, acc0);
            acc1 = simd_primitive!($isa, f32, fma, a1, b1, acc1);
            i += 2 * lanes;
        }
        while i + lanes <= n {
            let a = simd_primitive!($isa, f32, load, x.add(i));
            let b = simd_primitive!($isa, f32, load, y.add(i));
            acc0 = simd_primitive!($isa, f32, fma, a, b, acc0);
            i += lanes;
        }
        let v = simd_primitive!($isa, f32, add, acc0, acc1);
        let mut sum = simd_primitive!($isa, f32, reduce_sum, v);
        while i < n {
            sum += *x.add(i) * *y.add(i);
            i += 1;
        }
        sum
    }};
}

macro_rules! vec_map2_body {
    ($isa:ident, $op:ident, $n:expr, $z:expr, $x:expr, $y:expr) => {{
        let n = $n;
        let z = $z;
        let x = $x;
        let y = $y;
        let lanes = simd_primitive!($isa, f32, lanes);
        let mut i = 0usize;
        while i + lanes <= n {
            let a = simd_primitive!($isa, f32, load, x.add(i));
            let b = simd_primitive!($isa, f32, load, y.add(i));
            let r = simd_primitive!($isa, f32, $op, a, b);
            simd_primitive!($isa, f32, store, z.add(i), r);
            i += lanes;
        }
        while i < n {
            let a = *x.add(i);
            let b = *y.add(i);
            *z.add(i) = simd_primitive!(scalar, f32, $op, a, b);
            i += 1;
        }
    }};
}

macro_rules! vec_mad_body {
    ($isa:ident, $n:expr, $y:expr, $x:expr, $v:expr) => {{
        let n = $n;
        let y = $y;
        let x = $x;
        let lanes = simd_primitive!($isa, f32, lanes);
        let vv = simd_primitive!($isa, f32, splat, $v);
        let mut i = 0usize;
        while i + lanes <= n {
            let a = simd_primitive!($isa, f32, load, x.add(i));
            let b = simd_primitive!($isa, f32, load, y.add(i));
            let r = simd_primitive!($isa, f32, fma, a, vv, b);
            simd_primitive!($isa, f32, store, y.add(i), r);
            i += lanes;
        }
        while i < n {
            *y.add(i) = (*x.add(i)).mul_add($v, *y.add(i));
            i += 1;
        }
    }};
}

macro_rules! vec_scale_body {
    ($isa:ident, $n:expr, $y:expr, $v:expr) => {{
        let n = $n;
        let y = $y;
        let lanes = simd_primitive!($isa, f32, lanes);
        let vv = simd_primitive!($isa, f32, splat, $v);
        let mut i = 0usize;
        while i + lanes <= n {
            let a = simd_primitive!($isa, f32, load, y.add(i));
            let r = simd_primitive!($isa, f32, mul, a, vv);
            simd_primitive!($isa, f32, store, y.add(i), r);
            i += lanes;
        }
        while i < n {
            *y.add(i) *= $v;
            i += 1;
        }
    }};
}

macro_rules! vec_max_body {
    ($isa:ident, $n:expr, $x:expr) => {{
        let n = $n;
        let x = $x;
        let lanes = simd_primitive!($isa, f32, lanes);
        let mut best = f32::NEG_INFINITY;
        let mut i = 0usize;
        if n >= lanes {
            let mut m = simd_primitive!($isa, f32, splat, f32::NEG_INFINITY);
            while i + lanes <= n {
                let a = simd_primitive!($isa, f32, load, x.add(i));
                m = simd_primitive!($isa, f32, max, m, a);
                i += lanes;
            }
            best = simd_primitive!($isa, f32, reduce_max, m);
        }
        while i < n {
            best = best.max(*x.add(i));
            i += 1;
        }
        best
    }};
}

// ── per-arch expansions ──────────────────────────────────────────────────

#[cfg(target_arch = "x86_64")]
mod x86 {
    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn dot_f32_avx2(n: usize, x: *const f32, y: *const f32) -> f32 {
        vec_dot_f32_body!(avx2, n, x, y)
    }
    #[target_feature(enable = "avx512f", enable = "avx512bw")]
    pub unsafe fn dot_f32_avx512(n: usize, x: *const f32, y: *const f32) -> f32 {
        vec_dot_f32_body!(avx512, n, x, y)
    }

    macro_rules! gen_map2_x86 {
        ($avx2:ident, $avx512:ident, $op:ident) => {
            #[target_feature(enable = "avx2", enable = "fma")]
            pub unsafe fn $avx2(n: usize, z: *mut f32, x: *const f32, y: *const f32) {
                vec_map2_body!(avx2, $op, n, z, x, y)
            }
            #[target_feature(enable = "avx512f", enable = "avx512bw")]
            pub unsafe fn $avx512(n: usize, z: *mut f32, x: *const f32, y: *const f32) {
                vec_map2_body!(avx512, $op, n, z, x, y)
            }
        };
    }
    gen_map2_x86!(add_f32_avx2, add_f32_avx512, add);
    gen_map2_x86!(sub_f32_avx2, sub_f32_avx512, sub);
    gen_map2_x86!(mul_f32_avx2, mul_f32_avx512, mul);
    gen_map2_x86!(div_f32_avx2, div_f32_avx512, div);

    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn mad_f32_avx2(n: usize, y: *mut f32, x: *const f32, v: f32) {
        vec_mad_body!(avx2, n, y, x, v)
    }
    #[target_feature(enable = "avx512f", enable = "avx512bw")]
    pub unsafe fn mad_f32_avx512(n: usize, y: *mut f32, x: *const f32, v: f32) {
        vec_mad_body!(avx512, n, y, x, v)
    }

    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn scale_f32_avx2(n: usize, y: *mut f32, v: f32) {
        vec_scale_body!(avx2, n, y, v)
    }
    #[target_feature(enable = "avx512f", enable = "avx512bw")]
    pub unsafe fn scale_f32_avx512(n: usize, y: *mut f32, v: f32) {
        vec_scale_body!(avx512, n, y, v)
    }

    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn max_f32_avx2(n: usize, x: *const f32) -> f32 {
        vec_max_body!(avx2, n, x)
    }
    #[target_feature(enable = "avx512f", enable = "avx512bw")]
    pub unsafe fn max_f32_avx512(n: usize, x: *const f32) -> f32 {
        vec_max_body!(avx512, n, x)
    }

    /// f16 row dot via F16C upconversion, f32 FMA accumulators.
    #[target_feature(enable = "avx2", enable = "fma", enable = "f16c")]
    pub unsafe fn dot_f16_avx2(n: usize, x: *const half::f16, y: *const half::f16) -> f32 {
        use std::arch::x86_64::*;
        let mut acc = _mm256_setzero_ps();
        let mut i = 0usize;
        while i + 8 <= n {
            let a = _mm256_cvtph_ps(_mm_loadu_si128(x.add(i) as *const __m128i));
            let b = _mm256_cvtph_ps(_mm_loadu_si128(y.add(i) as *const __m128i));
            acc = _mm256_fmadd_ps(a, b, acc);
            i += 8;
        }
        let mut sum = simd_primitive!(avx2, f32, reduce_sum, acc);
        while i < n {
            sum += (*x.add(i)).to_f32() * (*y.add(i)).to_f32();
            i += 1;
        }
        sum
    }

    #[target_feature(enable = "avx2", enable = "f16c")]
    pub unsafe fn cvt_f16_to_f32_avx2(n: usize, y: *mut f32, x: *const half::f16) {
        use std::arch::x86_64::*;
        let mut i = 0usize;
        while i + 8 <= n {
            let v = _mm256_cvtph_ps(_mm_loadu_si128(x.add(i) as *const __m128i));
            _mm256_storeu_ps(y.add(i), v);
            i += 8;
        }
        while i < n {
            *y.add(i) = (*x.add(i)).to_f32();
            i += 1;
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod arm {
    pub unsafe fn dot_f32_neon(n: usize, x: *const f32, y: *const f32) -> f32 {
        vec_dot_f32_body!(neon, n, x, y)
    }
    macro_rules! gen_map2_neon {
        ($name:ident, $op:ident) => {
            pub unsafe fn $name(n: usize, z: *mut f32, x: *const f32, y: *const f32) {
                vec_map2_body!(neon, $op, n, z, x, y)
            }
        };
    }
    gen_map2_neon!(add_f32_neon, add);
    gen_map2_neon!(sub_f32_neon, sub);
    gen_map2_neon!(mul_f32_neon, mul);
    gen_map2_neon!(div_f32_neon, div);

    pub unsafe fn mad_f32_neon(n: usize, y: *mut f32, x: *const f32, v: f32) {
        vec_mad_body!(neon, n, y, x, v)
    }
    pub unsafe fn scale_f32_neon(n: usize, y: *mut f32, v: f32) {
        vec_scale_body!(neon, n, y, v)
    }
    pub unsafe fn max_f32_neon(n: usize, x: *const f32) -> f32 {
        vec_max_body!(neon, n, x)
    }
}

// ── scalar fallbacks ─────────────────────────────────────────────────────

unsafe fn dot_f32_scalar(n: usize, x: *const f32, y: *const f32) -> f32 {
    let mut sum = 0.0f64;
    for i in 0..n {
        sum += f64::from(*x.add(i)) * f64::from(*y.add(i));
    }
    sum as f32
}

macro_rules! gen_map2_scalar {
    ($name:ident, $op:ident) => {
        unsafe fn $name(n: usize, z: *mut f32, x: *const f32, y: *const f32) {
            vec_map2_body!(scalar, $op, n, z, x, y)
        }
    };
}
gen_map2_scalar!(add_f32_scalar, add);
gen_map2_scalar!(sub_f32_scalar, sub);
gen_map2_scalar!(mul_f32_scalar, mul);
gen_map2_scalar!(div_f32_scalar, div);

unsafe fn mad_f32_scalar(n: usize, y: *mut f32, x: *const f32, v: f32) {
    vec_mad_body!(scalar, n, y, x, v)
}
unsafe fn scale_f32_scalar(n: usize, y: *mut f32, v: f32) {
    vec_scale_body!(scalar, n, y, v)
}
unsafe fn max_f32_scalar(n: usize, x: *const f32) -> f32 {
    vec_max_body!(scalar, n, x)
}

// ── public dispatchers ───────────────────────────────────────────────────

macro_rules! dispatch {
    ($scalar:path, $avx2:path, $avx512:path, $neon:path, ($($arg:expr),*)) => {
        match context::isa() {
            #[cfg(target_arch = "x86_64")]
            IsaLevel::Avx512 => $avx512($($arg),*),
            #[cfg(target_arch = "x86_64")]
            IsaLevel::Avx2 => $avx2($($arg),*),
            #[cfg(target_arch = "aarch64")]
            IsaLevel::Neon => $neon($($arg),*),
            _ => $scalar($($arg),*),
        }
    };
}

/// Dot product of two f32 rows.
#[inline]
pub unsafe fn vec_dot_f32(n: usize, x: *const f32, y: *const f32) -> f32 {
    dispatch!(
        dot_f32_scalar,
        x86::dot_f32_avx2,
        x86::dot_f32_avx512,
        arm::dot_f32_neon,
        (n, x, y)
    )
}

/// z = x + y
#[inline]
pub unsafe fn vec_add_f32(n: usize, z: *mut f32, x: *const f32, y: *const f32) {
    dispatch!(
        add_f32_scalar,
        x86::add_f32_avx2,
        x86::add_f32_avx512,
        arm::add_f32_neon,
        (n, z, x, y)
    )
}

/// z = x - y
#[inline]
pub unsafe fn vec_sub_f32(n: usize, z: *mut f32, x: *const f32, y: *const f32) {
    dispatch!(
        sub_f32_scalar,
        x86::sub_f32_avx2,
        x86::sub_f32_avx512,
        arm::sub_f32_neon,
        (n, z, x, y)
    )
}

/// z = x * y
#[inline]
pub unsafe fn vec_mul_f32(n: usize, z: *mut f32, x: *const f32, y: *const f32) {
    dispatch!(
        mul_f32_scalar,
        x86::mul_f32_avx2,
        x86::mul_f32_avx512,
        arm::mul_f32_neon,
        (n, z, x, y)
    )
}

/// z = x / y
#[inline]
pub unsafe fn vec_div_f32(n: usize, z: *mut f32, x: *const f32, y: *const f32) {
    dispatch!(
        div_f32_scalar,
        x86::div_f32_avx2,
        x86::div_f32_avx512,
        arm::div_f32_neon,
        (n, z, x, y)
    )
}

/// y += x * v
#[inline]
pub unsafe fn vec_mad_f32(n: usize, y: *mut f32, x: *const f32, v: f32) {
    dispatch!(
        mad_f32_scalar,
        x86::mad_f32_avx2,
        x86::mad_f32_avx512,
        arm::mad_f32_neon,
        (n, y, x, v)
    )
}

/// y *= v
#[inline]
pub unsafe fn vec_scale_f32(n: usize, y: *mut f32, v: f32) {
    dispatch!(
        scale_f32_scalar,
        x86::scale_f32_avx2,
        x86::scale_f32_avx512,
        arm::scale_f32_neon,
        (n, y, v)
    )
}

/// Maximum element of an f32 row (NEG_INFINITY for n == 0).
#[inline]
pub unsafe fn vec_max_f32(n: usize, x: *const f32) -> f32 {
    dispatch!(
        max_f32_scalar,
        x86::max_f32_avx2,
        x86::max_f32_avx512,
        arm::max_f32_neon,
        (n, x)
    )
}

/// Sum of an f32 row, f64 accumulation.
#[inline]
pub unsafe fn vec_sum_f32(n: usize, x: *const f32) -> f64 {
    let mut sum = 0.0f64;
    for i in 0..n {
        sum += f64::from(*x.add(i));
    }
    sum
}

/// Dot product of two f16 rows, f32 accumulation.
#[inline]
pub unsafe fn vec_dot_f16(n: usize, x: *const f16, y: *const f16) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if matches!(context::isa(), IsaLevel::Avx2 | IsaLevel::Avx512)
            && std::arch::is_x86_feature_detected!("f16c")
        {
            return x86::dot_f16_avx2(n, x, y);
        }
    }
    let mut sum = 0.0f64;
    for i in 0..n {
        sum += f64::from((*x.add(i)).to_f32()) * f64::from((*y.add(i)).to_f32());
    }
    sum as f32
}

/// Dot product of two bf16 rows, f32 accumulation.
#[inline]
pub unsafe fn vec_dot_bf16(n: usize, x: *const bf16, y: *const bf16) -> f32 {
    let mut sum = 0.0f64;
    for i in 0..n {
        sum += f64::from((*x.add(i)).to_f32()) * f64::from((*y.add(i)).to_f32());
    }
    sum as f32
}

/// Widen an f16 row to f32.
#[inline]
pub unsafe fn vec_cvt_f16_to_f32(n: usize, y: *mut f32, x: *const f16) {
    #[cfg(target_arch = "x86_64")]
    {
        if matches!(context::isa(), IsaLevel::Avx2 | IsaLevel::Avx512)
            && std::arch::is_x86_feature_detected!("f16c")
        {
            return x86::cvt_f16_to_f32_avx2(n, y, x);
        }
    }
    for i in 0..n {
        *y.add(i) = (*x.add(i)).to_f32();
    }
}

/// Narrow an f32 row to f16 (round to nearest even).
#[inline]
pub unsafe fn vec_cvt_f32_to_f16(n: usize, y: *mut f16, x: *const f32) {
    for i in 0..n {
        *y.add(i) = f16::from_f32(*x.add(i));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot_ref(x: &[f32], y: &[f32]) -> f64 {
        x.iter()
            .zip(y)
            .map(|(&a, &b)| f64::from(a) * f64::from(b))
            .sum()
    }

    #[test]
    fn dot_matches_reference() {
        for n in [0usize, 1, 3, 8, 17, 64, 100, 255] {
            let x: Vec<f32> = (0..n).map(|i| (i as f32 * 0.37).sin()).collect();
            let y: Vec<f32> = (0..n).map(|i| (i as f32 * 0.11).cos()).collect();
            let got = unsafe { vec_dot_f32(n, x.as_ptr(), y.as_ptr()) };
            let want = dot_ref(&x, &y);
            assert!(
                (f64::from(got) - want).abs() <= 1e-4 * (1.0 + want.abs()),
                "n={n}: got {got}, want {want}"
            );
        }
    }

    #[test]
    fn map2_tail_handling() {
        let n = 21;
        let x: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let y: Vec<f32> = (0..n).map(|i| (i + 1) as f32).collect();
        let mut z = vec![0.0f32; n];
        unsafe { vec_add_f32(n, z.as_mut_ptr(), x.as_ptr(), y.as_ptr()) };
        for i in 0..n {
            assert_eq!(z[i], x[i] + y[i]);
        }
        unsafe { vec_div_f32(n, z.as_mut_ptr(), x.as_ptr(), y.as_ptr()) };
        for i in 0..n {
            assert_eq!(z[i], x[i] / y[i]);
        }
    }

    #[test]
    fn mad_scale_max() {
        let n = 33;
        let x: Vec<f32> = (0..n).map(|i| i as f32 * 0.5).collect();
        let mut y: Vec<f32> = vec![1.0; n];
        unsafe { vec_mad_f32(n, y.as_mut_ptr(), x.as_ptr(), 2.0) };
        for i in 0..n {
            assert_eq!(y[i], 1.0 + x[i] * 2.0);
        }
        unsafe { vec_scale_f32(n, y.as_mut_ptr(), 0.5) };
        assert_eq!(y[2], (1.0 + 2.0 * 0.5 * 2.0) * 0.5);
        let m = unsafe { vec_max_f32(n, x.as_ptr()) };
        assert_eq!(m, x[n - 1]);
    }

    #[test]
    fn f16_roundtrip_and_dot() {
        let n = 40;
        let xf: Vec<f32> = (0..n).map(|i| (i as f32 - 20.0) * 0.125).collect();
        let xh: Vec<f16> = xf.iter().map(|&v| f16::from_f32(v)).collect();
        let mut back = vec![0.0f32; n];
        unsafe { vec_cvt_f16_to_f32(n, back.as_mut_ptr(), xh.as_ptr()) };
        assert_eq!(xf, back); // all values exactly representable in f16

        let got = unsafe { vec_dot_f16(n, xh.as_ptr(), xh.as_ptr()) };
        let want = dot_ref(&xf, &xf);
        assert!((f64::from(got) - want).abs() <= 1e-3 * (1.0 + want.abs()));
    }
}
