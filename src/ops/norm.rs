//! Normalization family: Norm (layer norm), RmsNorm, GroupNorm, SoftMax.
//!
//! Row statistics accumulate in f64. SoftMax supports an optional additive
//! mask (f32 or f16) and per-head ALiBi slopes derived from `max_bias`;
//! masked rows stage `x*scale + slope*mask` in the per-thread scratch slice
//! before the max/exp/normalize passes.

use half::f16;

use crate::dtype::DType;
use crate::error::contract;
use crate::simd;
use crate::tensor::thread_range;
use crate::threadpool::ComputeParams;

use super::NodeCtx;

pub(crate) fn compute_norm(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    let eps = dst.op_param_f32(0);
    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "norm: f32 required");
    contract!(dst.same_shape(src0), "norm: shape mismatch");
    contract!(src0.nb[0] == 4 && dst.nb[0] == 4);
    contract!(eps > 0.0, "norm: eps must be positive");

    let ne0 = src0.ne[0] as usize;
    let [_, ne1, ne2, _] = src0.ne;
    let (ir0, ir1) = thread_range(src0.nrows(), params.ith, params.nth);
    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1;
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
        unsafe {
            let x = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
            let y = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
            let mean = simd::vec_sum_f32(ne0, x) / ne0 as f64;
            let mut sum2 = 0.0f64;
            for i in 0..ne0 {
                let v = f64::from(*x.add(i)) - mean;
                *y.add(i) = v as f32;
                sum2 += v * v;
            }
            let variance = sum2 / ne0 as f64;
            let inv_std = (1.0 / (variance + f64::from(eps)).sqrt()) as f32;
            simd::vec_scale_f32(ne0, y, inv_std);
        }
    }
}

pub(crate) fn compute_rms_norm(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    let eps = dst.op_param_f32(0);
    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "rms_norm: f32 required");
    contract!(dst.same_shape(src0), "rms_norm: shape mismatch");
    contract!(src0.nb[0] == 4 && dst.nb[0] == 4);

    let ne0 = src0.ne[0] as usize;
    let [_, ne1, ne2, _] = src0.ne;
    let (ir0, ir1) = thread_range(src0.nrows(), params.ith, params.nth);
    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1;
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
        unsafe {
            let x = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
            let y = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
            let mut sum2 = 0.0f64;
            for i in 0..ne0 {
                let v = f64::from(*x.add(i));
                sum2 += v * v;
            }
            let mean2 = (sum2 / ne0 as f64) as f32;
            let inv_rms = 1.0 / (mean2 + eps).sqrt();
            if !std::ptr::eq(x, y) {
                std::ptr::copy_nonoverlapping(x, y, ne0);
            }
            simd::vec_scale_f32(ne0, y, inv_rms);
        }
    }
}

/// Group normalization over the channel dimension (`ne[2]`), groups
/// partitioned across threads.
pub(crate) fn compute_group_norm(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    let eps = dst.op_param_f32(0);
    let n_groups = dst.op_param_i32(1) as i64;
    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "group_norm: f32 required");
    contract!(dst.same_shape(src0), "group_norm: shape mismatch");
    contract!(src0.nb[0] == 4 && dst.nb[0] == 4);
    contract!(n_groups > 0 && n_groups <= src0.ne[2], "group_norm: bad group count");

    let ne0 = src0.ne[0] as usize;
    let [_, ne1, ne2, ne3] = src0.ne;
    let channels_per_group = (ne2 + n_groups - 1) / n_groups;

    for i3 in 0..ne3 {
        let (ig0, ig1) = thread_range(n_groups, params.ith, params.nth);
        for ig in ig0..ig1 {
            let c0 = ig * channels_per_group;
            let c1 = (c0 + channels_per_group).min(ne2);
            // mean
            let mut sum = 0.0f64;
            for i2 in c0..c1 {
                for i1 in 0..ne1 {
                    unsafe {
                        let x = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
                        sum += simd::vec_sum_f32(ne0, x);
                    }
                }
            }
            let n = ((c1 - c0) * ne1) as f64 * ne0 as f64;
            let mean = sum / n;
            // variance, writing centered values through
            let mut sum2 = 0.0f64;
            for i2 in c0..c1 {
                for i1 in 0..ne1 {
                    unsafe {
                        let x = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
                        let y = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
                        for i in 0..ne0 {
                            let v = f64::from(*x.add(i)) - mean;
                            *y.add(i) = v as f32;
                            sum2 += v * v;
                        }
                    }
                }
            }
            let variance = sum2 / n;
            let inv_std = (1.0 / (variance + f64::from(eps)).sqrt()) as f32;
            for i2 in c0..c1 {
                for i1 in 0..ne1 {
                    unsafe {
                        let y = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
                        simd::vec_scale_f32(ne0, y, inv_std);
                    }
                }
            }
        }
    }
}

/// ALiBi slope for head `h` given `max_bias` and the head count rounded
/// down to a power of two.
fn alibi_slope(h: i64, n_head_log2: i64, m0: f32, m1: f32, max_bias: f32) -> f32 {
    if max_bias <= 0.0 {
        return 1.0;
    }
    if h < n_head_log2 {
        m0.powi(h as i32 + 1)
    } else {
        m1.powi(2 * (h - n_head_log2) as i32 + 1)
    }
}

/// Softmax over rows with optional additive mask and ALiBi slope bias.
/// `op_params`: `[0]` scale (f32), `[1]` max_bias (f32).
pub(crate) fn compute_soft_max(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let mask = ctx.src_opt(1);
    let dst = ctx.dst;
    let scale = dst.op_param_f32(0);
    let max_bias = dst.op_param_f32(1);

    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "soft_max: f32 required");
    contract!(dst.same_shape(src0), "soft_max: shape mismatch");
    contract!(src0.is_contiguous_rows() && dst.is_contiguous_rows());

    let ne0 = src0.ne[0] as usize;
    let [_, ne1, ne2, _] = src0.ne;
    if let Some(m) = mask {
        contract!(
            matches!(m.dtype, DType::F32 | DType::F16),
            "soft_max: mask must be f32 or f16"
        );
        contract!(m.ne[0] == src0.ne[0] && m.ne[1] >= src0.ne[1], "soft_max: mask too small");
        contract!(m.is_contiguous_rows());
    }

    let n_head = ne2;
    let n_head_log2 = 1i64 << (63 - (n_head.max(1) as u64).leading_zeros() as i64);
    let m0 = 2.0f32.powf(-max_bias / n_head_log2 as f32);
    let m1 = 2.0f32.powf(-max_bias / 2.0 / n_head_log2 as f32);

    contract!(
        params.wsize >= params.nth * ne0 * 4,
        "soft_max: scratch too small"
    );
    let wp = unsafe { (params.wdata as *mut f32).add(params.ith * ne0) };

    let (ir0, ir1) = thread_range(src0.nrows(), params.ith, params.nth);
    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1;
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
        let slope = alibi_slope(i2, n_head_log2, m0, m1, max_bias);
        unsafe {
            let x = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
            let y = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;

            // stage x*scale (+ slope*mask) into scratch
            std::ptr::copy_nonoverlapping(x, wp, ne0);
            simd::vec_scale_f32(ne0, wp, scale);
            if let Some(m) = mask {
                let mrow = m.row_ptr(ctx.arena, i1 % m.ne[1], i2 % m.ne[2], i3 % m.ne[3]);
                match m.dtype {
                    DType::F32 => {
                        simd::vec_mad_f32(ne0, wp, mrow as *const f32, slope);
                    }
                    _ => {
                        let mh = mrow as *const f16;
                        for i in 0..ne0 {
                            *wp.add(i) += slope * (*mh.add(i)).to_f32();
                        }
                    }
                }
            }

            let max = simd::vec_max_f32(ne0, wp);
            if max == f32::NEG_INFINITY {
                // fully masked row
                std::ptr::write_bytes(y, 0, ne0);
                continue;
            }
            let mut sum = 0.0f64;
            for i in 0..ne0 {
                let v = *wp.add(i);
                if v == f32::NEG_INFINITY {
                    *y.add(i) = 0.0;
                } else {
                    let e = (v - max).exp();
                    sum += f64::from(e);
                    *y.add(i) = e;
                }
            }
            simd::vec_scale_f32(ne0, y, (1.0 / sum) as f32);
        }
    }
}
