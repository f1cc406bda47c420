//! Rotary position embedding.
//!
//! `src0`: activations `[head_dim, n_head, n_tokens, n_batch]` (f32, dense
//! rows); `src1`: positions (i32, one per token). Supports the adjacent-pair
//! (NORM) and split-half (NEOX) layouts, frequency base/scale, and the
//! YaRN extrapolation/interpolation mix controlled by `ext_factor`,
//! `attn_factor`, `beta_fast`, `beta_slow` against the original training
//! context length.
//!
//! `op_params`: `[0]` n_dims, `[1]` mode, `[2]` n_ctx_orig,
//! `[3]` freq_base (f32), `[4]` freq_scale (f32), `[5]` ext_factor (f32),
//! `[6]` attn_factor (f32), `[7]` beta_fast (f32), `[8]` beta_slow (f32),
//! `[9]` backward flag.

use crate::dtype::DType;
use crate::error::contract;
use crate::tensor::thread_range;
use crate::threadpool::ComputeParams;

use super::{NodeCtx, ROPE_MODE_NEOX, ROPE_MODE_NORM};

/// Dimension index below which rotation is pure extrapolation at `beta`
/// rotations over the original context.
fn corr_dim(n_dims: i64, n_ctx_orig: i64, beta: f32, freq_base: f32) -> f32 {
    n_dims as f32 * (n_ctx_orig as f32 / (beta * 2.0 * std::f32::consts::PI)).ln()
        / (2.0 * freq_base.ln())
}

/// `[start, end]` dimension range over which the YaRN ramp blends
/// interpolation into extrapolation.
fn corr_dims(
    n_dims: i64,
    n_ctx_orig: i64,
    freq_base: f32,
    beta_fast: f32,
    beta_slow: f32,
) -> (f32, f32) {
    let start = corr_dim(n_dims, n_ctx_orig, beta_fast, freq_base).floor();
    let end = corr_dim(n_dims, n_ctx_orig, beta_slow, freq_base).ceil();
    (start.max(0.0), end.min(n_dims as f32 - 1.0))
}

#[inline]
fn ramp(low: f32, high: f32, i0: i64) -> f32 {
    let y = (i0 as f32 / 2.0 - low) / (high - low).max(0.001);
    1.0 - y.clamp(0.0, 1.0)
}

/// Rotation angle and magnitude for dimension pair `i0` at extrapolated
/// angle `theta_extrap`.
#[allow(clippy::too_many_arguments)]
fn rope_yarn(
    theta_extrap: f32,
    freq_scale: f32,
    corr: (f32, f32),
    i0: i64,
    ext_factor: f32,
    mut mscale: f32,
) -> (f32, f32) {
    let theta_interp = freq_scale * theta_extrap;
    let mut theta = theta_interp;
    if ext_factor != 0.0 {
        let mix = ramp(corr.0, corr.1, i0) * ext_factor;
        theta = theta_interp * (1.0 - mix) + theta_extrap * mix;
        mscale *= 1.0 + 0.1 * (1.0 / freq_scale).ln();
    }
    (theta.cos() * mscale, theta.sin() * mscale)
}

pub(crate) fn compute_rope(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let pos = ctx.src(1);
    let dst = ctx.dst;

    let n_dims = dst.op_param_i32(0) as i64;
    let mode = dst.op_param_i32(1);
    let n_ctx_orig = dst.op_param_i32(2) as i64;
    let freq_base = dst.op_param_f32(3);
    let freq_scale = dst.op_param_f32(4);
    let ext_factor = dst.op_param_f32(5);
    let attn_factor = dst.op_param_f32(6);
    let beta_fast = dst.op_param_f32(7);
    let beta_slow = dst.op_param_f32(8);
    let backward = dst.op_param_i32(9) != 0;

    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "rope: f32 required");
    contract!(dst.same_shape(src0), "rope: shape mismatch");
    contract!(pos.dtype == DType::I32, "rope: positions must be i32");
    contract!(pos.ne[0] >= src0.ne[2], "rope: {} positions for {} tokens", pos.ne[0], src0.ne[2]);
    contract!(n_dims > 0 && n_dims <= src0.ne[0] && n_dims % 2 == 0, "rope: bad n_dims");
    contract!(
        mode == ROPE_MODE_NORM || mode == ROPE_MODE_NEOX,
        "rope: unknown mode {mode}"
    );
    contract!(src0.nb[0] == 4 && dst.nb[0] == 4);

    let theta_scale = freq_base.powf(-2.0 / n_dims as f32);
    let corr = corr_dims(n_dims, n_ctx_orig, freq_base, beta_fast, beta_slow);
    let sin_sign = if backward { -1.0f32 } else { 1.0 };

    let [ne0, ne1, ne2, _] = src0.ne;
    let nr = src0.nrows();
    let (ir0, ir1) = thread_range(nr, params.ith, params.nth);

    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1; // token
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1; // head
        unsafe {
            let p = *(pos.element_ptr(ctx.arena, i2, 0, 0, 0) as *const i32);
            let src_row = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
            let dst_row = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;

            let mut theta_base = p as f32;
            for i0 in (0..n_dims).step_by(2) {
                let (cos_t, sin_t) =
                    rope_yarn(theta_base, freq_scale, corr, i0, ext_factor, attn_factor);
                let sin_t = sin_t * sin_sign;
                theta_base *= theta_scale;

                let (ia, ib) = if mode == ROPE_MODE_NEOX {
                    ((i0 / 2) as usize, (i0 / 2 + n_dims / 2) as usize)
                } else {
                    (i0 as usize, i0 as usize + 1)
                };
                let x0 = *src_row.add(ia);
                let x1 = *src_row.add(ib);
                *dst_row.add(ia) = x0 * cos_t - x1 * sin_t;
                *dst_row.add(ib) = x0 * sin_t + x1 * cos_t;
            }
            // pass-through for the unrotated tail
            for i0 in n_dims..ne0 {
                *dst_row.add(i0 as usize) = *src_row.add(i0 as usize);
            }
        }
    }
}
