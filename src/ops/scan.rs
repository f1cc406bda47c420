//! Selective state-space scan.
//!
//! Sources: `s0` initial state `[d_state, d_inner]`, `x` `[d_inner, n_tok]`,
//! `dt` `[d_inner, n_tok]`, `A` `[d_state, d_inner]`, `B` `[d_state, n_tok]`,
//! `C` `[d_state, n_tok]`, all f32. dst is flat f32 holding the outputs
//! `y[d_inner]` per token followed by the final state `[d_state, d_inner]`.
//!
//! Time steps are sequentially dependent, so parallelism is across the
//! channel dimension: each thread owns a disjoint channel range and walks
//! all tokens for it, updating its slice of the state in place in the dst
//! state region.

use crate::dtype::DType;
use crate::error::contract;
use crate::tensor::thread_range;
use crate::threadpool::ComputeParams;

use super::NodeCtx;

#[inline(always)]
fn softplus(x: f32) -> f32 {
    // matches the reference discretization: linear above 20 to avoid exp overflow
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

pub(crate) fn compute_ssm_scan(params: &ComputeParams, ctx: &NodeCtx) {
    let s0 = ctx.src(0);
    let x = ctx.src(1);
    let dt = ctx.src(2);
    let a = ctx.src(3);
    let b = ctx.src(4);
    let c = ctx.src(5);
    let dst = ctx.dst;

    contract!(
        [s0, x, dt, a, b, c].iter().all(|t| t.dtype == DType::F32) && dst.dtype == DType::F32,
        "ssm_scan: f32 required"
    );
    let d_state = s0.ne[0];
    let d_inner = s0.ne[1];
    let n_tok = x.ne[1];
    contract!(x.ne[0] == d_inner && dt.same_shape(x), "ssm_scan: x/dt shape mismatch");
    contract!(a.ne[0] == d_state && a.ne[1] == d_inner, "ssm_scan: A shape mismatch");
    contract!(
        b.ne[0] == d_state && b.ne[1] == n_tok && c.same_shape(b),
        "ssm_scan: B/C shape mismatch"
    );
    contract!(
        dst.nelements() == d_inner * n_tok + d_state * d_inner,
        "ssm_scan: dst must hold y and final state"
    );
    contract!(dst.is_contiguous());
    contract!([s0, x, dt, a, b, c].iter().all(|t| t.is_contiguous_rows()));

    let (ic0, ic1) = thread_range(d_inner, params.ith, params.nth);

    unsafe {
        let y_base = dst.data_ptr(ctx.arena) as *mut f32;
        let state_base = y_base.add((d_inner * n_tok) as usize);

        // seed this thread's state columns from s0
        for i1 in ic0..ic1 {
            let src = s0.row_ptr(ctx.arena, i1, 0, 0) as *const f32;
            let out = state_base.add((i1 * d_state) as usize);
            std::ptr::copy_nonoverlapping(src, out, d_state as usize);
        }

        for it in 0..n_tok {
            let x_row = x.row_ptr(ctx.arena, it, 0, 0) as *const f32;
            let dt_row = dt.row_ptr(ctx.arena, it, 0, 0) as *const f32;
            let b_row = b.row_ptr(ctx.arena, it, 0, 0) as *const f32;
            let c_row = c.row_ptr(ctx.arena, it, 0, 0) as *const f32;
            let y_row = y_base.add((it * d_inner) as usize);

            for i1 in ic0..ic1 {
                let dt_sp = softplus(*dt_row.add(i1 as usize));
                let x_dt = *x_row.add(i1 as usize) * dt_sp;
                let a_row = a.row_ptr(ctx.arena, i1, 0, 0) as *const f32;
                let state = state_base.add((i1 * d_state) as usize);

                let mut sum = 0.0f32;
                for i0 in 0..d_state as usize {
                    let decay = (dt_sp * *a_row.add(i0)).exp();
                    let s_new = *state.add(i0) * decay + *b_row.add(i0) * x_dt;
                    sum += s_new * *c_row.add(i0);
                    *state.add(i0) = s_new;
                }
                *y_row.add(i1 as usize) = sum;
            }
        }
    }
}
