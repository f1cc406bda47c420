//! Elementwise binary arithmetic (add/sub/mul/div).
//!
//! Contract: f32 operands, `dst` shaped like `src0` with dense rows, and
//! `src1` broadcastable onto `src0` by whole-number repetition (including
//! repetition inside a row when `ne10 < ne00`). `dst` may alias `src0`:
//! outputs depend only on same-index inputs, so partitioned in-place writes
//! need no pre-copy.

use crate::dtype::DType;
use crate::error::contract;
use crate::simd;
use crate::tensor::thread_range;
use crate::threadpool::ComputeParams;

use super::NodeCtx;

type VecFn = unsafe fn(usize, *mut f32, *const f32, *const f32);

fn binary_op(params: &ComputeParams, ctx: &NodeCtx, vec_fn: VecFn, scalar_fn: fn(f32, f32) -> f32) {
    let src0 = ctx.src(0);
    let src1 = ctx.src(1);
    let dst = ctx.dst;

    contract!(
        src0.dtype == DType::F32 && src1.dtype == DType::F32 && dst.dtype == DType::F32,
        "{}: f32 operands required, got {}/{}/{}",
        dst.op.name(),
        src0.dtype.name(),
        src1.dtype.name(),
        dst.dtype.name()
    );
    contract!(dst.same_shape(src0), "{}: dst shape != src0 shape", dst.op.name());
    contract!(src1.can_repeat(src0), "{}: src1 not broadcastable to src0", dst.op.name());
    contract!(src0.nb[0] == 4 && dst.nb[0] == 4, "{}: dense rows required", dst.op.name());

    let ne00 = src0.ne[0];
    let ne10 = src1.ne[0];
    let [_, ne11, ne12, ne13] = src1.ne;
    let [_, ne1, ne2, _] = src0.ne;

    let nr = src0.nrows();
    let (ir0, ir1) = thread_range(nr, params.ith, params.nth);

    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1;
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
        let i13 = i3 % ne13;
        let i12 = i2 % ne12;
        let i11 = i1 % ne11;

        unsafe {
            let d = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
            let s0 = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
            let s1_row = src1.row_ptr(ctx.arena, i11, i12, i13);

            if src1.nb[0] == 4 {
                // src1 rows are dense; repeat them across the dst row
                contract!(ne00 % ne10 == 0, "{}: ne00 % ne10 != 0", dst.op.name());
                let s1 = s1_row as *const f32;
                let mut r = 0i64;
                while r < ne00 {
                    vec_fn(ne10 as usize, d.add(r as usize), s0.add(r as usize), s1);
                    r += ne10;
                }
            } else {
                for i0 in 0..ne00 {
                    let s1v = *(s1_row.add((i0 % ne10) as usize * src1.nb[0]) as *const f32);
                    *d.add(i0 as usize) = scalar_fn(*s0.add(i0 as usize), s1v);
                }
            }
        }
    }
}

pub(crate) fn compute_add(params: &ComputeParams, ctx: &NodeCtx) {
    binary_op(params, ctx, simd::vec_add_f32, |a, b| a + b);
}

pub(crate) fn compute_sub(params: &ComputeParams, ctx: &NodeCtx) {
    binary_op(params, ctx, simd::vec_sub_f32, |a, b| a - b);
}

pub(crate) fn compute_mul(params: &ComputeParams, ctx: &NodeCtx) {
    binary_op(params, ctx, simd::vec_mul_f32, |a, b| a * b);
}

pub(crate) fn compute_div(params: &ComputeParams, ctx: &NodeCtx) {
    binary_op(params, ctx, simd::vec_div_f32, |a, b| a / b);
}
