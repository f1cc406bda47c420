//! Reductions: Sum, SumRows, Mean, ArgMax, CountEqual.
//!
//! Whole-tensor reductions (Sum/Mean) run on thread 0 only; they are
//! memory-bound and a partitioned version measured no faster. SumRows and
//! ArgMax partition rows. CountEqual accumulates per-thread partials in the
//! scratch workspace and reduces them on thread 0 after a barrier.

use crate::dtype::DType;
use crate::error::contract;
use crate::simd;
use crate::tensor::thread_range;
use crate::threadpool::ComputeParams;

use super::NodeCtx;

pub(crate) fn compute_sum(params: &ComputeParams, ctx: &NodeCtx) {
    if params.ith != 0 {
        return;
    }
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "sum: f32 required");
    contract!(dst.is_scalar(), "sum: scalar dst required");
    contract!(src0.nb[0] == 4, "sum: dense rows required");

    let ne0 = src0.ne[0] as usize;
    let [_, ne1, ne2, ne3] = src0.ne;
    let mut sum = 0.0f64;
    for i3 in 0..ne3 {
        for i2 in 0..ne2 {
            for i1 in 0..ne1 {
                unsafe {
                    let row = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
                    sum += simd::vec_sum_f32(ne0, row);
                }
            }
        }
    }
    unsafe { *(dst.data_ptr(ctx.arena) as *mut f32) = sum as f32 }
}

pub(crate) fn compute_sum_rows(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "sum_rows: f32 required");
    contract!(
        dst.ne[0] == 1
            && dst.ne[1] == src0.ne[1]
            && dst.ne[2] == src0.ne[2]
            && dst.ne[3] == src0.ne[3],
        "sum_rows: dst must be [1, ne1, ne2, ne3]"
    );
    contract!(src0.nb[0] == 4);

    let ne0 = src0.ne[0] as usize;
    let [_, ne1, ne2, _] = src0.ne;
    let (ir0, ir1) = thread_range(src0.nrows(), params.ith, params.nth);
    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1;
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
        unsafe {
            let row = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
            let d = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
            *d = simd::vec_sum_f32(ne0, row) as f32;
        }
    }
}

pub(crate) fn compute_mean(params: &ComputeParams, ctx: &NodeCtx) {
    if params.ith != 0 {
        return;
    }
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "mean: f32 required");
    contract!(dst.is_scalar(), "mean: scalar dst required");
    contract!(src0.is_contiguous(), "mean: contiguous src required");

    let n = src0.nelements() as usize;
    unsafe {
        let sum = simd::vec_sum_f32(n, src0.data_ptr(ctx.arena) as *const f32);
        *(dst.data_ptr(ctx.arena) as *mut f32) = (sum / n as f64) as f32;
    }
}

/// Per-row argmax of a 2-D tensor into an i32 row.
pub(crate) fn compute_argmax(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    contract!(src0.dtype == DType::F32 && dst.dtype == DType::I32, "argmax: f32 -> i32");
    contract!(src0.ne[2] == 1 && src0.ne[3] == 1, "argmax: 2-D src required");
    contract!(dst.ne[0] == src0.ne[1], "argmax: dst len != src rows");
    contract!(src0.nb[0] == 4);

    let ne0 = src0.ne[0];
    let (ir0, ir1) = thread_range(src0.ne[1], params.ith, params.nth);
    for ir in ir0..ir1 {
        unsafe {
            let row = src0.row_ptr(ctx.arena, ir, 0, 0) as *const f32;
            let mut best = f32::NEG_INFINITY;
            let mut best_i = 0i32;
            for i0 in 0..ne0 {
                let v = *row.add(i0 as usize);
                if v > best {
                    best = v;
                    best_i = i0 as i32;
                }
            }
            *(dst.element_ptr(ctx.arena, ir, 0, 0, 0) as *mut i32) = best_i;
        }
    }
}

/// Count of equal elements between two i32 tensors, i64 scalar result.
/// Per-thread partials land in the scratch workspace; thread 0 reduces
/// after the barrier.
pub(crate) fn compute_count_equal(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let src1 = ctx.src(1);
    let dst = ctx.dst;
    contract!(
        src0.dtype == DType::I32 && src1.dtype == DType::I32,
        "count_equal: i32 operands required"
    );
    contract!(src0.same_shape(src1), "count_equal: shape mismatch");
    contract!(dst.dtype == DType::I64 && dst.is_scalar());
    contract!(params.wsize >= params.nth * 8, "count_equal: scratch too small");

    let ne0 = src0.ne[0];
    let [_, ne1, ne2, _] = src0.ne;
    let (ir0, ir1) = thread_range(src0.nrows(), params.ith, params.nth);

    let mut count = 0i64;
    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1;
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
        for i0 in 0..ne0 {
            unsafe {
                let a = *(src0.element_ptr(ctx.arena, i0, i1, i2, i3) as *const i32);
                let b = *(src1.element_ptr(ctx.arena, i0, i1, i2, i3) as *const i32);
                count += i64::from(a == b);
            }
        }
    }

    let sums = params.wdata as *mut i64;
    unsafe { *sums.add(params.ith) = count };
    params.barrier();
    if params.ith == 0 {
        let mut total = 0i64;
        for t in 0..params.nth {
            total += unsafe { *sums.add(t) };
        }
        unsafe { *(dst.data_ptr(ctx.arena) as *mut i64) = total };
    }
}
