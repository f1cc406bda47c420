//! Matrix multiplication: chunked, cache-blocked, work-stealing; plus the
//! grouped mixture-of-experts variant.
//!
//! `src0` `[K, M, e2, e3]` (any dtype with a dot kernel), `src1`
//! `[K, N, b2, b3]` f32 (or already in `src0`'s dot type), dst
//! `[M, N, b2, b3]` f32 with `b2 % e2 == 0`, `b3 % e3 == 0`.
//!
//! Phase 1 converts `src1` rows to the dot-side dtype in parallel into the
//! scratch workspace, then thread 0 re-arms the shared chunk counter and
//! everyone barriers. Phase 2 walks a 2-D chunk grid: each thread starts on
//! chunk `ith` and then claims further chunks with a single atomic
//! fetch-add. When the grid is too fine relative to the thread count, or on
//! multi-node NUMA systems, a static one-slice-per-thread split replaces
//! stealing (remote-node steals measured slower than the imbalance they
//! fix). Inside a chunk the loops are tiled 16x16 so a loaded `src1` column
//! is reused across 16 `src0` rows.

use crate::context::EngineContext;
use crate::dtype::DType;
use crate::error::contract;
use crate::tensor::{thread_range, Tensor};
use crate::threadpool::ComputeParams;
use crate::traits::{type_traits, VecDotFn};

use super::NodeCtx;

/// Inner tile edge; one src1 column stays hot across this many src0 rows.
const TILE: i64 = 16;

fn round_up64(v: usize) -> usize {
    (v + 63) & !63
}

/// Scratch bytes needed to convert all of src1 to the dot-side dtype.
pub(crate) fn src1_conversion_size(src0: &Tensor, src1: &Tensor) -> usize {
    let vdt = type_traits(src0.dtype).vec_dot_type;
    if src1.dtype == vdt {
        0
    } else {
        round_up64(vdt.row_size(src1.ne[0]) * src1.nrows() as usize)
    }
}

/// Scratch bytes for mul_mat_id: conversion area plus expert bucket tables.
pub(crate) fn mul_mat_id_ws_size(src0: &Tensor, src1: &Tensor) -> usize {
    let n_expert = src0.ne[2] as usize;
    let n_rows = src1.ne[1] as usize;
    let vdt = type_traits(src0.dtype).vec_dot_type;
    round_up64(vdt.row_size(src1.ne[0]) * n_rows) + 4 * (n_expert + 1 + n_rows)
}

/// Convert this thread's share of src1 rows into `wdata`.
fn convert_src1(params: &ComputeParams, ctx: &NodeCtx, src1: &Tensor, vdt: DType) {
    contract!(
        src1.dtype == DType::F32 && src1.nb[0] == 4,
        "mul_mat: src1 must be dense f32 to convert to {}",
        vdt.name()
    );
    let from_float = type_traits(vdt).from_float.unwrap();
    let row_sz = vdt.row_size(src1.ne[0]);
    let ne10 = src1.ne[0] as usize;
    let [_, ne11, ne12, _] = src1.ne;
    let (ir0, ir1) = thread_range(src1.nrows(), params.ith, params.nth);
    for ir in ir0..ir1 {
        let i13 = ir / (ne12 * ne11);
        let i12 = (ir - i13 * ne12 * ne11) / ne11;
        let i11 = ir - i13 * ne12 * ne11 - i12 * ne11;
        unsafe {
            let s = src1.row_ptr(ctx.arena, i11, i12, i13) as *const f32;
            let d = params.wdata.add(ir as usize * row_sz);
            from_float(std::slice::from_raw_parts(s, ne10), d);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn mul_mat_chunk(
    ctx: &NodeCtx,
    src0: &Tensor,
    src1: &Tensor,
    vec_dot: VecDotFn,
    converted: Option<(*const u8, usize)>,
    ir0_range: (i64, i64),
    ir1_range: (i64, i64),
) {
    let dst = ctx.dst;
    let ne00 = src0.ne[0] as usize;
    let [_, ne11, ne12, _] = src1.ne;
    let r2 = src1.ne[2] / src0.ne[2];
    let r3 = src1.ne[3] / src0.ne[3];

    let (ir0_start, ir0_end) = ir0_range;
    let (ir1_start, ir1_end) = ir1_range;

    let mut iir1 = ir1_start;
    while iir1 < ir1_end {
        let mut iir0 = ir0_start;
        while iir0 < ir0_end {
            for ir1 in iir1..(iir1 + TILE).min(ir1_end) {
                let i13 = ir1 / (ne12 * ne11);
                let i12 = (ir1 - i13 * ne12 * ne11) / ne11;
                let i11 = ir1 - i13 * ne12 * ne11 - i12 * ne11;
                let i03 = i13 / r3;
                let i02 = i12 / r2;
                unsafe {
                    let col = match converted {
                        Some((base, row_sz)) => base.add(ir1 as usize * row_sz),
                        None => src1.row_ptr(ctx.arena, i11, i12, i13) as *const u8,
                    };
                    let out = dst.element_ptr(ctx.arena, 0, i11, i12, i13) as *mut f32;
                    for ir0 in iir0..(iir0 + TILE).min(ir0_end) {
                        let row = src0.row_ptr(ctx.arena, ir0, i02, i03) as *const u8;
                        *out.add(ir0 as usize) = vec_dot(ne00, row, col);
                    }
                }
            }
            iir0 += TILE;
        }
        iir1 += TILE;
    }
}

pub(crate) fn compute_mul_mat(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let src1 = ctx.src(1);
    let dst = ctx.dst;

    let traits = type_traits(src0.dtype);
    contract!(
        traits.vec_dot.is_some(),
        "mul_mat: no dot kernel for {}",
        src0.dtype.name()
    );
    let vec_dot = traits.vec_dot.unwrap();
    let vdt = traits.vec_dot_type;

    contract!(src0.ne[0] == src1.ne[0], "mul_mat: inner dims {} vs {}", src0.ne[0], src1.ne[0]);
    contract!(
        dst.ne[0] == src0.ne[1] && dst.ne[1] == src1.ne[1],
        "mul_mat: dst shape mismatch"
    );
    contract!(
        dst.ne[2] == src1.ne[2] && dst.ne[3] == src1.ne[3],
        "mul_mat: dst batch mismatch"
    );
    contract!(
        src1.ne[2] % src0.ne[2] == 0 && src1.ne[3] % src0.ne[3] == 0,
        "mul_mat: src0 not broadcastable over src1 batches"
    );
    contract!(src0.is_contiguous_rows(), "mul_mat: src0 rows must be dense");
    contract!(dst.dtype == DType::F32 && dst.nb[0] == 4, "mul_mat: f32 dst required");

    let row_sz = vdt.row_size(src1.ne[0]);
    let convert = src1.dtype != vdt;
    if convert {
        contract!(
            params.wsize >= row_sz * src1.nrows() as usize,
            "mul_mat: scratch too small for src1 conversion"
        );
        convert_src1(params, ctx, src1, vdt);
    } else {
        contract!(src1.is_contiguous_rows(), "mul_mat: src1 rows must be dense");
    }
    if params.ith == 0 {
        params.chunk_store(params.nth as i64);
    }
    params.barrier();

    let converted = convert.then(|| (params.wdata as *const u8, row_sz));

    let nr0 = dst.ne[0];
    let nr1 = dst.nrows();
    let engine = EngineContext::get();

    let (chunk0, chunk1) = if nr0 == 1 || nr1 == 1 {
        (64, 64)
    } else {
        (engine.cache.chunk_rows0 as i64, engine.cache.chunk_rows1 as i64)
    };
    let mut nchunk0 = (nr0 + chunk0 - 1) / chunk0;
    let mut nchunk1 = (nr1 + chunk1 - 1) / chunk1;

    // Too few chunks to make stealing worthwhile, or multi-node NUMA:
    // fall back to one static slice per thread along the longer dim.
    let nth = params.nth as i64;
    if nchunk0 * nchunk1 < nth * 4 || engine.numa.is_multi_node() {
        if nr0 > nr1 {
            nchunk0 = nth;
            nchunk1 = 1;
        } else {
            nchunk0 = 1;
            nchunk1 = nth;
        }
    }
    let dr0 = (nr0 + nchunk0 - 1) / nchunk0;
    let dr1 = (nr1 + nchunk1 - 1) / nchunk1;
    let total = nchunk0 * nchunk1;

    let mut cur = params.ith as i64;
    while cur < total {
        let c0 = cur % nchunk0;
        let c1 = cur / nchunk0;
        let ir0 = ((c0 * dr0).min(nr0), ((c0 + 1) * dr0).min(nr0));
        let ir1 = ((c1 * dr1).min(nr1), ((c1 + 1) * dr1).min(nr1));
        mul_mat_chunk(ctx, src0, src1, vec_dot, converted, ir0, ir1);
        if nth >= total {
            break;
        }
        cur = params.chunk_next();
    }
}

/// Grouped ("mixture-of-experts") matmul.
///
/// `src0` `[K, M, n_expert]` expert slabs, `src1` `[K, N]` f32, `src2`
/// (ids) i32 `[N]` selecting one expert per src1 row; dst `[M, N]` f32.
/// Rows are bucketed by expert (counting pass on thread 0), then each
/// expert group runs the blocked loop with the group's rows statically
/// split across threads.
pub(crate) fn compute_mul_mat_id(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let src1 = ctx.src(1);
    let ids = ctx.src(2);
    let dst = ctx.dst;

    let traits = type_traits(src0.dtype);
    contract!(
        traits.vec_dot.is_some(),
        "mul_mat_id: no dot kernel for {}",
        src0.dtype.name()
    );
    let vec_dot = traits.vec_dot.unwrap();
    let vdt = traits.vec_dot_type;

    let n_expert = src0.ne[2];
    let n_rows = src1.ne[1];
    contract!(src0.ne[0] == src1.ne[0], "mul_mat_id: inner dim mismatch");
    contract!(ids.dtype == DType::I32 && ids.ne[0] == n_rows, "mul_mat_id: bad ids");
    contract!(
        dst.ne[0] == src0.ne[1] && dst.ne[1] == n_rows,
        "mul_mat_id: dst shape mismatch"
    );
    contract!(src0.is_contiguous_rows() && dst.dtype == DType::F32 && dst.nb[0] == 4);

    let row_sz = vdt.row_size(src1.ne[0]);
    let conv_bytes = round_up64(row_sz * n_rows as usize);
    contract!(
        params.wsize >= conv_bytes + 4 * (n_expert as usize + 1 + n_rows as usize),
        "mul_mat_id: scratch too small"
    );

    let convert = src1.dtype != vdt;
    if convert {
        convert_src1(params, ctx, src1, vdt);
    } else {
        contract!(src1.is_contiguous_rows());
    }

    let starts = unsafe { params.wdata.add(conv_bytes) as *mut i32 };
    let rows_by_expert = unsafe { starts.add(n_expert as usize + 1) };

    if params.ith == 0 {
        // counting sort of rows by selected expert
        unsafe {
            std::ptr::write_bytes(starts, 0, n_expert as usize + 1);
            for r in 0..n_rows {
                let e = *(ids.element_ptr(ctx.arena, r, 0, 0, 0) as *const i32);
                contract!(
                    (0..n_expert as i32).contains(&e),
                    "mul_mat_id: expert id {e} out of range 0..{n_expert}"
                );
                *starts.add(e as usize + 1) += 1;
            }
            for e in 0..n_expert as usize {
                let prev = *starts.add(e);
                *starts.add(e + 1) += prev;
            }
            let mut cursor: Vec<i32> = (0..n_expert as usize)
                .map(|e| *starts.add(e))
                .collect();
            for r in 0..n_rows {
                let e = *(ids.element_ptr(ctx.arena, r, 0, 0, 0) as *const i32) as usize;
                *rows_by_expert.add(cursor[e] as usize) = r as i32;
                cursor[e] += 1;
            }
        }
    }
    params.barrier();

    let ne00 = src0.ne[0] as usize;
    let m = src0.ne[1];
    for e in 0..n_expert {
        let (g0, g1) = unsafe { (*starts.add(e as usize), *starts.add(e as usize + 1)) };
        let group_len = (g1 - g0) as i64;
        if group_len == 0 {
            continue;
        }
        let (t0, t1) = thread_range(group_len, params.ith, params.nth);
        for gi in t0..t1 {
            unsafe {
                let r = *rows_by_expert.add((g0 as i64 + gi) as usize) as i64;
                let col = if convert {
                    params.wdata.add(r as usize * row_sz) as *const u8
                } else {
                    src1.row_ptr(ctx.arena, r, 0, 0) as *const u8
                };
                let out = dst.element_ptr(ctx.arena, 0, r, 0, 0) as *mut f32;
                let mut ir0 = 0i64;
                while ir0 < m {
                    for i in ir0..(ir0 + TILE).min(m) {
                        let row = src0.row_ptr(ctx.arena, i, e, 0) as *const u8;
                        *out.add(i as usize) = vec_dot(ne00, row, col);
                    }
                    ir0 += TILE;
                }
            }
        }
    }
}
