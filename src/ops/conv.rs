//! Convolution family: Im2Col, ConvTranspose1D, ConvTranspose2D, pooling.
//!
//! Im2Col rewrites convolution as matmul: each destination row is one
//! output position's gathered input patch. The transpose convolutions pack
//! the kernel and source into the scratch workspace (thread 0, then a
//! barrier) so the inner loops are dense dot products. Pooling is
//! memory-bound and runs on thread 0.

use half::f16;

use crate::dtype::DType;
use crate::error::contract;
use crate::simd;
use crate::tensor::thread_range;
use crate::threadpool::ComputeParams;

use super::{NodeCtx, PoolOp};

/// `op_params`: `[0]` s0, `[1]` s1, `[2]` p0, `[3]` p1, `[4]` d0, `[5]` d1,
/// `[6]` is_2d.
///
/// 2-D: kernel shape `[KW, KH, IC, OC]` (shape only), input
/// `[IW, IH, IC, N]`, dst `[IC*KH*KW, OW, OH, N]`.
/// 1-D: kernel `[K, IC, OC]`, input `[IW, IC, N]`, dst `[IC*K, OW, N, 1]`.
pub(crate) fn compute_im2col(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let src1 = ctx.src(1);
    let dst = ctx.dst;

    let s0 = dst.op_param_i32(0) as i64;
    let s1 = dst.op_param_i32(1) as i64;
    let p0 = dst.op_param_i32(2) as i64;
    let p1 = dst.op_param_i32(3) as i64;
    let d0 = dst.op_param_i32(4) as i64;
    let d1 = dst.op_param_i32(5) as i64;
    let is_2d = dst.op_param_i32(6) != 0;

    contract!(src1.dtype == DType::F32, "im2col: f32 input required");
    contract!(
        matches!(dst.dtype, DType::F32 | DType::F16),
        "im2col: f32/f16 dst required"
    );
    contract!(s0 > 0 && (!is_2d || s1 > 0), "im2col: bad stride");
    contract!(dst.is_contiguous_rows());

    let (kw, kh, ic) = if is_2d {
        (src0.ne[0], src0.ne[1], src0.ne[2])
    } else {
        (src0.ne[0], 1, src0.ne[1])
    };
    let (iw, ih) = if is_2d {
        (src1.ne[0], src1.ne[1])
    } else {
        (src1.ne[0], 1)
    };
    contract!(
        dst.ne[0] == ic * kh * kw,
        "im2col: dst row length {} != IC*KH*KW {}",
        dst.ne[0],
        ic * kh * kw
    );
    if is_2d {
        contract!(src1.ne[2] == ic, "im2col: channel mismatch");
    } else {
        contract!(src1.ne[1] == ic, "im2col: channel mismatch");
    }

    let (ow, oh) = if is_2d {
        (dst.ne[1], dst.ne[2])
    } else {
        (dst.ne[1], 1)
    };

    let nr = dst.nrows();
    let (ir0, ir1) = thread_range(nr, params.ith, params.nth);
    for ir in ir0..ir1 {
        // decompose dst row index into (ow, oh, batch)
        let iow = ir % ow;
        let rest = ir / ow;
        let (ioh, ib) = if is_2d { (rest % oh, rest / oh) } else { (0, rest) };

        unsafe {
            let drow = if is_2d {
                dst.row_ptr(ctx.arena, iow, ioh, ib)
            } else {
                dst.row_ptr(ctx.arena, iow, ib, 0)
            };
            for iic in 0..ic {
                for ikh in 0..kh {
                    for ikw in 0..kw {
                        let iiw = iow * s0 + ikw * d0 - p0;
                        let iih = ioh * s1 + ikh * d1 - p1;
                        let v = if iiw < 0 || iiw >= iw || iih < 0 || iih >= ih {
                            0.0
                        } else if is_2d {
                            *(src1.element_ptr(ctx.arena, iiw, iih, iic, ib) as *const f32)
                        } else {
                            *(src1.element_ptr(ctx.arena, iiw, iic, ib, 0) as *const f32)
                        };
                        let slot = (iic * kh * kw + ikh * kw + ikw) as usize;
                        match dst.dtype {
                            DType::F32 => *(drow as *mut f32).add(slot) = v,
                            _ => *(drow as *mut f16).add(slot) = f16::from_f32(v),
                        }
                    }
                }
            }
        }
    }
}

/// Kernel `[K, OC, IC]`, input `[L, IC]`, dst `[OL, OC]` with
/// `OL = (L-1)*s0 + K`. `op_params[0]` = s0.
pub(crate) fn compute_conv_transpose_1d(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let src1 = ctx.src(1);
    let dst = ctx.dst;
    let s0 = dst.op_param_i32(0) as i64;

    contract!(
        src0.dtype == DType::F32 && src1.dtype == DType::F32 && dst.dtype == DType::F32,
        "conv_transpose_1d: f32 required"
    );
    contract!(src0.ne[2] == src1.ne[1], "conv_transpose_1d: channel mismatch");
    contract!(s0 > 0, "conv_transpose_1d: bad stride");
    let (k, oc, icn) = (src0.ne[0], src0.ne[1], src0.ne[2]);
    let l = src1.ne[0];
    let ol = (l - 1) * s0 + k;
    contract!(dst.ne[0] == ol && dst.ne[1] == oc, "conv_transpose_1d: bad dst shape");
    contract!(dst.is_contiguous());

    let nk = (k * oc * icn) as usize;
    let nsrc = (l * icn) as usize;
    contract!(params.wsize >= (nk + nsrc) * 4, "conv_transpose_1d: scratch too small");

    let wk = params.wdata as *mut f32;
    let ws = unsafe { wk.add(nk) };

    if params.ith == 0 {
        unsafe {
            // kernel (K, OC, IC) -> [OC][K][IC]
            for i02 in 0..icn {
                for i01 in 0..oc {
                    for i00 in 0..k {
                        let v = *(src0.element_ptr(ctx.arena, i00, i01, i02, 0) as *const f32);
                        *wk.add(((i01 * k + i00) * icn + i02) as usize) = v;
                    }
                }
            }
            // source (L, IC) -> [L][IC]
            for i11 in 0..icn {
                for i10 in 0..l {
                    let v = *(src1.element_ptr(ctx.arena, i10, i11, 0, 0) as *const f32);
                    *ws.add((i10 * icn + i11) as usize) = v;
                }
            }
        }
    }
    params.barrier();

    let (oc0, oc1) = thread_range(oc, params.ith, params.nth);
    for i1 in oc0..oc1 {
        unsafe {
            let drow = dst.row_ptr(ctx.arena, i1, 0, 0) as *mut f32;
            std::ptr::write_bytes(drow, 0, ol as usize);
            for i10 in 0..l {
                for i00 in 0..k {
                    let v = simd::vec_dot_f32(
                        icn as usize,
                        wk.add(((i1 * k + i00) * icn) as usize),
                        ws.add((i10 * icn) as usize),
                    );
                    *drow.add((i10 * s0 + i00) as usize) += v;
                }
            }
        }
    }
}

/// Kernel `[KW, KH, OC, IC]`, input `[W, H, IC, 1]`, dst `[OW, OH, OC]`
/// with `OW = (W-1)*st + KW`, `OH = (H-1)*st + KH`. `op_params[0]` = st.
pub(crate) fn compute_conv_transpose_2d(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let src1 = ctx.src(1);
    let dst = ctx.dst;
    let st = dst.op_param_i32(0) as i64;

    contract!(
        src0.dtype == DType::F32 && src1.dtype == DType::F32 && dst.dtype == DType::F32,
        "conv_transpose_2d: f32 required"
    );
    contract!(src0.ne[3] == src1.ne[2], "conv_transpose_2d: channel mismatch");
    contract!(st > 0, "conv_transpose_2d: bad stride");
    let (kw, kh, oc, icn) = (src0.ne[0], src0.ne[1], src0.ne[2], src0.ne[3]);
    let (w, h) = (src1.ne[0], src1.ne[1]);
    let ow = (w - 1) * st + kw;
    let oh = (h - 1) * st + kh;
    contract!(
        dst.ne[0] == ow && dst.ne[1] == oh && dst.ne[2] == oc,
        "conv_transpose_2d: bad dst shape"
    );
    contract!(dst.is_contiguous());

    let nk = (kw * kh * oc * icn) as usize;
    let nsrc = (w * h * icn) as usize;
    contract!(params.wsize >= (nk + nsrc) * 4, "conv_transpose_2d: scratch too small");

    let wk = params.wdata as *mut f32;
    let ws = unsafe { wk.add(nk) };

    if params.ith == 0 {
        unsafe {
            // kernel (KW, KH, OC, IC) -> [OC][KH][KW][IC]
            for i3 in 0..icn {
                for i2 in 0..oc {
                    for i1 in 0..kh {
                        for i0 in 0..kw {
                            let v = *(src0.element_ptr(ctx.arena, i0, i1, i2, i3) as *const f32);
                            *wk.add((((i2 * kh + i1) * kw + i0) * icn + i3) as usize) = v;
                        }
                    }
                }
            }
            // source (W, H, IC) -> [H][W][IC]
            for i2 in 0..icn {
                for i1 in 0..h {
                    for i0 in 0..w {
                        let v = *(src1.element_ptr(ctx.arena, i0, i1, i2, 0) as *const f32);
                        *ws.add(((i1 * w + i0) * icn + i2) as usize) = v;
                    }
                }
            }
        }
    }
    params.barrier();

    let (oc0, oc1) = thread_range(oc, params.ith, params.nth);
    for i2 in oc0..oc1 {
        unsafe {
            let plane = dst.element_ptr(ctx.arena, 0, 0, i2, 0) as *mut f32;
            std::ptr::write_bytes(plane, 0, (ow * oh) as usize);
            for i1 in 0..h {
                for i0 in 0..w {
                    for ikh in 0..kh {
                        for ikw in 0..kw {
                            let v = simd::vec_dot_f32(
                                icn as usize,
                                wk.add((((i2 * kh + ikh) * kw + ikw) * icn) as usize),
                                ws.add(((i1 * w + i0) * icn) as usize),
                            );
                            let o = (i1 * st + ikh) * ow + i0 * st + ikw;
                            *plane.add(o as usize) += v;
                        }
                    }
                }
            }
        }
    }
}

/// `op_params`: `[0]` pool op, `[1]` k0, `[2]` s0, `[3]` p0.
/// Input `[IW, C, N, 1]` -> dst `[OW, C, N, 1]`.
pub(crate) fn compute_pool_1d(params: &ComputeParams, ctx: &NodeCtx) {
    if params.ith != 0 {
        return;
    }
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    let op = if dst.op_param_i32(0) == 0 { PoolOp::Max } else { PoolOp::Avg };
    let k0 = dst.op_param_i32(1) as i64;
    let s0 = dst.op_param_i32(2) as i64;
    let p0 = dst.op_param_i32(3) as i64;

    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "pool_1d: f32 required");
    contract!(k0 > 0 && s0 > 0, "pool_1d: bad kernel/stride");
    contract!(dst.ne[1] == src0.ne[1] && dst.ne[2] == src0.ne[2]);

    let iw = src0.ne[0];
    let ow = dst.ne[0];
    for i2 in 0..src0.ne[2] {
        for i1 in 0..src0.ne[1] {
            unsafe {
                let s = src0.row_ptr(ctx.arena, i1, i2, 0) as *const f32;
                let d = dst.row_ptr(ctx.arena, i1, i2, 0) as *mut f32;
                for io in 0..ow {
                    let mut acc = match op {
                        PoolOp::Max => f32::NEG_INFINITY,
                        PoolOp::Avg => 0.0,
                    };
                    for ik in 0..k0 {
                        let ii = io * s0 + ik - p0;
                        if ii < 0 || ii >= iw {
                            continue;
                        }
                        let v = *s.add(ii as usize);
                        match op {
                            PoolOp::Max => acc = acc.max(v),
                            PoolOp::Avg => acc += v,
                        }
                    }
                    *d.add(io as usize) = match op {
                        PoolOp::Max => acc,
                        PoolOp::Avg => acc / k0 as f32,
                    };
                }
            }
        }
    }
}

/// `op_params`: `[0]` pool op, `[1]` k0, `[2]` k1, `[3]` s0, `[4]` s1,
/// `[5]` p0, `[6]` p1. Input `[IW, IH, C, N]` -> dst `[OW, OH, C, N]`.
pub(crate) fn compute_pool_2d(params: &ComputeParams, ctx: &NodeCtx) {
    if params.ith != 0 {
        return;
    }
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    let op = if dst.op_param_i32(0) == 0 { PoolOp::Max } else { PoolOp::Avg };
    let k0 = dst.op_param_i32(1) as i64;
    let k1 = dst.op_param_i32(2) as i64;
    let s0 = dst.op_param_i32(3) as i64;
    let s1 = dst.op_param_i32(4) as i64;
    let p0 = dst.op_param_i32(5) as i64;
    let p1 = dst.op_param_i32(6) as i64;

    contract!(src0.dtype == DType::F32 && dst.dtype == DType::F32, "pool_2d: f32 required");
    contract!(k0 > 0 && k1 > 0 && s0 > 0 && s1 > 0, "pool_2d: bad kernel/stride");
    contract!(dst.ne[2] == src0.ne[2] && dst.ne[3] == src0.ne[3]);

    let (iw, ih) = (src0.ne[0], src0.ne[1]);
    let (ow, oh) = (dst.ne[0], dst.ne[1]);
    for i3 in 0..src0.ne[3] {
        for i2 in 0..src0.ne[2] {
            for io1 in 0..oh {
                unsafe {
                    let d = dst.row_ptr(ctx.arena, io1, i2, i3) as *mut f32;
                    for io0 in 0..ow {
                        let mut acc = match op {
                            PoolOp::Max => f32::NEG_INFINITY,
                            PoolOp::Avg => 0.0,
                        };
                        for ik1 in 0..k1 {
                            let ii1 = io1 * s1 + ik1 - p1;
                            if ii1 < 0 || ii1 >= ih {
                                continue;
                            }
                            let s = src0.row_ptr(ctx.arena, ii1, i2, i3) as *const f32;
                            for ik0 in 0..k0 {
                                let ii0 = io0 * s0 + ik0 - p0;
                                if ii0 < 0 || ii0 >= iw {
                                    continue;
                                }
                                let v = *s.add(ii0 as usize);
                                match op {
                                    PoolOp::Max => acc = acc.max(v),
                                    PoolOp::Avg => acc += v,
                                }
                            }
                        }
                        *d.add(io0 as usize) = match op {
                            PoolOp::Max => acc,
                            PoolOp::Avg => acc / (k0 * k1) as f32,
                        };
                    }
                }
            }
        }
    }
}
