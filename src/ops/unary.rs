//! Unary math kernels and Scale.
//!
//! Contract: f32 source with dense rows, dst shaped like src with dense
//! rows. May run in place (`dst` aliasing `src`). Rows are partitioned
//! across threads; there is no cross-element state, so results are
//! bit-identical for any thread count.

use crate::context::EngineContext;
use crate::dtype::DType;
use crate::error::contract;
use crate::simd;
use crate::tensor::thread_range;
use crate::threadpool::ComputeParams;

use super::{NodeCtx, UnaryOp};

#[inline(always)]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn compute_unary(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    let op = UnaryOp::from_i32(dst.op_param_i32(0));

    contract!(
        src0.dtype == DType::F32 && dst.dtype == DType::F32,
        "unary({op:?}): f32 required"
    );
    contract!(dst.same_shape(src0), "unary({op:?}): shape mismatch");
    contract!(
        src0.is_contiguous_rows() && dst.is_contiguous_rows(),
        "unary({op:?}): dense rows required"
    );

    let ne0 = src0.ne[0] as usize;
    let [_, ne1, ne2, _] = src0.ne;
    let nr = src0.nrows();
    let (ir0, ir1) = thread_range(nr, params.ith, params.nth);

    let gelu = &EngineContext::get().gelu;

    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1;
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
        unsafe {
            let s = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
            let d = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
            for i in 0..ne0 {
                let x = *s.add(i);
                *d.add(i) = match op {
                    UnaryOp::Abs => x.abs(),
                    UnaryOp::Sgn => {
                        if x > 0.0 {
                            1.0
                        } else if x < 0.0 {
                            -1.0
                        } else {
                            0.0
                        }
                    }
                    UnaryOp::Neg => -x,
                    UnaryOp::Step => {
                        if x > 0.0 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    UnaryOp::Tanh => x.tanh(),
                    UnaryOp::Sigmoid => sigmoid(x),
                    UnaryOp::Relu => x.max(0.0),
                    UnaryOp::Gelu => gelu.eval(x),
                    UnaryOp::GeluQuick => x * sigmoid(1.702 * x),
                    UnaryOp::Silu => x * sigmoid(x),
                    UnaryOp::Exp => x.exp(),
                    UnaryOp::Log => x.ln(),
                    UnaryOp::Sin => x.sin(),
                    UnaryOp::Cos => x.cos(),
                    UnaryOp::Sqrt => x.sqrt(),
                    UnaryOp::Sqr => x * x,
                };
            }
        }
    }
}

/// dst = src0 * scale + bias (`op_params[0]` scale, `op_params[1]` bias).
pub(crate) fn compute_scale(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    let scale = dst.op_param_f32(0);
    let bias = dst.op_param_f32(1);

    contract!(
        src0.dtype == DType::F32 && dst.dtype == DType::F32,
        "scale: f32 required"
    );
    contract!(dst.same_shape(src0), "scale: shape mismatch");
    contract!(src0.is_contiguous_rows() && dst.is_contiguous_rows());

    let ne0 = src0.ne[0] as usize;
    let [_, ne1, ne2, _] = src0.ne;
    let nr = src0.nrows();
    let (ir0, ir1) = thread_range(nr, params.ith, params.nth);

    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1;
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
        unsafe {
            let s = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
            let d = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
            if bias == 0.0 {
                if !std::ptr::eq(s, d) {
                    std::ptr::copy_nonoverlapping(s, d, ne0);
                }
                simd::vec_scale_f32(ne0, d, scale);
            } else {
                for i in 0..ne0 {
                    *d.add(i) = (*s.add(i)).mul_add(scale, bias);
                }
            }
        }
    }
}
