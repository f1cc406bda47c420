//! Copy / convert kernels: Dup, Cont, Cpy (quantize/dequantize-copy) and
//! GetRows (row gather with decode).
//!
//! Cpy converts between any two dtypes with row codecs in the dispatch
//! table; rows are partitioned across threads and quantized destinations
//! require block-aligned dense rows on both sides.

use half::f16;

use crate::dtype::DType;
use crate::error::contract;
use crate::tensor::thread_range;
use crate::threadpool::ComputeParams;
use crate::traits::type_traits;

use super::NodeCtx;

pub(crate) fn compute_dup(params: &ComputeParams, ctx: &NodeCtx) {
    compute_cpy(params, ctx);
}

pub(crate) fn compute_cpy(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let dst = ctx.dst;
    contract!(
        src0.nelements() == dst.nelements(),
        "cpy: element count mismatch ({} vs {})",
        src0.nelements(),
        dst.nelements()
    );

    // Same dtype, both dense: a partitioned byte copy regardless of shape.
    if src0.dtype == dst.dtype && src0.is_contiguous() && dst.is_contiguous() {
        let total = src0.nbytes();
        let (b0, b1) = thread_range(total as i64, params.ith, params.nth);
        unsafe {
            let s = src0.data_ptr(ctx.arena).add(b0 as usize);
            let d = dst.data_ptr(ctx.arena).add(b0 as usize);
            if !std::ptr::eq(s as *const u8, d) {
                std::ptr::copy_nonoverlapping(s, d, (b1 - b0) as usize);
            }
        }
        return;
    }

    let traits = type_traits(dst.dtype);
    let rows_dense = src0.is_contiguous_rows() && dst.is_contiguous_rows();

    // f32 -> quantized / f16 / bf16: per-row encode.
    if src0.dtype == DType::F32 && dst.dtype != DType::F32 && traits.from_float.is_some() && rows_dense
    {
        contract!(src0.ne[0] == dst.ne[0] && src0.nrows() == dst.nrows());
        let from_float = traits.from_float.unwrap();
        let ne0 = src0.ne[0] as usize;
        let [_, ne1, ne2, _] = src0.ne;
        let (ir0, ir1) = thread_range(src0.nrows(), params.ith, params.nth);
        for ir in ir0..ir1 {
            let i3 = ir / (ne2 * ne1);
            let i2 = (ir - i3 * ne2 * ne1) / ne1;
            let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
            unsafe {
                let s = src0.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
                let drow = dst.row_ptr(ctx.arena, i1, i2, i3);
                from_float(std::slice::from_raw_parts(s, ne0), drow);
            }
        }
        return;
    }

    // quantized / f16 / bf16 -> f32: per-row decode.
    let src_traits = type_traits(src0.dtype);
    if dst.dtype == DType::F32 && src0.dtype != DType::F32 && src_traits.to_float.is_some() && rows_dense
    {
        contract!(src0.ne[0] == dst.ne[0] && src0.nrows() == dst.nrows());
        let to_float = src_traits.to_float.unwrap();
        let ne0 = src0.ne[0] as usize;
        let [_, ne1, ne2, _] = src0.ne;
        let (ir0, ir1) = thread_range(src0.nrows(), params.ith, params.nth);
        for ir in ir0..ir1 {
            let i3 = ir / (ne2 * ne1);
            let i2 = (ir - i3 * ne2 * ne1) / ne1;
            let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
            unsafe {
                let s = src0.row_ptr(ctx.arena, i1, i2, i3);
                let d = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
                to_float(s, std::slice::from_raw_parts_mut(d, ne0));
            }
        }
        return;
    }

    // Strided float <-> float element copy (handles Cont on permuted views).
    contract!(
        matches!(src0.dtype, DType::F32 | DType::F16) && matches!(dst.dtype, DType::F32 | DType::F16),
        "cpy: unsupported {} -> {}",
        src0.dtype.name(),
        dst.dtype.name()
    );
    contract!(src0.same_shape(dst), "cpy: strided copy requires equal shapes");
    let [ne0, ne1, ne2, _] = src0.ne;
    let (ir0, ir1) = thread_range(src0.nrows(), params.ith, params.nth);
    for ir in ir0..ir1 {
        let i3 = ir / (ne2 * ne1);
        let i2 = (ir - i3 * ne2 * ne1) / ne1;
        let i1 = ir - i3 * ne2 * ne1 - i2 * ne1;
        for i0 in 0..ne0 {
            unsafe {
                let s = src0.element_ptr(ctx.arena, 0, i1, i2, i3).add(i0 as usize * src0.nb[0]);
                let d = dst.element_ptr(ctx.arena, 0, i1, i2, i3).add(i0 as usize * dst.nb[0]);
                let v = match src0.dtype {
                    DType::F32 => *(s as *const f32),
                    _ => (*(s as *const f16)).to_f32(),
                };
                match dst.dtype {
                    DType::F32 => *(d as *mut f32) = v,
                    _ => *(d as *mut f16) = f16::from_f32(v),
                }
            }
        }
    }
}

/// dst[:, i10, i11, i12] = decode(src0[:, ids[i10, i11, i12], i11 % ne02, i12 % ne03])
pub(crate) fn compute_get_rows(params: &ComputeParams, ctx: &NodeCtx) {
    let src0 = ctx.src(0);
    let ids = ctx.src(1);
    let dst = ctx.dst;

    contract!(ids.dtype == DType::I32, "get_rows: ids must be i32");
    contract!(dst.dtype == DType::F32, "get_rows: f32 dst required");
    contract!(src0.is_contiguous_rows() && dst.is_contiguous_rows());
    contract!(dst.ne[0] == src0.ne[0]);
    contract!(dst.ne[1] == ids.ne[0] && dst.ne[2] == ids.ne[1] && dst.ne[3] == ids.ne[2]);

    let to_float = type_traits(src0.dtype).to_float;
    contract!(
        to_float.is_some(),
        "get_rows: no decoder for {}",
        src0.dtype.name()
    );
    let to_float = to_float.unwrap();

    let ne0 = src0.ne[0] as usize;
    let [ne10, ne11, _, _] = ids.ne;
    let nr = ids.nelements();
    let (ir0, ir1) = thread_range(nr, params.ith, params.nth);

    for ir in ir0..ir1 {
        let i12 = ir / (ne11 * ne10);
        let i11 = (ir - i12 * ne11 * ne10) / ne10;
        let i10 = ir - i12 * ne11 * ne10 - i11 * ne10;
        unsafe {
            let r = *(ids.element_ptr(ctx.arena, i10, i11, i12, 0) as *const i32) as i64;
            contract!(
                r >= 0 && r < src0.ne[1],
                "get_rows: id {r} out of range 0..{}",
                src0.ne[1]
            );
            let s = src0.row_ptr(ctx.arena, r, i11 % src0.ne[2], i12 % src0.ne[3]);
            let d = dst.row_ptr(ctx.arena, i10, i11, i12) as *mut f32;
            to_float(s, std::slice::from_raw_parts_mut(d, ne0));
        }
    }
}
