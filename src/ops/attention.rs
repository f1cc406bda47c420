//! Fused scaled-dot-product attention with online softmax accumulation.
//!
//! Shapes: q `[D, N, H, B]` f32; k, v `[D, M, H_kv, B]` f32 or f16 with
//! `H % H_kv == 0` (grouped-query broadcast); optional additive mask
//! `[M, >=N]` f32/f16; dst `[D, N, H, B]` f32.
//!
//! One output row per (query, head, batch) triple, partitioned across
//! threads. Per row the kernel keeps a running maximum `M`, a running
//! normalizer `S`, and a value accumulator that is rescaled by
//! `exp(M_old - M_new)` whenever a new maximum appears, so no score vector
//! is ever materialized.
//!
//! `op_params`: `[0]` scale (f32), `[1]` max_bias (f32, ALiBi),
//! `[2]` logit_softcap (f32, 0 = off).

use half::f16;

use crate::dtype::DType;
use crate::error::contract;
use crate::simd;
use crate::tensor::thread_range;
use crate::threadpool::ComputeParams;

use super::NodeCtx;

pub(crate) fn compute_flash_attn(params: &ComputeParams, ctx: &NodeCtx) {
    let q = ctx.src(0);
    let k = ctx.src(1);
    let v = ctx.src(2);
    let mask = ctx.src_opt(3);
    let dst = ctx.dst;

    let mut scale = dst.op_param_f32(0);
    let max_bias = dst.op_param_f32(1);
    let logit_softcap = dst.op_param_f32(2);

    contract!(q.dtype == DType::F32 && dst.dtype == DType::F32, "flash_attn: f32 q/dst required");
    contract!(
        matches!(k.dtype, DType::F32 | DType::F16) && v.dtype == k.dtype,
        "flash_attn: k/v must both be f32 or f16"
    );
    contract!(q.ne[0] == k.ne[0] && q.ne[0] == v.ne[0], "flash_attn: head size mismatch");
    contract!(k.ne[1] == v.ne[1], "flash_attn: k/v length mismatch");
    contract!(k.ne[2] == v.ne[2] && q.ne[2] % k.ne[2] == 0, "flash_attn: head count mismatch");
    contract!(q.ne[3] == k.ne[3], "flash_attn: batch mismatch");
    contract!(dst.same_shape(q), "flash_attn: dst shape != q shape");
    contract!(q.nb[0] == 4 && dst.nb[0] == 4);

    let d = q.ne[0] as usize;
    let kv_len = k.ne[1];
    let [_, n, h, _] = q.ne;
    let h_kv = k.ne[2];
    let rk = h / h_kv;

    if let Some(m) = mask {
        contract!(matches!(m.dtype, DType::F32 | DType::F16), "flash_attn: bad mask dtype");
        contract!(m.ne[0] == kv_len && m.ne[1] >= n, "flash_attn: mask too small");
    }

    if logit_softcap != 0.0 {
        scale /= logit_softcap;
    }

    let n_head_log2 = 1i64 << (63 - (h.max(1) as u64).leading_zeros() as i64);
    let m0 = 2.0f32.powf(-max_bias / n_head_log2 as f32);
    let m1 = 2.0f32.powf(-max_bias / 2.0 / n_head_log2 as f32);

    // per-thread scratch: D f32 accumulator + D f16 q copy (second D-float
    // half holds 2*D f16 slots)
    contract!(
        params.wsize >= params.nth * 2 * d * 4,
        "flash_attn: scratch too small"
    );
    let acc = unsafe { (params.wdata as *mut f32).add(params.ith * 2 * d) };
    let q16 = unsafe { acc.add(d) as *mut f16 };

    let nr = dst.nrows();
    let (ir0, ir1) = thread_range(nr, params.ith, params.nth);

    for ir in ir0..ir1 {
        let i3 = ir / (h * n);
        let i2 = (ir - i3 * h * n) / n; // head
        let i1 = ir - i3 * h * n - i2 * n; // query position
        let ik2 = i2 / rk;

        let slope = if max_bias > 0.0 {
            if i2 < n_head_log2 {
                m0.powi(i2 as i32 + 1)
            } else {
                m1.powi(2 * (i2 - n_head_log2) as i32 + 1)
            }
        } else {
            1.0
        };

        unsafe {
            let q_row = q.row_ptr(ctx.arena, i1, i2, i3) as *const f32;
            if k.dtype == DType::F16 {
                simd::vec_cvt_f32_to_f16(d, q16, q_row);
            }

            std::ptr::write_bytes(acc, 0, d);
            let mut run_max = f32::NEG_INFINITY;
            let mut run_sum = 0.0f32;

            let mrow = mask.map(|m| m.row_ptr(ctx.arena, i1 % m.ne[1], i2 % m.ne[2], i3 % m.ne[3]));

            for im in 0..kv_len {
                let mv = match (mask, mrow) {
                    (Some(m), Some(row)) => {
                        let raw = match m.dtype {
                            DType::F32 => *(row as *const f32).add(im as usize),
                            _ => (*(row as *const f16).add(im as usize)).to_f32(),
                        };
                        slope * raw
                    }
                    _ => 0.0,
                };
                if mv == f32::NEG_INFINITY {
                    continue;
                }

                let k_row = k.row_ptr(ctx.arena, im, ik2, i3);
                let mut s = match k.dtype {
                    DType::F32 => simd::vec_dot_f32(d, k_row as *const f32, q_row),
                    _ => simd::vec_dot_f16(d, k_row as *const f16, q16 as *const f16),
                };
                s = s * scale;
                if logit_softcap != 0.0 {
                    s = logit_softcap * s.tanh();
                }
                s += mv;

                let m_new = run_max.max(s);
                let ms = (run_max - m_new).exp(); // rescale of the old accumulator
                let vs = (s - m_new).exp();
                if ms != 1.0 {
                    simd::vec_scale_f32(d, acc, ms);
                }
                run_sum = run_sum * ms + vs;
                run_max = m_new;

                let v_row = v.row_ptr(ctx.arena, im, ik2, i3);
                match v.dtype {
                    DType::F32 => simd::vec_mad_f32(d, acc, v_row as *const f32, vs),
                    _ => {
                        let vh = v_row as *const f16;
                        for i in 0..d {
                            *acc.add(i) += (*vh.add(i)).to_f32() * vs;
                        }
                    }
                }
            }

            let out = dst.row_ptr(ctx.arena, i1, i2, i3) as *mut f32;
            if run_sum > 0.0 {
                std::ptr::copy_nonoverlapping(acc, out, d);
                simd::vec_scale_f32(d, out, 1.0 / run_sum);
            } else {
                // every position masked out
                std::ptr::write_bytes(out, 0, d);
            }
        }
    }
}
