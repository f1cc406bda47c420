//! Row dequantization (decode).
//!
//! Pure linear reconstruction: unpack a code, multiply by the block scale,
//! subtract/add the offset for asymmetric formats. No branching on values,
//! no ISA-dependent variation; every path here is the bit-exact reference
//! the SIMD dot kernels are tested against.

use half::f16;

use super::*;
use crate::error::contract;

pub fn dequantize_row_q4_0(x: &[BlockQ4_0], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK);
    for (i, blk) in x.iter().enumerate() {
        let d = blk.d.to_f32();
        let out = &mut y[i * QK..(i + 1) * QK];
        for j in 0..QK / 2 {
            out[j] = ((blk.qs[j] & 0x0f) as i32 - 8) as f32 * d;
            out[j + QK / 2] = ((blk.qs[j] >> 4) as i32 - 8) as f32 * d;
        }
    }
}

pub fn dequantize_row_q4_1(x: &[BlockQ4_1], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK);
    for (i, blk) in x.iter().enumerate() {
        let d = blk.d.to_f32();
        let m = blk.m.to_f32();
        let out = &mut y[i * QK..(i + 1) * QK];
        for j in 0..QK / 2 {
            out[j] = (blk.qs[j] & 0x0f) as f32 * d + m;
            out[j + QK / 2] = (blk.qs[j] >> 4) as f32 * d + m;
        }
    }
}

pub fn dequantize_row_q5_0(x: &[BlockQ5_0], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK);
    for (i, blk) in x.iter().enumerate() {
        let d = blk.d.to_f32();
        let qh = u32::from_le_bytes(blk.qh);
        let out = &mut y[i * QK..(i + 1) * QK];
        for j in 0..QK / 2 {
            let xh0 = (((qh >> j) & 1) << 4) as u8;
            let xh1 = (((qh >> (j + QK / 2)) & 1) << 4) as u8;
            out[j] = (((blk.qs[j] & 0x0f) | xh0) as i32 - 16) as f32 * d;
            out[j + QK / 2] = (((blk.qs[j] >> 4) | xh1) as i32 - 16) as f32 * d;
        }
    }
}

pub fn dequantize_row_q5_1(x: &[BlockQ5_1], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK);
    for (i, blk) in x.iter().enumerate() {
        let d = blk.d.to_f32();
        let m = blk.m.to_f32();
        let qh = u32::from_le_bytes(blk.qh);
        let out = &mut y[i * QK..(i + 1) * QK];
        for j in 0..QK / 2 {
            let xh0 = (((qh >> j) & 1) << 4) as u8;
            let xh1 = (((qh >> (j + QK / 2)) & 1) << 4) as u8;
            out[j] = ((blk.qs[j] & 0x0f) | xh0) as f32 * d + m;
            out[j + QK / 2] = ((blk.qs[j] >> 4) | xh1) as f32 * d + m;
        }
    }
}

pub fn dequantize_row_q8_0(x: &[BlockQ8_0], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK);
    for (i, blk) in x.iter().enumerate() {
        let d = blk.d.to_f32();
        let out = &mut y[i * QK..(i + 1) * QK];
        for (j, &q) in blk.qs.iter().enumerate() {
            out[j] = f32::from(q) * d;
        }
    }
}

pub fn dequantize_row_q8_1(x: &[BlockQ8_1], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK);
    for (i, blk) in x.iter().enumerate() {
        let d = blk.d.to_f32();
        let out = &mut y[i * QK..(i + 1) * QK];
        for (j, &q) in blk.qs.iter().enumerate() {
            out[j] = f32::from(q) * d;
        }
    }
}

pub fn dequantize_row_q4_k(x: &[BlockQ4K], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK_K);
    for (i, blk) in x.iter().enumerate() {
        let d = blk.d.to_f32();
        let min = blk.dmin.to_f32();
        let out = &mut y[i * QK_K..(i + 1) * QK_K];
        let mut is = 0;
        for j in (0..QK_K).step_by(64) {
            let q = &blk.qs[j / 2..j / 2 + 32];
            let (sc, m) = get_scale_min_k4(is, &blk.scales);
            let d1 = d * sc as f32;
            let m1 = min * m as f32;
            let (sc, m) = get_scale_min_k4(is + 1, &blk.scales);
            let d2 = d * sc as f32;
            let m2 = min * m as f32;
            for (l, &qv) in q.iter().enumerate() {
                out[j + l] = d1 * (qv & 0x0f) as f32 - m1;
                out[j + l + 32] = d2 * (qv >> 4) as f32 - m2;
            }
            is += 2;
        }
    }
}

pub fn dequantize_row_q5_k(x: &[BlockQ5K], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK_K);
    for (i, blk) in x.iter().enumerate() {
        let d = blk.d.to_f32();
        let min = blk.dmin.to_f32();
        let out = &mut y[i * QK_K..(i + 1) * QK_K];
        let mut is = 0;
        let mut u1 = 1u8;
        let mut u2 = 2u8;
        for j in (0..QK_K).step_by(64) {
            let ql = &blk.qs[j / 2..j / 2 + 32];
            let (sc, m) = get_scale_min_k4(is, &blk.scales);
            let d1 = d * sc as f32;
            let m1 = min * m as f32;
            let (sc, m) = get_scale_min_k4(is + 1, &blk.scales);
            let d2 = d * sc as f32;
            let m2 = min * m as f32;
            for (l, &qv) in ql.iter().enumerate() {
                let h1 = if blk.qh[l] & u1 != 0 { 16 } else { 0 };
                let h2 = if blk.qh[l] & u2 != 0 { 16 } else { 0 };
                out[j + l] = d1 * ((qv & 0x0f) + h1) as f32 - m1;
                out[j + l + 32] = d2 * ((qv >> 4) + h2) as f32 - m2;
            }
            is += 2;
            u1 <<= 2;
            u2 <<= 2;
        }
    }
}

pub fn dequantize_row_q6_k(x: &[BlockQ6K], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK_K);
    for (i, blk) in x.iter().enumerate() {
        let d = blk.d.to_f32();
        let out = &mut y[i * QK_K..(i + 1) * QK_K];
        for n in (0..QK_K).step_by(128) {
            let idx = n / 128;
            let ql = &blk.ql[64 * idx..];
            let qh = &blk.qh[32 * idx..];
            let sc = &blk.scales[8 * idx..];
            for l in 0..32 {
                let is = l / 16;
                let q1 = ((ql[l] & 0x0f) | ((qh[l] & 3) << 4)) as i32 - 32;
                let q2 = ((ql[l + 32] & 0x0f) | (((qh[l] >> 2) & 3) << 4)) as i32 - 32;
                let q3 = ((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) as i32 - 32;
                let q4 = ((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) as i32 - 32;
                out[n + l] = d * sc[is] as f32 * q1 as f32;
                out[n + l + 32] = d * sc[is + 2] as f32 * q2 as f32;
                out[n + l + 64] = d * sc[is + 4] as f32 * q3 as f32;
                out[n + l + 96] = d * sc[is + 6] as f32 * q4 as f32;
            }
        }
    }
}

pub fn dequantize_row_q8_k(x: &[BlockQ8K], y: &mut [f32]) {
    contract!(y.len() == x.len() * QK_K);
    for (i, blk) in x.iter().enumerate() {
        let out = &mut y[i * QK_K..(i + 1) * QK_K];
        for (j, &q) in blk.qs.iter().enumerate() {
            out[j] = blk.d * f32::from(q);
        }
    }
}

/// Widen an f16 row.
pub fn dequantize_row_f16(x: &[f16], y: &mut [f32]) {
    contract!(y.len() == x.len());
    unsafe { crate::simd::vec_cvt_f16_to_f32(x.len(), y.as_mut_ptr(), x.as_ptr()) }
}
