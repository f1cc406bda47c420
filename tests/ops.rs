//! Forward kernel references: normalization, softmax, rope, convolution
//! family, attention, state-space scan, reductions, copies.

use dagml::{
    graph_compute_with, graph_plan, DType, GraphBuilder, PoolOp, Status, ThreadPool,
    ThreadPoolConfig, UnaryOp, ROPE_MODE_NEOX, ROPE_MODE_NORM,
};

fn filled(n: usize, f: impl Fn(usize) -> f32) -> Vec<f32> {
    (0..n).map(f).collect()
}

#[test]
fn unary_family_reference() {
    let xs = filled(64, |i| (i as f32 - 32.0) * 0.25);
    let cases: &[(UnaryOp, fn(f32) -> f32)] = &[
        (UnaryOp::Abs, |x| x.abs()),
        (UnaryOp::Neg, |x| -x),
        (UnaryOp::Sqr, |x| x * x),
        (UnaryOp::Tanh, |x| x.tanh()),
        (UnaryOp::Relu, |x| x.max(0.0)),
        (UnaryOp::Sigmoid, |x| 1.0 / (1.0 + (-x).exp())),
        (UnaryOp::Silu, |x| x / (1.0 + (-x).exp())),
        (UnaryOp::Sin, |x| x.sin()),
        (UnaryOp::Cos, |x| x.cos()),
        (UnaryOp::Step, |x| if x > 0.0 { 1.0 } else { 0.0 }),
        (UnaryOp::Sgn, |x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        }),
    ];
    for &(op, reff) in cases {
        let mut b = GraphBuilder::new();
        let x = b.new_tensor(DType::F32, &[64]);
        let y = b.unary(x, op);
        let (graph, mut arena) = b.build();
        arena.tensor_f32_mut(graph.tensor(x)).copy_from_slice(&xs);
        assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);
        let out = arena.tensor_f32(graph.tensor(y));
        for (i, (&xi, &yi)) in xs.iter().zip(out).enumerate() {
            let want = reff(xi);
            assert!(
                (want - yi).abs() <= 1e-6 * (1.0 + want.abs()),
                "{op:?} elem {i}: {xi} -> {yi}, want {want}"
            );
        }
    }
}

#[test]
fn gelu_matches_erf_form_within_table_error() {
    let xs = filled(64, |i| (i as f32 - 32.0) * 0.2);
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[64]);
    let y = b.unary(x, UnaryOp::Gelu);
    let (graph, mut arena) = b.build();
    arena.tensor_f32_mut(graph.tensor(x)).copy_from_slice(&xs);
    assert_eq!(graph_compute_with(&graph, &arena, 1), Status::Success);
    let out = arena.tensor_f32(graph.tensor(y));
    for (&xi, &yi) in xs.iter().zip(out) {
        let want = dagml::context::gelu_ref_f32(xi);
        assert!((want - yi).abs() <= 5e-3 * (1.0 + want.abs()));
    }
}

#[test]
fn broadcast_add_repeats_rows_and_inner_chunks() {
    // src1 is one row of 8 repeated over 4 rows and 2 inner chunks
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[16, 4]);
    let r = b.new_tensor(DType::F32, &[8, 1]);
    let y = b.add(x, r);
    let (graph, mut arena) = b.build();
    arena
        .tensor_f32_mut(graph.tensor(x))
        .copy_from_slice(&filled(64, |i| i as f32));
    arena
        .tensor_f32_mut(graph.tensor(r))
        .copy_from_slice(&filled(8, |i| (i as f32) * 100.0));
    assert_eq!(graph_compute_with(&graph, &arena, 3), Status::Success);
    let out = arena.tensor_f32(graph.tensor(y));
    for row in 0..4 {
        for i in 0..16 {
            let want = (row * 16 + i) as f32 + (i % 8) as f32 * 100.0;
            assert_eq!(out[row * 16 + i], want);
        }
    }
}

#[test]
fn norm_and_rms_norm_reference() {
    let n = 96usize;
    let xs = filled(n * 3, |i| ((i * 7 % 31) as f32 - 15.0) * 0.11);
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[n as i64, 3]);
    let ln = b.norm(x, 1e-5);
    let rn = b.rms_norm(x, 1e-5);
    let (graph, mut arena) = b.build();
    arena.tensor_f32_mut(graph.tensor(x)).copy_from_slice(&xs);
    assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);

    let ln_out = arena.tensor_f32(graph.tensor(ln));
    let rn_out = arena.tensor_f32(graph.tensor(rn));
    for row in 0..3 {
        let xr = &xs[row * n..(row + 1) * n];
        let mean: f64 = xr.iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64;
        let var: f64 =
            xr.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n as f64;
        let ms: f64 = xr.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>() / n as f64;
        for i in 0..n {
            let want_ln = ((f64::from(xr[i]) - mean) / (var + 1e-5).sqrt()) as f32;
            let want_rn = (f64::from(xr[i]) / (ms + 1e-5).sqrt()) as f32;
            assert!((ln_out[row * n + i] - want_ln).abs() < 1e-4);
            assert!((rn_out[row * n + i] - want_rn).abs() < 1e-4);
        }
    }
}

#[test]
fn softmax_rows_normalize_and_match_reference() {
    let n = 48usize;
    let xs = filled(n * 4, |i| ((i * 13 % 29) as f32 - 14.0) * 0.3);
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[n as i64, 4]);
    let y = b.soft_max(x);
    let (graph, mut arena) = b.build();
    arena.tensor_f32_mut(graph.tensor(x)).copy_from_slice(&xs);
    assert_eq!(graph_compute_with(&graph, &arena, 3), Status::Success);
    let out = arena.tensor_f32(graph.tensor(y));
    for row in 0..4 {
        let xr = &xs[row * n..(row + 1) * n];
        let max = xr.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum: f64 = xr.iter().map(|&v| f64::from((v - max).exp())).sum();
        let mut got_sum = 0.0f64;
        for i in 0..n {
            let want = (f64::from((xr[i] - max).exp()) / sum) as f32;
            let got = out[row * n + i];
            got_sum += f64::from(got);
            assert!((want - got).abs() < 1e-5, "row {row} elem {i}");
        }
        assert!((got_sum - 1.0).abs() < 1e-5);
    }
}

#[test]
fn softmax_with_additive_mask() {
    let n = 8usize;
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[n as i64, 2]);
    let m = b.new_tensor(DType::F32, &[n as i64, 2]);
    let y = b.soft_max_ext(x, Some(m), 1.0, 0.0);
    let (graph, mut arena) = b.build();
    arena.tensor_f32_mut(graph.tensor(x)).fill(0.0);
    let mask = arena.tensor_f32_mut(graph.tensor(m));
    mask.fill(0.0);
    // mask out the second half of each row
    for row in 0..2 {
        for i in n / 2..n {
            mask[row * n + i] = f32::NEG_INFINITY;
        }
    }
    assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);
    let out = arena.tensor_f32(graph.tensor(y));
    for row in 0..2 {
        for i in 0..n / 2 {
            assert!((out[row * n + i] - 0.25).abs() < 1e-6);
        }
        for i in n / 2..n {
            assert_eq!(out[row * n + i], 0.0);
        }
    }
}

#[test]
fn rope_backward_inverts_forward() {
    let (d, h, t) = (16i64, 2i64, 5i64);
    let xs = filled((d * h * t) as usize, |i| ((i * 3 % 23) as f32 - 11.0) * 0.1);
    for mode in [ROPE_MODE_NORM, ROPE_MODE_NEOX] {
        let mut b = GraphBuilder::new();
        let x = b.new_tensor(DType::F32, &[d, h, t]);
        let pos = b.new_tensor(DType::I32, &[t]);
        let fwd = b.rope(x, pos, d as i32, mode);
        let back = b.rope_ext(
            fwd, pos, d as i32, mode, 0, 10000.0, 1.0, 0.0, 1.0, 0.0, 0.0, true,
        );
        let (graph, mut arena) = b.build();
        arena.tensor_f32_mut(graph.tensor(x)).copy_from_slice(&xs);
        let posv: Vec<i32> = (0..t as i32).map(|p| p * 3).collect();
        arena.tensor_i32_mut(graph.tensor(pos)).copy_from_slice(&posv);
        assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);
        let out = arena.tensor_f32(graph.tensor(back));
        for (i, (&a, &b_)) in xs.iter().zip(out).enumerate() {
            assert!(
                (a - b_).abs() < 1e-4,
                "mode {mode} elem {i}: {a} vs {b_}"
            );
        }
        // forward must actually rotate rows at nonzero positions
        let rotated = arena.tensor_f32(graph.tensor(fwd));
        let tail = &rotated[(d * h) as usize..];
        assert!(tail.iter().zip(&xs[(d * h) as usize..]).any(|(&a, &b_)| (a - b_).abs() > 1e-3));
    }
}

#[test]
fn im2col_plus_matmul_equals_naive_conv1d() {
    // input [iw=10, ic=3], kernel [kw=3, ic=3, oc=4], stride 1, pad 1
    let (iw, ic, kw, oc) = (10i64, 3i64, 3i64, 4i64);
    let kernel_vals = filled((kw * ic * oc) as usize, |i| ((i * 5 % 13) as f32 - 6.0) * 0.1);
    let input_vals = filled((iw * ic) as usize, |i| ((i * 3 % 11) as f32 - 5.0) * 0.2);

    let mut b = GraphBuilder::new();
    let kernel = b.new_tensor(DType::F32, &[kw, ic, oc]);
    let input = b.new_tensor(DType::F32, &[iw, ic]);
    let cols = b.im2col(kernel, input, 1, 0, 1, 0, 1, 0, false, DType::F32);
    // kernel reshaped to [ic*kw, oc] for the matmul
    let kmat = b.new_tensor(DType::F32, &[ic * kw, oc]);
    let conv = b.mul_mat(kmat, cols);
    let (graph, mut arena) = b.build();
    arena
        .tensor_f32_mut(graph.tensor(kernel))
        .copy_from_slice(&kernel_vals);
    arena
        .tensor_f32_mut(graph.tensor(input))
        .copy_from_slice(&input_vals);
    // repack kernel (kw, ic, oc) -> rows of [ic*kw] per oc, matching the
    // im2col column layout (ic-major, then kw)
    {
        let kmat_slice = arena.tensor_f32_mut(graph.tensor(kmat));
        for o in 0..oc as usize {
            for c in 0..ic as usize {
                for w in 0..kw as usize {
                    kmat_slice[o * (ic * kw) as usize + c * kw as usize + w] =
                        kernel_vals[o * (kw * ic) as usize + c * kw as usize + w];
                }
            }
        }
    }
    assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);

    let ow = iw; // stride 1, pad 1, kw 3
    let got = arena.tensor_f32(graph.tensor(conv));
    for po in 0..ow as usize {
        for o in 0..oc as usize {
            let mut want = 0.0f64;
            for c in 0..ic as usize {
                for w in 0..kw as usize {
                    let xi = po as i64 + w as i64 - 1;
                    if xi < 0 || xi >= iw {
                        continue;
                    }
                    let kv = kernel_vals[o * (kw * ic) as usize + c * kw as usize + w];
                    let iv = input_vals[c * iw as usize + xi as usize];
                    want += f64::from(kv) * f64::from(iv);
                }
            }
            let gotv = got[po * oc as usize + o];
            assert!(
                (want as f32 - gotv).abs() < 1e-4,
                "pos {po} oc {o}: want {want}, got {gotv}"
            );
        }
    }
}

#[test]
fn conv_transpose_1d_reference() {
    let (k, oc, ic, l) = (4i64, 2i64, 3i64, 5i64);
    let kernel_vals = filled((k * oc * ic) as usize, |i| ((i % 7) as f32 - 3.0) * 0.2);
    let input_vals = filled((l * ic) as usize, |i| ((i % 5) as f32 - 2.0) * 0.3);
    let s0 = 2i64;

    let mut b = GraphBuilder::new();
    let kernel = b.new_tensor(DType::F32, &[k, oc, ic]);
    let input = b.new_tensor(DType::F32, &[l, ic]);
    let y = b.conv_transpose_1d(kernel, input, s0 as i32);
    let (graph, mut arena) = b.build();
    arena
        .tensor_f32_mut(graph.tensor(kernel))
        .copy_from_slice(&kernel_vals);
    arena
        .tensor_f32_mut(graph.tensor(input))
        .copy_from_slice(&input_vals);
    assert_eq!(graph_compute_with(&graph, &arena, 3), Status::Success);

    let ol = (l - 1) * s0 + k;
    let got = arena.tensor_f32(graph.tensor(y));
    let mut want = vec![0.0f64; (ol * oc) as usize];
    for o in 0..oc as usize {
        for t in 0..l as usize {
            for w in 0..k as usize {
                let mut dotv = 0.0f64;
                for c in 0..ic as usize {
                    let kv = kernel_vals[c * (k * oc) as usize + o * k as usize + w];
                    let iv = input_vals[c * l as usize + t];
                    dotv += f64::from(kv) * f64::from(iv);
                }
                want[o * ol as usize + t * s0 as usize + w] += dotv;
            }
        }
    }
    for (i, (&w64, &g)) in want.iter().zip(got).enumerate() {
        assert!((w64 as f32 - g).abs() < 1e-4, "elem {i}: want {w64}, got {g}");
    }
}

#[test]
fn pooling_shapes_and_values() {
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[8, 6, 2]);
    let mx = b.pool_2d(x, PoolOp::Max, 2, 2, 2, 2, 0, 0);
    let av = b.pool_2d(x, PoolOp::Avg, 2, 2, 2, 2, 0, 0);
    let (graph, mut arena) = b.build();
    arena
        .tensor_f32_mut(graph.tensor(x))
        .copy_from_slice(&filled(96, |i| i as f32));
    assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);

    let mx_out = arena.tensor_f32(graph.tensor(mx));
    let av_out = arena.tensor_f32(graph.tensor(av));
    assert_eq!(mx_out.len(), 4 * 3 * 2);
    // window at (0,0) of channel 0 covers {0, 1, 8, 9}
    assert_eq!(mx_out[0], 9.0);
    assert_eq!(av_out[0], 4.5);
    // last window of channel 1 covers {86, 87, 94, 95}
    assert_eq!(mx_out[4 * 3 * 2 - 1], 95.0);
    assert_eq!(av_out[4 * 3 * 2 - 1], 90.5);
}

#[test]
fn ssm_scan_matches_sequential_reference() {
    let (d_state, d_inner, n_tok) = (4usize, 6usize, 5usize);
    let s0v = filled(d_state * d_inner, |i| ((i % 5) as f32 - 2.0) * 0.1);
    let xv = filled(d_inner * n_tok, |i| ((i * 3 % 7) as f32 - 3.0) * 0.2);
    let dtv = filled(d_inner * n_tok, |i| ((i % 4) as f32 - 1.0) * 0.5);
    let av = filled(d_state * d_inner, |i| -0.1 - ((i % 3) as f32) * 0.2);
    let bv = filled(d_state * n_tok, |i| ((i % 6) as f32 - 2.0) * 0.15);
    let cv = filled(d_state * n_tok, |i| ((i * 7 % 9) as f32 - 4.0) * 0.1);

    let mut results: Vec<Vec<f32>> = Vec::new();
    for nth in [1usize, 2, 4] {
        let mut b = GraphBuilder::new();
        let s0 = b.new_tensor(DType::F32, &[d_state as i64, d_inner as i64]);
        let x = b.new_tensor(DType::F32, &[d_inner as i64, n_tok as i64]);
        let dt = b.new_tensor(DType::F32, &[d_inner as i64, n_tok as i64]);
        let a = b.new_tensor(DType::F32, &[d_state as i64, d_inner as i64]);
        let bb = b.new_tensor(DType::F32, &[d_state as i64, n_tok as i64]);
        let c = b.new_tensor(DType::F32, &[d_state as i64, n_tok as i64]);
        let y = b.ssm_scan(s0, x, dt, a, bb, c);
        let (graph, mut arena) = b.build();
        arena.tensor_f32_mut(graph.tensor(s0)).copy_from_slice(&s0v);
        arena.tensor_f32_mut(graph.tensor(x)).copy_from_slice(&xv);
        arena.tensor_f32_mut(graph.tensor(dt)).copy_from_slice(&dtv);
        arena.tensor_f32_mut(graph.tensor(a)).copy_from_slice(&av);
        arena.tensor_f32_mut(graph.tensor(bb)).copy_from_slice(&bv);
        arena.tensor_f32_mut(graph.tensor(c)).copy_from_slice(&cv);
        assert_eq!(graph_compute_with(&graph, &arena, nth), Status::Success);
        results.push(arena.tensor_f32(graph.tensor(y)).to_vec());
    }
    // channel-parallel runs must agree exactly with the 1-thread run
    for r in &results[1..] {
        assert_eq!(&results[0], r);
    }

    // sequential reference
    let softplus = |x: f32| if x > 20.0 { x } else { x.exp().ln_1p() };
    let mut state = s0v.clone();
    let out = &results[0];
    for t in 0..n_tok {
        for ch in 0..d_inner {
            let dt_sp = softplus(dtv[t * d_inner + ch]);
            let x_dt = xv[t * d_inner + ch] * dt_sp;
            let mut sum = 0.0f32;
            for s in 0..d_state {
                let decay = (dt_sp * av[ch * d_state + s]).exp();
                let s_new = state[ch * d_state + s] * decay + bv[t * d_state + s] * x_dt;
                sum += s_new * cv[t * d_state + s];
                state[ch * d_state + s] = s_new;
            }
            let got = out[t * d_inner + ch];
            assert!((sum - got).abs() < 1e-5, "tok {t} ch {ch}: want {sum}, got {got}");
        }
    }
    // final state is appended after the outputs
    let state_out = &out[d_inner * n_tok..];
    for (i, (&w, &g)) in state.iter().zip(state_out).enumerate() {
        assert!((w - g).abs() < 1e-5, "state {i}");
    }
}

#[test]
fn flash_attention_matches_naive_reference() {
    let (d, n, m, h) = (8usize, 3usize, 6usize, 2usize);
    let qv = filled(d * n * h, |i| ((i * 3 % 13) as f32 - 6.0) * 0.15);
    let kv = filled(d * m * h, |i| ((i * 5 % 11) as f32 - 5.0) * 0.15);
    let vv = filled(d * m * h, |i| ((i * 7 % 17) as f32 - 8.0) * 0.1);
    let scale = 1.0 / (d as f32).sqrt();

    for nth in [1usize, 2, 4] {
        let mut b = GraphBuilder::new();
        let q = b.new_tensor(DType::F32, &[d as i64, n as i64, h as i64]);
        let k = b.new_tensor(DType::F32, &[d as i64, m as i64, h as i64]);
        let v = b.new_tensor(DType::F32, &[d as i64, m as i64, h as i64]);
        let y = b.flash_attn(q, k, v, None, scale, 0.0, 0.0);
        let (graph, mut arena) = b.build();
        arena.tensor_f32_mut(graph.tensor(q)).copy_from_slice(&qv);
        arena.tensor_f32_mut(graph.tensor(k)).copy_from_slice(&kv);
        arena.tensor_f32_mut(graph.tensor(v)).copy_from_slice(&vv);
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(nth)).unwrap();
        let plan = graph_plan(&graph, nth);
        assert_eq!(pool.graph_compute(&graph, &arena, &plan, None), Status::Success);

        let got = arena.tensor_f32(graph.tensor(y));
        for head in 0..h {
            for qi in 0..n {
                // naive two-pass softmax attention
                let qrow = &qv[(head * n + qi) * d..(head * n + qi + 1) * d];
                let mut scores = vec![0.0f64; m];
                for ki in 0..m {
                    let krow = &kv[(head * m + ki) * d..(head * m + ki + 1) * d];
                    scores[ki] = qrow
                        .iter()
                        .zip(krow)
                        .map(|(&a, &b_)| f64::from(a) * f64::from(b_))
                        .sum::<f64>()
                        * f64::from(scale);
                }
                let smax = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let ssum: f64 = scores.iter().map(|&s| (s - smax).exp()).sum();
                for di in 0..d {
                    let mut want = 0.0f64;
                    for ki in 0..m {
                        let w = (scores[ki] - smax).exp() / ssum;
                        want += w * f64::from(vv[(head * m + ki) * d + di]);
                    }
                    let gotv = got[(head * n + qi) * d + di];
                    assert!(
                        (want as f32 - gotv).abs() < 1e-4,
                        "nth={nth} head {head} q {qi} dim {di}: want {want}, got {gotv}"
                    );
                }
            }
        }
    }
}

#[test]
fn reductions_and_gather() {
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[8, 3]);
    let s = b.sum(x);
    let sr = b.sum_rows(x);
    let mn = b.mean(x);
    let am = b.argmax(x);
    let ids = b.new_tensor(DType::I32, &[2]);
    let gr = b.get_rows(x, ids);
    let (graph, mut arena) = b.build();
    let xs = filled(24, |i| ((i * 7 % 13) as f32) - 6.0);
    arena.tensor_f32_mut(graph.tensor(x)).copy_from_slice(&xs);
    arena.tensor_i32_mut(graph.tensor(ids)).copy_from_slice(&[2, 0]);
    assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);

    let total: f32 = xs.iter().sum();
    assert!((arena.tensor_f32(graph.tensor(s))[0] - total).abs() < 1e-4);
    assert!((arena.tensor_f32(graph.tensor(mn))[0] - total / 24.0).abs() < 1e-5);

    let sr_out = arena.tensor_f32(graph.tensor(sr));
    for row in 0..3 {
        let want: f32 = xs[row * 8..(row + 1) * 8].iter().sum();
        assert!((sr_out[row] - want).abs() < 1e-5);
    }

    let am_ids = arena.tensor_i32(graph.tensor(am));
    for row in 0..3 {
        let xr = &xs[row * 8..(row + 1) * 8];
        let want = xr
            .iter()
            .enumerate()
            .max_by(|a, b_| a.1.partial_cmp(b_.1).unwrap())
            .unwrap()
            .0 as i32;
        assert_eq!(am_ids[row], want);
    }

    let gr_out = arena.tensor_f32(graph.tensor(gr));
    assert_eq!(&gr_out[0..8], &xs[16..24]);
    assert_eq!(&gr_out[8..16], &xs[0..8]);
}

#[test]
fn count_equal_uses_scratch_partials() {
    for nth in [1usize, 2, 4] {
        let mut b = GraphBuilder::new();
        let x = b.new_tensor(DType::I32, &[64, 4]);
        let y = b.new_tensor(DType::I32, &[64, 4]);
        let c = b.count_equal(x, y);
        let (graph, mut arena) = b.build();
        let xv: Vec<i32> = (0..256).map(|i| i % 7).collect();
        let yv: Vec<i32> = (0..256).map(|i| i % 5).collect();
        let want = xv.iter().zip(&yv).filter(|(a, b_)| a == b_).count() as i64;
        arena.tensor_i32_mut(graph.tensor(x)).copy_from_slice(&xv);
        arena.tensor_i32_mut(graph.tensor(y)).copy_from_slice(&yv);
        assert_eq!(graph_compute_with(&graph, &arena, nth), Status::Success);
        let got = i64::from_le_bytes(
            arena.tensor_bytes(graph.tensor(c))[..8].try_into().unwrap(),
        );
        assert_eq!(got, want, "nth={nth}");
    }
}

#[test]
fn cpy_quantize_dequantize_round_trip() {
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[64, 2]);
    let q = b.cpy(x, DType::Q8_0);
    let back = b.cpy(q, DType::F32);
    let (graph, mut arena) = b.build();
    let xs = filled(128, |i| ((i * 11 % 17) as f32 - 8.0) * 0.07);
    arena.tensor_f32_mut(graph.tensor(x)).copy_from_slice(&xs);
    assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);
    let out = arena.tensor_f32(graph.tensor(back));
    for (i, (&a, &b_)) in xs.iter().zip(out).enumerate() {
        assert!((a - b_).abs() < 0.01, "elem {i}: {a} vs {b_}");
    }
}

#[test]
fn transpose_view_then_cont_densifies() {
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[4, 3]);
    let xt = b.transpose(x);
    let y = b.cont(xt);
    let (graph, mut arena) = b.build();
    arena
        .tensor_f32_mut(graph.tensor(x))
        .copy_from_slice(&filled(12, |i| i as f32));
    assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);
    let out = arena.tensor_f32(graph.tensor(y));
    // x is [4, 3] row-major; its transpose is [3, 4]
    for r in 0..4 {
        for c in 0..3 {
            assert_eq!(out[r * 3 + c], (c * 4 + r) as f32);
        }
    }
}

#[test]
fn im2col_2d_gathers_patches() {
    // input [4, 4, 1], kernel [2, 2, 1, 1], stride 1, no pad
    let mut b = GraphBuilder::new();
    let kernel = b.new_tensor(DType::F32, &[2, 2, 1, 1]);
    let input = b.new_tensor(DType::F32, &[4, 4, 1, 1]);
    let cols = b.im2col(kernel, input, 1, 1, 0, 0, 1, 1, true, DType::F32);
    let (graph, mut arena) = b.build();
    arena
        .tensor_f32_mut(graph.tensor(input))
        .copy_from_slice(&filled(16, |i| i as f32));
    assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);
    let t = graph.tensor(cols);
    assert_eq!(t.ne, [4, 3, 3, 1]);
    let out = arena.tensor_f32(t);
    // patch at output (0, 0) covers input {0, 1, 4, 5}
    assert_eq!(&out[0..4], &[0.0, 1.0, 4.0, 5.0]);
    // patch at output (2, 2) covers input {10, 11, 14, 15}
    let last = &out[(2 * 3 + 2) * 4..(2 * 3 + 2) * 4 + 4];
    assert_eq!(last, &[10.0, 11.0, 14.0, 15.0]);
}

#[test]
fn pool_1d_reference() {
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[6, 2]);
    let mx = b.pool_1d(x, PoolOp::Max, 2, 2, 0);
    let av = b.pool_1d(x, PoolOp::Avg, 2, 2, 0);
    let (graph, mut arena) = b.build();
    arena
        .tensor_f32_mut(graph.tensor(x))
        .copy_from_slice(&[1.0, 5.0, 2.0, 2.0, 9.0, 0.0, -1.0, -5.0, -2.0, -2.0, -9.0, 0.0]);
    assert_eq!(graph_compute_with(&graph, &arena, 1), Status::Success);
    assert_eq!(arena.tensor_f32(graph.tensor(mx)), &[5.0, 2.0, 9.0, -1.0, -2.0, 0.0]);
    assert_eq!(arena.tensor_f32(graph.tensor(av)), &[3.0, 2.0, 4.5, -3.0, -2.0, -4.5]);
}

#[test]
fn group_norm_normalizes_groups() {
    let mut b = GraphBuilder::new();
    let x = b.new_tensor(DType::F32, &[4, 2, 6]);
    let y = b.group_norm(x, 3, 1e-5);
    let (graph, mut arena) = b.build();
    arena
        .tensor_f32_mut(graph.tensor(x))
        .copy_from_slice(&filled(48, |i| ((i * 5 % 19) as f32) * 0.4 - 2.0));
    assert_eq!(graph_compute_with(&graph, &arena, 2), Status::Success);
    let out = arena.tensor_f32(graph.tensor(y));
    // each group of 2 channels (16 values) must be near zero-mean, unit-var
    for g in 0..3 {
        let vals = &out[g * 16..(g + 1) * 16];
        let mean: f64 = vals.iter().map(|&v| f64::from(v)).sum::<f64>() / 16.0;
        let var: f64 = vals.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / 16.0;
        assert!(mean.abs() < 1e-4, "group {g} mean {mean}");
        assert!((var - 1.0).abs() < 1e-2, "group {g} var {var}");
    }
}
