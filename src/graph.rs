//! Computation graphs, execution plans, and the blocking compute entry
//! point.
//!
//! A [`Graph`] is a tensor table plus a topologically-ordered node list,
//! normally produced by an external builder; [`GraphBuilder`] is the thin
//! construction layer used by tests and embedders. [`graph_plan`] is the
//! sizing pass: it walks every node once, deciding the scratch-workspace
//! bytes each operator needs at the planned thread count (a matmul whose
//! src1 must be re-quantized, a softmax staging masked rows, a transpose
//! convolution packing its kernel), and allocates the workspace.

use half::f16;

use crate::dtype::DType;
use crate::error::{contract, Status};
use crate::ops::matmul::{mul_mat_id_ws_size, src1_conversion_size};
use crate::ops::{Op, PoolOp, UnaryOp};
use crate::tensor::{Arena, Tensor, TensorId, MAX_DIMS, MAX_OP_PARAMS, MAX_SRC, TENSOR_ALIGN};
use crate::threadpool::{ThreadPool, ThreadPoolConfig};
use crate::traits::type_traits;

/// Finished, topologically-ordered operation graph.
pub struct Graph {
    tensors: Vec<Tensor>,
    nodes: Vec<TensorId>,
}

impl Graph {
    #[inline]
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.index()]
    }

    #[inline]
    pub fn nodes(&self) -> &[TensorId] {
        &self.nodes
    }

    #[inline]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }
}

/// Derived per-graph execution plan: thread count, scratch size, and the
/// scratch buffer itself.
pub struct ComputePlan {
    pub n_threads: usize,
    pub work_size: usize,
    pub(crate) work_buf: Arena,
}

/// Scratch bytes one node needs at `nth` threads.
fn node_work_size(graph: &Graph, node: &Tensor, nth: usize) -> usize {
    let src = |i: usize| graph.tensor(node.src[i].expect("planned node missing source"));
    match node.op {
        Op::MulMat => src1_conversion_size(src(0), src(1)),
        Op::MulMatId => mul_mat_id_ws_size(src(0), src(1)),
        Op::SoftMax => nth * node.ne[0] as usize * 4,
        Op::FlashAttn => nth * 2 * src(0).ne[0] as usize * 4,
        Op::CountEqual => nth * 8,
        Op::ConvTranspose1D => {
            let a = src(0);
            let b = src(1);
            (a.nelements() + b.nelements()) as usize * 4
        }
        Op::ConvTranspose2D => {
            let a = src(0);
            let b = src(1);
            (a.nelements() + b.nelements()) as usize * 4
        }
        _ => 0,
    }
}

/// Sizing pass: inspect every node's operator and dtypes, return the plan
/// for `n_threads` workers. The workspace gets one cache line of padding
/// per extra thread so per-thread slices never share a line.
pub fn graph_plan(graph: &Graph, n_threads: usize) -> ComputePlan {
    contract!(n_threads >= 1, "graph_plan: n_threads must be >= 1");
    let mut work_size = 0usize;
    for &id in graph.nodes() {
        work_size = work_size.max(node_work_size(graph, graph.tensor(id), n_threads));
    }
    if work_size > 0 {
        work_size += TENSOR_ALIGN * (n_threads - 1);
    }
    ComputePlan {
        n_threads,
        work_size,
        work_buf: Arena::new(work_size.max(1)),
    }
}

/// One-shot convenience: plan, build a temporary pool, execute.
pub fn graph_compute_with(graph: &Graph, arena: &Arena, n_threads: usize) -> Status {
    let plan = graph_plan(graph, n_threads);
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(n_threads))
        .expect("threadpool creation failed");
    pool.graph_compute(graph, arena, &plan, None)
}

// ────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────

/// Thin graph construction layer: allocates tensors sequentially in an
/// arena-to-be and records op nodes in creation order (which is already
/// topological).
pub struct GraphBuilder {
    tensors: Vec<Tensor>,
    nodes: Vec<TensorId>,
    cursor: usize,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn shape4(ne: &[i64]) -> [i64; MAX_DIMS] {
    contract!(
        !ne.is_empty() && ne.len() <= MAX_DIMS,
        "tensor rank {} out of range",
        ne.len()
    );
    let mut out = [1i64; MAX_DIMS];
    out[..ne.len()].copy_from_slice(ne);
    contract!(out.iter().all(|&d| d > 0), "tensor dims must be positive");
    out
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            tensors: Vec::new(),
            nodes: Vec::new(),
            cursor: 0,
        }
    }

    /// Shape of an already-created tensor.
    #[inline]
    pub fn shape(&self, id: TensorId) -> [i64; MAX_DIMS] {
        self.tensors[id.index()].ne
    }

    #[inline]
    fn t(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.index()]
    }

    fn push(
        &mut self,
        dtype: DType,
        ne: [i64; MAX_DIMS],
        op: Op,
        srcs: &[TensorId],
    ) -> TensorId {
        contract!(srcs.len() <= MAX_SRC);
        contract!(
            ne[0] as usize % dtype.blck_size() == 0,
            "dim0 {} not a multiple of {} block size",
            ne[0],
            dtype.name()
        );
        self.cursor = (self.cursor + TENSOR_ALIGN - 1) & !(TENSOR_ALIGN - 1);
        let nb = Tensor::contiguous_strides(dtype, &ne);
        let mut src = [None; MAX_SRC];
        for (slot, &s) in src.iter_mut().zip(srcs) {
            *slot = Some(s);
        }
        let t = Tensor {
            dtype,
            ne,
            nb,
            op,
            op_params: [0; MAX_OP_PARAMS],
            src,
            offset: self.cursor,
        };
        self.cursor += dtype.row_size(ne[0]) * (ne[1] * ne[2] * ne[3]) as usize;
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(t);
        if op != Op::None {
            self.nodes.push(id);
        }
        id
    }

    fn set_f32(&mut self, id: TensorId, i: usize, v: f32) {
        self.tensors[id.index()].set_op_param_f32(i, v);
    }

    fn set_i32(&mut self, id: TensorId, i: usize, v: i32) {
        self.tensors[id.index()].set_op_param_i32(i, v);
    }

    /// New leaf tensor (graph input / weights).
    pub fn new_tensor(&mut self, dtype: DType, ne: &[i64]) -> TensorId {
        self.push(dtype, shape4(ne), Op::None, &[])
    }

    /// Layout-only view sharing the source's storage; never dispatched.
    fn push_view(
        &mut self,
        src: TensorId,
        ne: [i64; MAX_DIMS],
        nb: [usize; MAX_DIMS],
        op: Op,
    ) -> TensorId {
        let s = self.t(src);
        let t = Tensor {
            dtype: s.dtype,
            ne,
            nb,
            op,
            op_params: [0; MAX_OP_PARAMS],
            src: {
                let mut a = [None; MAX_SRC];
                a[0] = Some(src);
                a
            },
            offset: s.offset,
        };
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(t);
        id
    }

    /// Same storage, new shape. Source must be dense.
    pub fn reshape(&mut self, a: TensorId, ne: &[i64]) -> TensorId {
        let ne = shape4(ne);
        let t = self.t(a);
        contract!(t.is_contiguous(), "reshape: source must be contiguous");
        contract!(
            ne[0] * ne[1] * ne[2] * ne[3] == t.nelements(),
            "reshape: element count mismatch"
        );
        let dtype = t.dtype;
        let nb = Tensor::contiguous_strides(dtype, &ne);
        self.push_view(a, ne, nb, Op::Reshape)
    }

    /// Swap the first two dimensions (stride-only).
    pub fn transpose(&mut self, a: TensorId) -> TensorId {
        let t = self.t(a);
        let mut ne = t.ne;
        let mut nb = t.nb;
        ne.swap(0, 1);
        nb.swap(0, 1);
        self.push_view(a, ne, nb, Op::Transpose)
    }

    /// Arbitrary axis permutation: output dim `axes[i]` takes source dim
    /// `i`'s extent and stride.
    pub fn permute(&mut self, a: TensorId, axes: [usize; MAX_DIMS]) -> TensorId {
        let mut seen = [false; MAX_DIMS];
        for &ax in &axes {
            contract!(ax < MAX_DIMS && !seen[ax], "permute: invalid axes {axes:?}");
            seen[ax] = true;
        }
        let t = self.t(a);
        let mut ne = t.ne;
        let mut nb = t.nb;
        for i in 0..MAX_DIMS {
            ne[axes[i]] = t.ne[i];
            nb[axes[i]] = t.nb[i];
        }
        self.push_view(a, ne, nb, Op::Permute)
    }

    /// Densify a strided view into a fresh contiguous tensor.
    pub fn cont(&mut self, a: TensorId) -> TensorId {
        let ne = self.shape(a);
        let dtype = self.t(a).dtype;
        self.push(dtype, ne, Op::Cont, &[a])
    }

    // ── elementwise ─────────────────────────────────────────────────────

    pub fn add(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let ne = self.shape(a);
        self.push(DType::F32, ne, Op::Add, &[a, b])
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let ne = self.shape(a);
        self.push(DType::F32, ne, Op::Sub, &[a, b])
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let ne = self.shape(a);
        self.push(DType::F32, ne, Op::Mul, &[a, b])
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let ne = self.shape(a);
        self.push(DType::F32, ne, Op::Div, &[a, b])
    }

    pub fn scale(&mut self, a: TensorId, s: f32) -> TensorId {
        self.scale_bias(a, s, 0.0)
    }

    pub fn scale_bias(&mut self, a: TensorId, s: f32, b: f32) -> TensorId {
        let ne = self.shape(a);
        let id = self.push(DType::F32, ne, Op::Scale, &[a]);
        self.set_f32(id, 0, s);
        self.set_f32(id, 1, b);
        id
    }

    pub fn unary(&mut self, a: TensorId, op: UnaryOp) -> TensorId {
        let ne = self.shape(a);
        let id = self.push(DType::F32, ne, Op::Unary, &[a]);
        self.set_i32(id, 0, op as i32);
        id
    }

    // ── copy / convert ──────────────────────────────────────────────────

    /// Type-converting copy into a fresh contiguous tensor.
    pub fn cpy(&mut self, a: TensorId, dtype: DType) -> TensorId {
        let ne = self.shape(a);
        self.push(dtype, ne, Op::Cpy, &[a])
    }

    pub fn get_rows(&mut self, a: TensorId, ids: TensorId) -> TensorId {
        let ane = self.shape(a);
        let ine = self.shape(ids);
        self.push(
            DType::F32,
            [ane[0], ine[0], ine[1], ine[2]],
            Op::GetRows,
            &[a, ids],
        )
    }

    // ── reductions ──────────────────────────────────────────────────────

    pub fn sum(&mut self, a: TensorId) -> TensorId {
        self.push(DType::F32, [1, 1, 1, 1], Op::Sum, &[a])
    }

    pub fn sum_rows(&mut self, a: TensorId) -> TensorId {
        let ne = self.shape(a);
        self.push(DType::F32, [1, ne[1], ne[2], ne[3]], Op::SumRows, &[a])
    }

    pub fn mean(&mut self, a: TensorId) -> TensorId {
        self.push(DType::F32, [1, 1, 1, 1], Op::Mean, &[a])
    }

    pub fn argmax(&mut self, a: TensorId) -> TensorId {
        let ne = self.shape(a);
        self.push(DType::I32, [ne[1], 1, 1, 1], Op::ArgMax, &[a])
    }

    pub fn count_equal(&mut self, a: TensorId, b: TensorId) -> TensorId {
        self.push(DType::I64, [1, 1, 1, 1], Op::CountEqual, &[a, b])
    }

    // ── normalization ───────────────────────────────────────────────────

    pub fn norm(&mut self, a: TensorId, eps: f32) -> TensorId {
        let ne = self.shape(a);
        let id = self.push(DType::F32, ne, Op::Norm, &[a]);
        self.set_f32(id, 0, eps);
        id
    }

    pub fn rms_norm(&mut self, a: TensorId, eps: f32) -> TensorId {
        let ne = self.shape(a);
        let id = self.push(DType::F32, ne, Op::RmsNorm, &[a]);
        self.set_f32(id, 0, eps);
        id
    }

    pub fn group_norm(&mut self, a: TensorId, n_groups: i32, eps: f32) -> TensorId {
        let ne = self.shape(a);
        let id = self.push(DType::F32, ne, Op::GroupNorm, &[a]);
        self.set_f32(id, 0, eps);
        self.set_i32(id, 1, n_groups);
        id
    }

    pub fn soft_max(&mut self, a: TensorId) -> TensorId {
        self.soft_max_ext(a, None, 1.0, 0.0)
    }

    /// Softmax with optional additive mask and ALiBi `max_bias`.
    pub fn soft_max_ext(
        &mut self,
        a: TensorId,
        mask: Option<TensorId>,
        scale: f32,
        max_bias: f32,
    ) -> TensorId {
        let ne = self.shape(a);
        let id = match mask {
            Some(m) => self.push(DType::F32, ne, Op::SoftMax, &[a, m]),
            None => self.push(DType::F32, ne, Op::SoftMax, &[a]),
        };
        self.set_f32(id, 0, scale);
        self.set_f32(id, 1, max_bias);
        id
    }

    // ── matmul ──────────────────────────────────────────────────────────

    /// `dst[M, N, b2, b3] = src0[K, M]ᵀ · src1[K, N]` per batch.
    pub fn mul_mat(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let ane = self.shape(a);
        let bne = self.shape(b);
        contract!(ane[0] == bne[0], "mul_mat: inner dims {} vs {}", ane[0], bne[0]);
        self.push(
            DType::F32,
            [ane[1], bne[1], bne[2], bne[3]],
            Op::MulMat,
            &[a, b],
        )
    }

    /// Mixture-of-experts matmul: `ids[n]` picks the expert slab of `a`
    /// for src1 row `n`.
    pub fn mul_mat_id(&mut self, a: TensorId, b: TensorId, ids: TensorId) -> TensorId {
        let ane = self.shape(a);
        let bne = self.shape(b);
        contract!(ane[0] == bne[0], "mul_mat_id: inner dims {} vs {}", ane[0], bne[0]);
        self.push(DType::F32, [ane[1], bne[1], 1, 1], Op::MulMatId, &[a, b, ids])
    }

    // ── position encoding ───────────────────────────────────────────────

    pub fn rope(&mut self, a: TensorId, pos: TensorId, n_dims: i32, mode: i32) -> TensorId {
        self.rope_ext(a, pos, n_dims, mode, 0, 10000.0, 1.0, 0.0, 1.0, 0.0, 0.0, false)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn rope_ext(
        &mut self,
        a: TensorId,
        pos: TensorId,
        n_dims: i32,
        mode: i32,
        n_ctx_orig: i32,
        freq_base: f32,
        freq_scale: f32,
        ext_factor: f32,
        attn_factor: f32,
        beta_fast: f32,
        beta_slow: f32,
        backward: bool,
    ) -> TensorId {
        let ne = self.shape(a);
        let id = self.push(DType::F32, ne, Op::Rope, &[a, pos]);
        self.set_i32(id, 0, n_dims);
        self.set_i32(id, 1, mode);
        self.set_i32(id, 2, n_ctx_orig);
        self.set_f32(id, 3, freq_base);
        self.set_f32(id, 4, freq_scale);
        self.set_f32(id, 5, ext_factor);
        self.set_f32(id, 6, attn_factor);
        self.set_f32(id, 7, beta_fast);
        self.set_f32(id, 8, beta_slow);
        self.set_i32(id, 9, backward as i32);
        id
    }

    // ── convolution family ──────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn im2col(
        &mut self,
        kernel: TensorId,
        input: TensorId,
        s0: i32,
        s1: i32,
        p0: i32,
        p1: i32,
        d0: i32,
        d1: i32,
        is_2d: bool,
        dst_dtype: DType,
    ) -> TensorId {
        let kne = self.shape(kernel);
        let ine = self.shape(input);
        let conv_out =
            |iw: i64, k: i64, s: i64, p: i64, d: i64| (iw + 2 * p - d * (k - 1) - 1) / s + 1;
        let ne = if is_2d {
            let ow = conv_out(ine[0], kne[0], s0 as i64, p0 as i64, d0 as i64);
            let oh = conv_out(ine[1], kne[1], s1 as i64, p1 as i64, d1 as i64);
            [kne[2] * kne[1] * kne[0], ow, oh, ine[3]]
        } else {
            let ow = conv_out(ine[0], kne[0], s0 as i64, p0 as i64, d0 as i64);
            [kne[1] * kne[0], ow, ine[2], 1]
        };
        let id = self.push(dst_dtype, ne, Op::Im2Col, &[kernel, input]);
        self.set_i32(id, 0, s0);
        self.set_i32(id, 1, s1);
        self.set_i32(id, 2, p0);
        self.set_i32(id, 3, p1);
        self.set_i32(id, 4, d0);
        self.set_i32(id, 5, d1);
        self.set_i32(id, 6, is_2d as i32);
        id
    }

    pub fn conv_transpose_1d(&mut self, kernel: TensorId, input: TensorId, s0: i32) -> TensorId {
        let kne = self.shape(kernel);
        let ine = self.shape(input);
        let ol = (ine[0] - 1) * s0 as i64 + kne[0];
        let id = self.push(DType::F32, [ol, kne[1], 1, 1], Op::ConvTranspose1D, &[kernel, input]);
        self.set_i32(id, 0, s0);
        id
    }

    pub fn conv_transpose_2d(&mut self, kernel: TensorId, input: TensorId, stride: i32) -> TensorId {
        let kne = self.shape(kernel);
        let ine = self.shape(input);
        let ow = (ine[0] - 1) * stride as i64 + kne[0];
        let oh = (ine[1] - 1) * stride as i64 + kne[1];
        let id = self.push(
            DType::F32,
            [ow, oh, kne[2], 1],
            Op::ConvTranspose2D,
            &[kernel, input],
        );
        self.set_i32(id, 0, stride);
        id
    }

    pub fn pool_1d(&mut self, a: TensorId, op: PoolOp, k0: i32, s0: i32, p0: i32) -> TensorId {
        let ne = self.shape(a);
        let ow = (ne[0] + 2 * p0 as i64 - k0 as i64) / s0 as i64 + 1;
        let id = self.push(DType::F32, [ow, ne[1], ne[2], 1], Op::Pool1D, &[a]);
        self.set_i32(id, 0, op as i32);
        self.set_i32(id, 1, k0);
        self.set_i32(id, 2, s0);
        self.set_i32(id, 3, p0);
        id
    }

    #[allow(clippy::too_many_arguments)]
    pub fn pool_2d(
        &mut self,
        a: TensorId,
        op: PoolOp,
        k0: i32,
        k1: i32,
        s0: i32,
        s1: i32,
        p0: i32,
        p1: i32,
    ) -> TensorId {
        let ne = self.shape(a);
        let ow = (ne[0] + 2 * p0 as i64 - k0 as i64) / s0 as i64 + 1;
        let oh = (ne[1] + 2 * p1 as i64 - k1 as i64) / s1 as i64 + 1;
        let id = self.push(DType::F32, [ow, oh, ne[2], ne[3]], Op::Pool2D, &[a]);
        self.set_i32(id, 0, op as i32);
        self.set_i32(id, 1, k0);
        self.set_i32(id, 2, k1);
        self.set_i32(id, 3, s0);
        self.set_i32(id, 4, s1);
        self.set_i32(id, 5, p0);
        self.set_i32(id, 6, p1);
        id
    }

    // ── attention / recurrence ──────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn flash_attn(
        &mut self,
        q: TensorId,
        k: TensorId,
        v: TensorId,
        mask: Option<TensorId>,
        scale: f32,
        max_bias: f32,
        logit_softcap: f32,
    ) -> TensorId {
        let qne = self.shape(q);
        let id = match mask {
            Some(m) => self.push(DType::F32, qne, Op::FlashAttn, &[q, k, v, m]),
            None => self.push(DType::F32, qne, Op::FlashAttn, &[q, k, v]),
        };
        self.set_f32(id, 0, scale);
        self.set_f32(id, 1, max_bias);
        self.set_f32(id, 2, logit_softcap);
        id
    }

    /// dst holds `y[d_inner, n_tok]` followed by the final state
    /// `[d_state, d_inner]`, flattened.
    pub fn ssm_scan(
        &mut self,
        s0: TensorId,
        x: TensorId,
        dt: TensorId,
        a: TensorId,
        b: TensorId,
        c: TensorId,
    ) -> TensorId {
        let sne = self.shape(s0);
        let xne = self.shape(x);
        let n = xne[0] * xne[1] + sne[0] * sne[1];
        self.push(DType::F32, [n, 1, 1, 1], Op::SsmScan, &[s0, x, dt, a, b, c])
    }

    /// Finish construction: the graph plus its backing arena.
    pub fn build(self) -> (Graph, Arena) {
        let arena = Arena::new(self.cursor.max(1));
        (
            Graph {
                tensors: self.tensors,
                nodes: self.nodes,
            },
            arena,
        )
    }
}

/// Quantize an f32 slice into freshly allocated bytes of `dtype` (helper
/// for building quantized weight tensors).
pub fn quantize_values(dtype: DType, values: &[f32]) -> Vec<u8> {
    let traits = type_traits(dtype);
    contract!(
        traits.from_float.is_some(),
        "quantize_values: no encoder for {}",
        dtype.name()
    );
    contract!(values.len() % dtype.blck_size() == 0);
    let mut out = vec![0u8; dtype.row_size(values.len() as i64)];
    unsafe { traits.from_float.unwrap()(values, out.as_mut_ptr()) };
    out
}

/// Widen an f16 slice helper for tests and embedders.
pub fn f16_slice(values: &[f32]) -> Vec<f16> {
    values.iter().map(|&v| f16::from_f32(v)).collect()
}
