//! Per-operator forward kernels.
//!
//! Each kernel asserts its own shape/stride/dtype contract, partitions its
//! outer iteration dimension into disjoint per-thread ranges keyed by
//! `{ith, nth}`, and writes directly into the pre-allocated destination.
//! Dispatch is a table built at compile time, indexed by the op
//! discriminant; there is no per-node switch.

use crate::error::contract;
use crate::graph::Graph;
use crate::tensor::{Arena, Tensor};
use crate::threadpool::ComputeParams;

pub mod attention;
pub mod binary;
pub mod conv;
pub mod cpy;
pub mod matmul;
pub mod norm;
pub mod reduce;
pub mod rope;
pub mod scan;
pub mod unary;

/// Graph operator tag. The discriminant indexes the forward dispatch table.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    None = 0,
    Dup,
    Add,
    Sub,
    Mul,
    Div,
    Scale,
    Cpy,
    Cont,
    Reshape,
    View,
    Permute,
    Transpose,
    GetRows,
    Sum,
    SumRows,
    Mean,
    ArgMax,
    CountEqual,
    Norm,
    RmsNorm,
    GroupNorm,
    SoftMax,
    MulMat,
    MulMatId,
    Unary,
    Rope,
    Im2Col,
    ConvTranspose1D,
    ConvTranspose2D,
    Pool1D,
    Pool2D,
    FlashAttn,
    SsmScan,
}

pub const OP_COUNT: usize = 34;

impl Op {
    pub const fn name(self) -> &'static str {
        match self {
            Op::None => "none",
            Op::Dup => "dup",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Scale => "scale",
            Op::Cpy => "cpy",
            Op::Cont => "cont",
            Op::Reshape => "reshape",
            Op::View => "view",
            Op::Permute => "permute",
            Op::Transpose => "transpose",
            Op::GetRows => "get_rows",
            Op::Sum => "sum",
            Op::SumRows => "sum_rows",
            Op::Mean => "mean",
            Op::ArgMax => "argmax",
            Op::CountEqual => "count_equal",
            Op::Norm => "norm",
            Op::RmsNorm => "rms_norm",
            Op::GroupNorm => "group_norm",
            Op::SoftMax => "soft_max",
            Op::MulMat => "mul_mat",
            Op::MulMatId => "mul_mat_id",
            Op::Unary => "unary",
            Op::Rope => "rope",
            Op::Im2Col => "im2col",
            Op::ConvTranspose1D => "conv_transpose_1d",
            Op::ConvTranspose2D => "conv_transpose_2d",
            Op::Pool1D => "pool_1d",
            Op::Pool2D => "pool_2d",
            Op::FlashAttn => "flash_attn",
            Op::SsmScan => "ssm_scan",
        }
    }
}

/// Unary function selector carried in `op_params[0]` of an [`Op::Unary`]
/// node.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Abs = 0,
    Sgn,
    Neg,
    Step,
    Tanh,
    Sigmoid,
    Relu,
    Gelu,
    GeluQuick,
    Silu,
    Exp,
    Log,
    Sin,
    Cos,
    Sqrt,
    Sqr,
}

impl UnaryOp {
    pub fn from_i32(v: i32) -> UnaryOp {
        contract!((0..=15).contains(&v), "unknown unary op code {v}");
        // Discriminants are dense from 0.
        unsafe { std::mem::transmute::<i32, UnaryOp>(v) }
    }
}

/// Pooling function selector carried in `op_params[0]`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOp {
    Max = 0,
    Avg,
}

/// Rotary embedding layout: adjacent pairs (Norm) or split halves (Neox).
pub const ROPE_MODE_NORM: i32 = 0;
pub const ROPE_MODE_NEOX: i32 = 1;

/// Everything a kernel needs to address its node: the graph (for source
/// lookups), the arena (for data), and the destination tensor.
pub struct NodeCtx<'a> {
    pub graph: &'a Graph,
    pub arena: &'a Arena,
    pub dst: &'a Tensor,
}

impl<'a> NodeCtx<'a> {
    /// Source `i` of the destination node; missing sources are a contract
    /// violation.
    #[inline]
    pub fn src(&self, i: usize) -> &'a Tensor {
        let id = self.dst.src[i];
        contract!(id.is_some(), "{} node missing src{i}", self.dst.op.name());
        self.graph.tensor(id.unwrap())
    }

    #[inline]
    pub fn src_opt(&self, i: usize) -> Option<&'a Tensor> {
        self.dst.src[i].map(|id| self.graph.tensor(id))
    }
}

pub(crate) type ForwardFn = fn(&ComputeParams, &NodeCtx);

fn forward_nop(_params: &ComputeParams, _ctx: &NodeCtx) {}

fn forward_unrecognized(_params: &ComputeParams, ctx: &NodeCtx) {
    contract!(false, "unrecognized op {:?}", ctx.dst.op);
}

/// Forward dispatch table; slot order mirrors the [`Op`] discriminants.
static FORWARD_TABLE: [ForwardFn; OP_COUNT] = [
    forward_unrecognized,    // None: must not appear as a node
    cpy::compute_dup,        // Dup
    binary::compute_add,     // Add
    binary::compute_sub,     // Sub
    binary::compute_mul,     // Mul
    binary::compute_div,     // Div
    unary::compute_scale,    // Scale
    cpy::compute_cpy,        // Cpy
    cpy::compute_dup,        // Cont
    forward_nop,             // Reshape (layout only)
    forward_nop,             // View
    forward_nop,             // Permute
    forward_nop,             // Transpose
    cpy::compute_get_rows,   // GetRows
    reduce::compute_sum,     // Sum
    reduce::compute_sum_rows, // SumRows
    reduce::compute_mean,    // Mean
    reduce::compute_argmax,  // ArgMax
    reduce::compute_count_equal, // CountEqual
    norm::compute_norm,      // Norm
    norm::compute_rms_norm,  // RmsNorm
    norm::compute_group_norm, // GroupNorm
    norm::compute_soft_max,  // SoftMax
    matmul::compute_mul_mat, // MulMat
    matmul::compute_mul_mat_id, // MulMatId
    unary::compute_unary,    // Unary
    rope::compute_rope,      // Rope
    conv::compute_im2col,    // Im2Col
    conv::compute_conv_transpose_1d, // ConvTranspose1D
    conv::compute_conv_transpose_2d, // ConvTranspose2D
    conv::compute_pool_1d,   // Pool1D
    conv::compute_pool_2d,   // Pool2D
    attention::compute_flash_attn, // FlashAttn
    scan::compute_ssm_scan,  // SsmScan
];

/// Kernel for an op tag.
#[inline]
pub(crate) fn forward(op: Op) -> ForwardFn {
    FORWARD_TABLE[op as usize]
}
