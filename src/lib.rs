//! dagml: a multi-threaded CPU execution engine for directed-acyclic
//! computation graphs of tensor operations.
//!
//! The crate is built from four layers:
//! - a portable SIMD abstraction (`simd_primitive!` + [`simd`]) with
//!   scalar/AVX2/AVX-512/NEON expansions,
//! - block-quantized number codecs ([`quant`]) with fused dot kernels and
//!   an O(1) per-dtype dispatch table ([`traits`]),
//! - per-operator forward kernels ([`ops`]) over arena-backed tensor views
//!   ([`tensor`]), including a work-stealing cache-blocked matmul,
//! - a reusable threadpool with two-phase barrier synchronization, hybrid
//!   spin/block waiting, pause/resume, and cooperative cancellation
//!   ([`threadpool`]), driven one node at a time by [`graph`].
//!
//! # Quick start
//!
//! ```
//! use dagml::{DType, GraphBuilder, ThreadPool, ThreadPoolConfig, graph_plan};
//!
//! let mut b = GraphBuilder::new();
//! let x = b.new_tensor(DType::F32, &[64, 8]);
//! let w = b.new_tensor(DType::F32, &[64, 16]);
//! let y = b.mul_mat(w, x);
//! let (graph, mut arena) = b.build();
//!
//! arena.tensor_f32_mut(graph.tensor(x)).fill(0.5);
//! arena.tensor_f32_mut(graph.tensor(w)).fill(0.25);
//!
//! let pool = ThreadPool::new(ThreadPoolConfig::with_threads(4)).unwrap();
//! let plan = graph_plan(&graph, 4);
//! let status = pool.graph_compute(&graph, &arena, &plan, None);
//! assert_eq!(status, dagml::Status::Success);
//! let out = arena.tensor_f32(graph.tensor(y));
//! assert!((out[0] - 64.0 * 0.5 * 0.25).abs() < 1e-5);
//! ```

#[macro_use]
pub mod macros;

pub mod cache_params;
pub mod context;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod isa;
pub mod numa;
pub mod ops;
pub mod quant;
pub mod simd;
pub mod tensor;
pub mod threadpool;
pub mod traits;

pub use context::EngineContext;
pub use dtype::DType;
pub use error::{EngineError, EngineResult, Status};
pub use graph::{graph_compute_with, graph_plan, quantize_values, ComputePlan, Graph, GraphBuilder};
pub use isa::IsaLevel;
pub use ops::{Op, PoolOp, UnaryOp, ROPE_MODE_NEOX, ROPE_MODE_NORM};
pub use tensor::{Arena, Tensor, TensorId};
pub use threadpool::{ComputeParams, ThreadPool, ThreadPoolConfig, ThreadPrio};
