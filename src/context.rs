//! Process-wide engine context.
//!
//! Everything the kernels would otherwise keep in file-scope mutable caches
//! (ISA feature level, cache blocking parameters, NUMA topology, activation
//! lookup tables) lives in one explicit object with an init-once lifecycle.
//! [`EngineContext::get`] returns the shared process-wide instance;
//! [`EngineContext::new`] builds an isolated one for tests.

use std::sync::OnceLock;

use half::f16;

use crate::cache_params::CacheParams;
use crate::isa::{detect_isa, IsaLevel};
use crate::numa::NumaTopology;

/// GELU evaluated through a 64Ki-entry f16 table: one lookup per element in
/// the unary kernel instead of a tanh per element. Table entries are exact
/// f16 roundings of the erf-form GELU of every representable f16 input.
pub struct GeluTable {
    table: Box<[f16]>,
}

impl GeluTable {
    fn build() -> Self {
        let mut table = vec![f16::ZERO; 1 << 16].into_boxed_slice();
        for (bits, slot) in table.iter_mut().enumerate() {
            let x = f16::from_bits(bits as u16).to_f32();
            *slot = f16::from_f32(gelu_ref_f32(x));
        }
        Self { table }
    }

    #[inline(always)]
    pub fn eval(&self, x: f32) -> f32 {
        self.table[f16::from_f32(x).to_bits() as usize].to_f32()
    }
}

/// Reference GELU (erf form), used to seed the table and by tests.
#[inline]
pub fn gelu_ref_f32(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_56;
    const COEF: f32 = 0.044_715;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + COEF * x * x * x)).tanh())
}

pub struct EngineContext {
    pub isa: IsaLevel,
    pub cache: CacheParams,
    pub numa: NumaTopology,
    pub gelu: GeluTable,
}

static CONTEXT: OnceLock<EngineContext> = OnceLock::new();

impl EngineContext {
    /// Build an isolated context (tests, embedding scenarios).
    pub fn new() -> Self {
        Self {
            isa: detect_isa(),
            cache: CacheParams::detect(),
            numa: NumaTopology::detect(),
            gelu: GeluTable::build(),
        }
    }

    /// The shared process-wide context, initialized on first use.
    pub fn get() -> &'static EngineContext {
        CONTEXT.get_or_init(EngineContext::new)
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Detected ISA of the process-wide context.
#[inline(always)]
pub(crate) fn isa() -> IsaLevel {
    EngineContext::get().isa
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gelu_table_matches_reference() {
        let ctx = EngineContext::get();
        for &x in &[-4.0f32, -1.0, -0.5, 0.0, 0.5, 1.0, 2.0, 4.0] {
            let got = ctx.gelu.eval(x);
            let want = gelu_ref_f32(x);
            // f16 argument + f16 result quantization
            assert!((got - want).abs() <= 4e-3 * (1.0 + want.abs()), "x={x}");
        }
    }

    #[test]
    fn context_is_singleton() {
        let a = EngineContext::get() as *const _;
        let b = EngineContext::get() as *const _;
        assert_eq!(a, b);
    }
}
