use std::fmt::{self, Display};
use std::sync::Arc;

use crate::float::Float;
use crate::node::CustomOp;
use crate::tape::{self, TapeThreadLocal, CONSTANT};

/// Reverse-mode AD handle.
///
/// Just a value and a tape index, 12 bytes for `f64`. `Copy` because the node
/// it names is owned by the tape, not by the handle: copying or dropping a
/// `Var` never touches the tape. A handle stays valid until its tape is reset.
#[derive(Clone, Copy, Debug)]
pub struct Var<F: Float> {
    pub(crate) value: F,
    pub(crate) index: u32,
}

impl<F: Float> Var<F> {
    /// Create a constant (not tracked on tape).
    #[inline]
    pub fn constant(value: F) -> Self {
        Var {
            value,
            index: CONSTANT,
        }
    }

    /// Create a handle from a tape allocation.
    /// Typically only used internally and by tests.
    #[inline]
    pub fn from_tape(value: F, index: u32) -> Self {
        Var { value, index }
    }

    #[inline]
    pub fn value(&self) -> F {
        self.value
    }

    /// Tape index, or [`CONSTANT`].
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        self.index == CONSTANT
    }
}

impl<F: TapeThreadLocal> Var<F> {
    /// Register a new independent variable on the active tape.
    pub fn variable(value: F) -> Self {
        tape::with_active_tape(|t| t.new_variable(value))
    }

    /// Adjoint of this variable on the active tape.
    pub fn adj(&self) -> F {
        if self.is_constant() {
            return F::zero();
        }
        tape::with_active_tape(|t| t.adjoint(*self))
    }

    /// Zero all adjoints on the active tape, seed this variable with 1 and
    /// replay the tape.
    ///
    /// On a constant every adjoint ends up zero; without an active tape that
    /// is a no-op.
    pub fn grad(&self) {
        if self.is_constant() {
            tape::try_with_active_tape(|t: &mut tape::Tape<F>| t.set_zero_adjoints());
            return;
        }
        tape::with_active_tape(|t| t.grad(*self));
    }

    /// Record a precomputed-gradient node on the active tape.
    ///
    /// `partials[k]` is `∂value/∂parents[k]`. Constant parents are ignored;
    /// with no tracked parents the result is a constant.
    pub fn precomputed(value: F, parents: &[Var<F>], partials: &[F]) -> Self {
        assert_eq!(
            parents.len(),
            partials.len(),
            "precomputed gradient needs one partial per parent"
        );
        if parents.iter().all(Var::is_constant) {
            return Var::constant(value);
        }
        let indices: Vec<u32> = parents.iter().map(Var::index).collect();
        let index = tape::with_active_tape(|t| t.push_precomputed(value, &indices, partials));
        Var { value, index }
    }

    /// Record a custom operation on the active tape.
    ///
    /// When some operands are constants the op's partials are evaluated
    /// immediately and recorded as a precomputed-gradient node instead.
    pub fn custom(op: Arc<dyn CustomOp<F>>, operands: &[Var<F>]) -> Self {
        let args: Vec<F> = operands.iter().map(Var::value).collect();
        let value = op.eval(&args);
        if operands.iter().all(Var::is_constant) {
            return Var::constant(value);
        }
        if operands.iter().any(Var::is_constant) {
            let mut partials = vec![F::zero(); args.len()];
            op.partials(&args, value, &mut partials);
            return Var::precomputed(value, operands, &partials);
        }
        let indices: Vec<u32> = operands.iter().map(Var::index).collect();
        let index = tape::with_active_tape(|t| t.push_custom(op, &indices, value));
        Var { value, index }
    }
}

impl<F: Float> Display for Var<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<F: Float> Default for Var<F> {
    fn default() -> Self {
        Var::constant(F::zero())
    }
}

impl<F: Float> From<F> for Var<F> {
    fn from(value: F) -> Self {
        Var::constant(value)
    }
}

/// Record a unary elemental on the active tape. Constants stay off the tape.
#[inline]
pub(crate) fn record_unary<F: TapeThreadLocal>(x: Var<F>, value: F, partial: F) -> Var<F> {
    if x.is_constant() {
        return Var::constant(value);
    }
    let index = tape::with_active_tape(|t| t.push_unary(x.index, partial, value));
    Var { value, index }
}

/// Record a binary elemental on the active tape. Constants stay off the tape.
#[inline]
pub(crate) fn record_binary<F: TapeThreadLocal>(
    x: Var<F>,
    y: Var<F>,
    value: F,
    dx: F,
    dy: F,
) -> Var<F> {
    if x.is_constant() && y.is_constant() {
        return Var::constant(value);
    }
    let index = tape::with_active_tape(|t| t.push_binary(x.index, dx, y.index, dy, value));
    Var { value, index }
}
