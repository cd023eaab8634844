//! Tape node variants and their propagate step.

use std::sync::Arc;

use crate::arena::{Arena, ArenaSlice};
use crate::float::Float;

/// User-extensible operation whose partials are computed lazily, during the
/// reverse sweep, from the operand values recorded on the tape.
///
/// ```
/// use std::sync::Arc;
/// use nested_tape::{CustomOp, Tape, TapeGuard, Var};
///
/// /// softplus(x) = ln(1 + e^x)
/// struct Softplus;
///
/// impl CustomOp<f64> for Softplus {
///     fn eval(&self, operands: &[f64]) -> f64 {
///         operands[0].exp().ln_1p()
///     }
///     fn partials(&self, operands: &[f64], _result: f64, out: &mut [f64]) {
///         out[0] = 1.0 / (1.0 + (-operands[0]).exp());
///     }
/// }
///
/// let mut tape = Tape::new();
/// let x = tape.new_variable(0.0);
/// let _guard = TapeGuard::new(&mut tape);
/// let y = Var::custom(Arc::new(Softplus), &[x]);
/// tape.grad(y);
/// assert!((tape.adjoint(x) - 0.5).abs() < 1e-12);
/// ```
pub trait CustomOp<F: Float>: Send + Sync {
    /// Forward evaluation on the operand values.
    fn eval(&self, operands: &[F]) -> F;

    /// Write `∂result/∂operands[k]` into `out[k]`; `out` is zeroed on entry.
    fn partials(&self, operands: &[F], result: F, out: &mut [F]);
}

/// One recorded operation. Node `i` on a tape produces variable `i`; every
/// parent index it stores is strictly smaller than `i`.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Node<F> {
    /// Independent variable.
    Leaf,
    Unary {
        operand: u32,
        partial: F,
    },
    Binary {
        lhs: u32,
        lhs_partial: F,
        rhs: u32,
        rhs_partial: F,
    },
    /// Fixed, externally supplied `(parent, partial)` pairs.
    Precomputed {
        parents: ArenaSlice,
        partials: ArenaSlice,
    },
    /// Partials produced by `customs[op]` at propagate time.
    Custom { op: u32, operands: ArenaSlice },
}

/// Read-only view of the tape storage a node needs while propagating.
pub(crate) struct EdgeStore<'a, F: Float> {
    pub(crate) indices: &'a Arena<u32>,
    pub(crate) partials: &'a Arena<F>,
    pub(crate) values: &'a [F],
    pub(crate) customs: &'a [Arc<dyn CustomOp<F>>],
}

impl<F: Float> Node<F> {
    /// Number of parent edges this node carries.
    pub(crate) fn num_edges(&self) -> usize {
        match self {
            Node::Leaf => 0,
            Node::Unary { .. } => 1,
            Node::Binary { .. } => 2,
            Node::Precomputed { parents, .. } => parents.len(),
            Node::Custom { operands, .. } => operands.len(),
        }
    }

    /// Add `adjoint * ∂self/∂parent` into each parent's adjoint.
    #[inline]
    pub(crate) fn propagate(
        &self,
        index: usize,
        adjoint: F,
        adjoints: &mut [F],
        store: &EdgeStore<'_, F>,
    ) {
        match *self {
            Node::Leaf => {}
            Node::Unary { operand, partial } => {
                let p = operand as usize;
                adjoints[p] = adjoints[p] + partial * adjoint;
            }
            Node::Binary {
                lhs,
                lhs_partial,
                rhs,
                rhs_partial,
            } => {
                let l = lhs as usize;
                adjoints[l] = adjoints[l] + lhs_partial * adjoint;
                let r = rhs as usize;
                adjoints[r] = adjoints[r] + rhs_partial * adjoint;
            }
            Node::Precomputed { parents, partials } => {
                let parents = store.indices.get(parents);
                let partials = store.partials.get(partials);
                for (&p, &d) in parents.iter().zip(partials) {
                    let p = p as usize;
                    adjoints[p] = adjoints[p] + d * adjoint;
                }
            }
            Node::Custom { op, operands } => {
                let operands = store.indices.get(operands);
                let args: Vec<F> = operands.iter().map(|&p| store.values[p as usize]).collect();
                let mut partials = vec![F::zero(); args.len()];
                store.customs[op as usize].partials(&args, store.values[index], &mut partials);
                for (&p, &d) in operands.iter().zip(&partials) {
                    let p = p as usize;
                    adjoints[p] = adjoints[p] + d * adjoint;
                }
            }
        }
    }
}
