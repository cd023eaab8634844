//! Elementals on [`Var`] and the few vector reductions the parallel map's
//! callers lean on.
//!
//! Each elemental evaluates the primal with the base float and records one
//! unary node carrying its derivative. Reductions over many operands are
//! recorded as a single precomputed-gradient node instead of a chain of
//! binary nodes.

use crate::tape::TapeThreadLocal;
use crate::var::{record_unary, Var};

impl<F: TapeThreadLocal> Var<F> {
    #[inline]
    pub fn exp(self) -> Self {
        let e = self.value.exp();
        record_unary(self, e, e)
    }

    #[inline]
    pub fn ln(self) -> Self {
        record_unary(self, self.value.ln(), self.value.recip())
    }

    #[inline]
    pub fn sqrt(self) -> Self {
        let s = self.value.sqrt();
        let two = F::one() + F::one();
        record_unary(self, s, (two * s).recip())
    }

    #[inline]
    pub fn powi(self, n: i32) -> Self {
        let value = self.value.powi(n);
        let partial = if n == 0 {
            F::zero()
        } else {
            F::from_i32(n).unwrap_or_else(F::nan) * self.value.powi(n - 1)
        };
        record_unary(self, value, partial)
    }

    #[inline]
    pub fn powf(self, p: F) -> Self {
        let value = self.value.powf(p);
        record_unary(self, value, p * self.value.powf(p - F::one()))
    }

    #[inline]
    pub fn sin(self) -> Self {
        let (s, c) = self.value.sin_cos();
        record_unary(self, s, c)
    }

    #[inline]
    pub fn cos(self) -> Self {
        let (s, c) = self.value.sin_cos();
        record_unary(self, c, -s)
    }

    #[inline]
    pub fn tan(self) -> Self {
        let t = self.value.tan();
        record_unary(self, t, F::one() + t * t)
    }

    #[inline]
    pub fn tanh(self) -> Self {
        let t = self.value.tanh();
        record_unary(self, t, F::one() - t * t)
    }

    /// `|x|`, with derivative 0 at the kink.
    #[inline]
    pub fn abs(self) -> Self {
        let partial = if self.value > F::zero() {
            F::one()
        } else if self.value < F::zero() {
            -F::one()
        } else {
            F::zero()
        };
        record_unary(self, self.value.abs(), partial)
    }

    #[inline]
    pub fn recip(self) -> Self {
        let r = self.value.recip();
        record_unary(self, r, -r * r)
    }
}

/// Sum of `xs`, recorded as one node with unit partials.
pub fn sum<F: TapeThreadLocal>(xs: &[Var<F>]) -> Var<F> {
    let value = xs.iter().fold(F::zero(), |acc, x| acc + x.value);
    let partials = vec![F::one(); xs.len()];
    Var::precomputed(value, xs, &partials)
}

/// `ln(Σ exp(xs[k]))`, evaluated stably and recorded as one node.
///
/// The partial for `xs[k]` is its softmax weight. An empty slice gives
/// negative infinity.
pub fn log_sum_exp<F: TapeThreadLocal>(xs: &[Var<F>]) -> Var<F> {
    if xs.is_empty() {
        return Var::constant(F::neg_infinity());
    }
    let max = xs
        .iter()
        .map(Var::value)
        .fold(F::neg_infinity(), F::max);
    if max.is_infinite() {
        // All -inf, or a +inf term: the shift below would produce NaN.
        let partials = vec![F::zero(); xs.len()];
        return Var::precomputed(max, xs, &partials);
    }
    let total = xs
        .iter()
        .fold(F::zero(), |acc, x| acc + (x.value - max).exp());
    let value = max + total.ln();
    let partials: Vec<F> = xs.iter().map(|x| (x.value - value).exp()).collect();
    Var::precomputed(value, xs, &partials)
}
