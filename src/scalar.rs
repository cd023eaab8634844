//! The [`Scalar`] trait for writing AD-generic numeric code.
//!
//! Functions written as `fn f<T: Scalar>(x: T) -> T` work transparently with
//! plain `f32`/`f64` and with [`Var`]. The numeric and AD flavours of the
//! parallel map can therefore share one index function.

use std::fmt::{Debug, Display};
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

use num_traits::{One, Zero};

use crate::float::Float;
use crate::tape::TapeThreadLocal;
use crate::var::Var;

/// Arithmetic plus the elementals recorded by this crate.
pub trait Scalar:
    Copy
    + Default
    + Debug
    + Display
    + Send
    + Sync
    + PartialOrd
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + 'static
{
    /// The underlying primitive float type.
    type Float: Float;

    /// Lift a plain float to this scalar (constant, zero derivative).
    fn from_f(val: Self::Float) -> Self;

    /// Extract the primal value.
    fn value(&self) -> Self::Float;

    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn powi(self, n: i32) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tanh(self) -> Self;
}

macro_rules! impl_scalar_float {
    ($f:ty) => {
        impl Scalar for $f {
            type Float = $f;

            #[inline]
            fn from_f(val: $f) -> Self {
                val
            }

            #[inline]
            fn value(&self) -> $f {
                *self
            }

            #[inline]
            fn exp(self) -> Self {
                <$f>::exp(self)
            }
            #[inline]
            fn ln(self) -> Self {
                <$f>::ln(self)
            }
            #[inline]
            fn sqrt(self) -> Self {
                <$f>::sqrt(self)
            }
            #[inline]
            fn powi(self, n: i32) -> Self {
                <$f>::powi(self, n)
            }
            #[inline]
            fn sin(self) -> Self {
                <$f>::sin(self)
            }
            #[inline]
            fn cos(self) -> Self {
                <$f>::cos(self)
            }
            #[inline]
            fn tanh(self) -> Self {
                <$f>::tanh(self)
            }
        }
    };
}

impl_scalar_float!(f32);
impl_scalar_float!(f64);

impl<F: TapeThreadLocal> Scalar for Var<F> {
    type Float = F;

    #[inline]
    fn from_f(val: F) -> Self {
        Var::constant(val)
    }

    #[inline]
    fn value(&self) -> F {
        self.value
    }

    #[inline]
    fn exp(self) -> Self {
        Var::exp(self)
    }
    #[inline]
    fn ln(self) -> Self {
        Var::ln(self)
    }
    #[inline]
    fn sqrt(self) -> Self {
        Var::sqrt(self)
    }
    #[inline]
    fn powi(self, n: i32) -> Self {
        Var::powi(self, n)
    }
    #[inline]
    fn sin(self) -> Self {
        Var::sin(self)
    }
    #[inline]
    fn cos(self) -> Self {
        Var::cos(self)
    }
    #[inline]
    fn tanh(self) -> Self {
        Var::tanh(self)
    }
}
