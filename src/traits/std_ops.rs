use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use crate::tape::TapeThreadLocal;
use crate::var::{record_binary, record_unary, Var};

// ──────────────────────────────────────────────
//  Var<F> operators
// ──────────────────────────────────────────────

impl<F: TapeThreadLocal> Add for Var<F> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        record_binary(self, rhs, self.value + rhs.value, F::one(), F::one())
    }
}

impl<F: TapeThreadLocal> Sub for Var<F> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        record_binary(self, rhs, self.value - rhs.value, F::one(), -F::one())
    }
}

impl<F: TapeThreadLocal> Mul for Var<F> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        record_binary(self, rhs, self.value * rhs.value, rhs.value, self.value)
    }
}

impl<F: TapeThreadLocal> Div for Var<F> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        let inv = F::one() / rhs.value;
        let value = self.value * inv;
        record_binary(self, rhs, value, inv, -value * inv)
    }
}

impl<F: TapeThreadLocal> Neg for Var<F> {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        record_unary(self, -self.value, -F::one())
    }
}

impl<F: TapeThreadLocal> AddAssign for Var<F> {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<F: TapeThreadLocal> SubAssign for Var<F> {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<F: TapeThreadLocal> MulAssign for Var<F> {
    #[inline]
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl<F: TapeThreadLocal> DivAssign for Var<F> {
    #[inline]
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}

// Mixed ops: Var<F> with primitive floats.
macro_rules! impl_var_scalar_ops {
    ($f:ty) => {
        impl Add<$f> for Var<$f> {
            type Output = Var<$f>;
            #[inline]
            fn add(self, rhs: $f) -> Var<$f> {
                record_unary(self, self.value + rhs, 1.0)
            }
        }

        impl Add<Var<$f>> for $f {
            type Output = Var<$f>;
            #[inline]
            fn add(self, rhs: Var<$f>) -> Var<$f> {
                record_unary(rhs, self + rhs.value, 1.0)
            }
        }

        impl Sub<$f> for Var<$f> {
            type Output = Var<$f>;
            #[inline]
            fn sub(self, rhs: $f) -> Var<$f> {
                record_unary(self, self.value - rhs, 1.0)
            }
        }

        impl Sub<Var<$f>> for $f {
            type Output = Var<$f>;
            #[inline]
            fn sub(self, rhs: Var<$f>) -> Var<$f> {
                record_unary(rhs, self - rhs.value, -1.0)
            }
        }

        impl Mul<$f> for Var<$f> {
            type Output = Var<$f>;
            #[inline]
            fn mul(self, rhs: $f) -> Var<$f> {
                record_unary(self, self.value * rhs, rhs)
            }
        }

        impl Mul<Var<$f>> for $f {
            type Output = Var<$f>;
            #[inline]
            fn mul(self, rhs: Var<$f>) -> Var<$f> {
                record_unary(rhs, self * rhs.value, self)
            }
        }

        impl Div<$f> for Var<$f> {
            type Output = Var<$f>;
            #[inline]
            fn div(self, rhs: $f) -> Var<$f> {
                let inv: $f = 1.0 / rhs;
                record_unary(self, self.value * inv, inv)
            }
        }

        impl Div<Var<$f>> for $f {
            type Output = Var<$f>;
            #[inline]
            fn div(self, rhs: Var<$f>) -> Var<$f> {
                let inv: $f = 1.0 / rhs.value;
                record_unary(rhs, self * inv, -self * inv * inv)
            }
        }

        impl AddAssign<$f> for Var<$f> {
            #[inline]
            fn add_assign(&mut self, rhs: $f) {
                *self = *self + rhs;
            }
        }

        impl SubAssign<$f> for Var<$f> {
            #[inline]
            fn sub_assign(&mut self, rhs: $f) {
                *self = *self - rhs;
            }
        }

        impl MulAssign<$f> for Var<$f> {
            #[inline]
            fn mul_assign(&mut self, rhs: $f) {
                *self = *self * rhs;
            }
        }

        impl DivAssign<$f> for Var<$f> {
            #[inline]
            fn div_assign(&mut self, rhs: $f) {
                *self = *self / rhs;
            }
        }
    };
}

impl_var_scalar_ops!(f32);
impl_var_scalar_ops!(f64);

impl<F: TapeThreadLocal> Sum for Var<F> {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Var::constant(F::zero()), |acc, x| acc + x)
    }
}

impl<'a, F: TapeThreadLocal> Sum<&'a Var<F>> for Var<F> {
    fn sum<I: Iterator<Item = &'a Var<F>>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl<F: crate::Float> PartialEq for Var<F> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<F: crate::Float> PartialOrd for Var<F> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.value.partial_cmp(&other.value)
    }
}
