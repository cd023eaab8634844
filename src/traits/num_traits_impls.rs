use num_traits::{One, Zero};

use crate::tape::TapeThreadLocal;
use crate::var::Var;

impl<F: TapeThreadLocal> Zero for Var<F> {
    #[inline]
    fn zero() -> Self {
        Var::constant(F::zero())
    }
    #[inline]
    fn is_zero(&self) -> bool {
        self.value.is_zero()
    }
}

impl<F: TapeThreadLocal> One for Var<F> {
    #[inline]
    fn one() -> Self {
        Var::constant(F::one())
    }
}
