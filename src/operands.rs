//! Argument trees holding AD handles.
//!
//! [`Operands`] walks a (possibly nested) argument value position by position
//! and visits every *tracked* [`Var`] in it. Constants, plain floats and
//! integers occupy no position. All four walks use the same order (depth
//! first, left to right, column-major inside matrices), so a buffer filled by
//! [`Operands::save_indices`] lines up entry for entry with one filled by
//! [`Operands::save_adjoints`] on a deep copy of the same value.

use crate::float::Float;
use crate::matrix::Matrix;
use crate::tape::{self, Tape, TapeThreadLocal};
use crate::var::Var;

/// A value that may carry AD handles.
pub trait Operands<F: Float> {
    /// Number of tracked variables in the tree.
    fn count_vars(&self) -> usize;

    /// Write the tape index of every tracked variable into `out`; returns the
    /// number written.
    fn save_indices(&self, out: &mut [u32]) -> usize;

    /// Copy of `self` whose tracked variables are fresh leaves on `tape`
    /// holding the same values. Constants stay constants.
    fn deep_copy(&self, tape: &mut Tape<F>) -> Self
    where
        Self: Sized;

    /// Write the adjoint of every tracked variable, read from `tape`, into
    /// `out`; returns the number written.
    fn save_adjoints(&self, tape: &Tape<F>, out: &mut [F]) -> usize;
}

impl<F: Float> Operands<F> for Var<F> {
    #[inline]
    fn count_vars(&self) -> usize {
        usize::from(!self.is_constant())
    }

    #[inline]
    fn save_indices(&self, out: &mut [u32]) -> usize {
        if self.is_constant() {
            return 0;
        }
        out[0] = self.index();
        1
    }

    #[inline]
    fn deep_copy(&self, tape: &mut Tape<F>) -> Self {
        if self.is_constant() {
            return *self;
        }
        tape.new_variable(self.value())
    }

    #[inline]
    fn save_adjoints(&self, tape: &Tape<F>, out: &mut [F]) -> usize {
        if self.is_constant() {
            return 0;
        }
        out[0] = tape.adjoint(*self);
        1
    }
}

// Plain data: no positions.
macro_rules! impl_passive_operands {
    ($($t:ty),*) => {
        $(
            impl<F: Float> Operands<F> for $t {
                #[inline]
                fn count_vars(&self) -> usize {
                    0
                }
                #[inline]
                fn save_indices(&self, _out: &mut [u32]) -> usize {
                    0
                }
                #[inline]
                fn deep_copy(&self, _tape: &mut Tape<F>) -> Self {
                    *self
                }
                #[inline]
                fn save_adjoints(&self, _tape: &Tape<F>, _out: &mut [F]) -> usize {
                    0
                }
            }
        )*
    };
}

impl_passive_operands!(f32, f64, i32, i64, usize, bool, ());

/// Shared body of the sequence impls.
fn count_seq<'a, F: Float, T: Operands<F> + 'a>(items: impl Iterator<Item = &'a T>) -> usize {
    items.map(Operands::count_vars).sum()
}

fn save_indices_seq<'a, F: Float, T: Operands<F> + 'a>(
    items: impl Iterator<Item = &'a T>,
    out: &mut [u32],
) -> usize {
    let mut n = 0;
    for item in items {
        n += item.save_indices(&mut out[n..]);
    }
    n
}

fn save_adjoints_seq<'a, F: Float, T: Operands<F> + 'a>(
    items: impl Iterator<Item = &'a T>,
    tape: &Tape<F>,
    out: &mut [F],
) -> usize {
    let mut n = 0;
    for item in items {
        n += item.save_adjoints(tape, &mut out[n..]);
    }
    n
}

impl<F: Float, T: Operands<F>> Operands<F> for Vec<T> {
    fn count_vars(&self) -> usize {
        count_seq(self.iter())
    }

    fn save_indices(&self, out: &mut [u32]) -> usize {
        save_indices_seq(self.iter(), out)
    }

    fn deep_copy(&self, tape: &mut Tape<F>) -> Self {
        self.iter().map(|x| x.deep_copy(tape)).collect()
    }

    fn save_adjoints(&self, tape: &Tape<F>, out: &mut [F]) -> usize {
        save_adjoints_seq(self.iter(), tape, out)
    }
}

impl<F: Float, T: Operands<F>, const N: usize> Operands<F> for [T; N] {
    fn count_vars(&self) -> usize {
        count_seq(self.iter())
    }

    fn save_indices(&self, out: &mut [u32]) -> usize {
        save_indices_seq(self.iter(), out)
    }

    fn deep_copy(&self, tape: &mut Tape<F>) -> Self {
        self.each_ref().map(|x| x.deep_copy(tape))
    }

    fn save_adjoints(&self, tape: &Tape<F>, out: &mut [F]) -> usize {
        save_adjoints_seq(self.iter(), tape, out)
    }
}

impl<F: Float, T: Operands<F>> Operands<F> for Matrix<T> {
    fn count_vars(&self) -> usize {
        count_seq(self.iter())
    }

    fn save_indices(&self, out: &mut [u32]) -> usize {
        save_indices_seq(self.iter(), out)
    }

    fn deep_copy(&self, tape: &mut Tape<F>) -> Self {
        self.map(|x| x.deep_copy(tape))
    }

    fn save_adjoints(&self, tape: &Tape<F>, out: &mut [F]) -> usize {
        save_adjoints_seq(self.iter(), tape, out)
    }
}

macro_rules! impl_tuple_operands {
    ($($name:ident : $idx:tt),+) => {
        impl<F: Float, $($name: Operands<F>),+> Operands<F> for ($($name,)+) {
            fn count_vars(&self) -> usize {
                0 $(+ self.$idx.count_vars())+
            }

            fn save_indices(&self, out: &mut [u32]) -> usize {
                let mut n = 0;
                $(n += self.$idx.save_indices(&mut out[n..]);)+
                n
            }

            fn deep_copy(&self, tape: &mut Tape<F>) -> Self {
                ($(self.$idx.deep_copy(tape),)+)
            }

            fn save_adjoints(&self, tape: &Tape<F>, out: &mut [F]) -> usize {
                let mut n = 0;
                $(n += self.$idx.save_adjoints(tape, &mut out[n..]);)+
                n
            }
        }
    };
}

impl_tuple_operands!(A: 0);
impl_tuple_operands!(A: 0, B: 1);
impl_tuple_operands!(A: 0, B: 1, C: 2);
impl_tuple_operands!(A: 0, B: 1, C: 2, D: 3);
impl_tuple_operands!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_tuple_operands!(A: 0, B: 1, C: 2, D: 3, E: 4, G: 5);

#[cfg(feature = "ndarray")]
mod ndarray_impls {
    use ndarray::{Array1, Array2};

    use super::*;

    impl<F: Float, T: Operands<F>> Operands<F> for Array1<T> {
        fn count_vars(&self) -> usize {
            count_seq(self.iter())
        }

        fn save_indices(&self, out: &mut [u32]) -> usize {
            save_indices_seq(self.iter(), out)
        }

        fn deep_copy(&self, tape: &mut Tape<F>) -> Self {
            self.map(|x| x.deep_copy(tape))
        }

        fn save_adjoints(&self, tape: &Tape<F>, out: &mut [F]) -> usize {
            save_adjoints_seq(self.iter(), tape, out)
        }
    }

    // Column-major, matching `Matrix`, whatever the array's memory order.
    impl<F: Float, T: Operands<F>> Operands<F> for Array2<T> {
        fn count_vars(&self) -> usize {
            count_seq(self.t().iter())
        }

        fn save_indices(&self, out: &mut [u32]) -> usize {
            save_indices_seq(self.t().iter(), out)
        }

        fn deep_copy(&self, tape: &mut Tape<F>) -> Self {
            // Copy in column-major order so fresh leaves are numbered the same
            // way the other walks visit them.
            let (rows, cols) = self.dim();
            let copied = Array2::from_shape_fn((cols, rows), |(j, i)| self[[i, j]].deep_copy(tape));
            copied.reversed_axes()
        }

        fn save_adjoints(&self, tape: &Tape<F>, out: &mut [F]) -> usize {
            save_adjoints_seq(self.t().iter(), tape, out)
        }
    }
}

/// Number of tracked variables in `args`.
pub fn count_vars<F: Float, A: Operands<F>>(args: &A) -> usize {
    args.count_vars()
}

/// Deep copy `args` onto the active tape.
pub fn deep_copy_vars<F: TapeThreadLocal, A: Operands<F>>(args: &A) -> A {
    tape::with_active_tape(|t| args.deep_copy(t))
}

/// Flatten the adjoints of every tracked variable in `args`, read from the
/// active tape, into `dest`. Returns the number of adjoints written.
pub fn save_adjoints<F: TapeThreadLocal, A: Operands<F>>(dest: &mut [F], args: &A) -> usize {
    let n = args.count_vars();
    assert!(
        dest.len() >= n,
        "adjoint buffer holds {} entries, arguments carry {} variables",
        dest.len(),
        n
    );
    tape::with_active_tape(|t: &mut Tape<F>| args.save_adjoints(t, dest))
}
