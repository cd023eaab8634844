//! Nested recording sessions on the active tape.
//!
//! A session marks the current end of the tape. Everything recorded while it
//! is open forms the *nested region*: it can be differentiated on its own
//! ([`NestedSession::grad`]), thrown away while keeping the session open
//! ([`NestedSession::rewind`]), kept ([`NestedSession::merge`]) or discarded,
//! which is what dropping the session does.
//!
//! Sessions on one thread must close in reverse order of opening. The order
//! is checked in debug builds only.

use std::marker::PhantomData;

use crate::tape::{self, Tape, TapeMark, TapeThreadLocal};
use crate::var::Var;

/// Scoped region of the active tape.
///
/// ```
/// use nested_tape::{NestedSession, Tape, TapeGuard, Var};
///
/// let mut tape = Tape::<f64>::new();
/// let _guard = TapeGuard::new(&mut tape);
/// let x = Var::variable(3.0);
///
/// let session = NestedSession::new();
/// let y = x * x;
/// session.grad(y);
/// assert_eq!(x.adj(), 6.0);
/// drop(session);
/// ```
#[must_use = "dropping a session immediately discards its region"]
pub struct NestedSession<F: TapeThreadLocal> {
    mark: TapeMark,
    depth: usize,
    // Tied to the thread whose active tape it marks.
    _not_send: PhantomData<*mut Tape<F>>,
}

impl<F: TapeThreadLocal> NestedSession<F> {
    /// Open a session at the current end of the active tape.
    pub fn new() -> Self {
        let (mark, depth) = tape::with_active_tape(|t: &mut Tape<F>| t.open_session());
        tracing::trace!(start = mark.nodes, depth, "nested session opened");
        NestedSession {
            mark,
            depth,
            _not_send: PhantomData,
        }
    }

    /// Index of the first node in the nested region.
    #[inline]
    pub fn start(&self) -> usize {
        self.mark.nodes
    }

    /// Nesting depth, 1 for the outermost session.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Nodes recorded in the nested region so far.
    pub fn len(&self) -> usize {
        tape::with_active_tape(|t: &mut Tape<F>| t.len() - self.mark.nodes)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero the adjoints of the nested region, seed `output` with 1 and replay
    /// the nested region only.
    ///
    /// Nodes recorded before the session opened are not replayed, but they
    /// accumulate the contributions flowing out of the region.
    pub fn grad(&self, output: Var<F>) {
        let start = self.mark.nodes;
        tape::with_active_tape(|t: &mut Tape<F>| {
            t.set_zero_adjoints_from(start);
            if output.is_constant() {
                return;
            }
            assert!(
                output.index() as usize >= start,
                "nested grad seeded at node {} recorded before the session (start {})",
                output.index(),
                start
            );
            t.set_adjoint(output, F::one());
            t.sweep_from(start);
        });
    }

    /// Zero the adjoints of the nested region.
    pub fn set_zero_adjoints(&self) {
        let start = self.mark.nodes;
        tape::with_active_tape(|t: &mut Tape<F>| t.set_zero_adjoints_from(start));
    }

    /// Discard everything recorded since the session opened. The session stays
    /// open; handles into the discarded region become invalid.
    pub fn rewind(&mut self) {
        let mark = self.mark;
        tape::with_active_tape(|t: &mut Tape<F>| t.rewind_session(mark));
    }

    /// Close the session and keep its nodes as part of the enclosing tape.
    pub fn merge(self) {
        let mark = self.mark;
        std::mem::forget(self);
        tape::with_active_tape(|t: &mut Tape<F>| t.close_session(mark, false));
        tracing::trace!(start = mark.nodes, "nested session merged");
    }
}

impl<F: TapeThreadLocal> Default for NestedSession<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: TapeThreadLocal> Drop for NestedSession<F> {
    fn drop(&mut self) {
        let mark = self.mark;
        let closed = tape::try_with_active_tape(|t: &mut Tape<F>| t.close_session(mark, true));
        debug_assert!(
            closed.is_some() || std::thread::panicking(),
            "nested session outlived its tape guard"
        );
        tracing::trace!(start = mark.nodes, "nested session discarded");
    }
}
