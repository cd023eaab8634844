//! Arena-backed tape for reverse-mode AD.
//!
//! Every recorded operation becomes one [`Node`] appended in construction
//! order, together with its value and an adjoint accumulator. Parent edges
//! that do not fit inline (precomputed-gradient and custom nodes) live in
//! bump arenas owned by the tape. The reverse sweep walks nodes from newest
//! to oldest, so a node's adjoint is complete before it propagates.
//!
//! Recording goes through a thread-local *active* tape installed with
//! [`TapeGuard`]; tapes themselves are ordinary values, so tests and worker
//! threads each own theirs.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread::LocalKey;

use crate::arena::{Arena, ArenaMark, ArenaSlice};
use crate::float::Float;
use crate::node::{CustomOp, EdgeStore, Node};
use crate::var::Var;

/// Sentinel index indicating a constant (not recorded on tape).
pub const CONSTANT: u32 = u32::MAX;

/// Maximum number of reset tapes kept per thread by [`with_pooled_tape`].
const MAX_POOLED_TAPES: usize = 2;

/// Tape position captured when a nested session opens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TapeMark {
    pub(crate) nodes: usize,
    indices: ArenaMark,
    partials: ArenaMark,
    customs: usize,
}

/// Size summary of a tape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TapeStats {
    /// Recorded nodes, leaves included.
    pub nodes: usize,
    /// Parent edges across all nodes.
    pub edges: usize,
    /// Nested sessions currently open on the tape.
    pub open_sessions: usize,
    /// Parent-index slots held by the edge arena, including slots reserved
    /// for nodes not yet recorded.
    pub edge_slots: usize,
}

/// Append-only record of a computation, replayed back-to-front.
pub struct Tape<F: Float> {
    nodes: Vec<Node<F>>,
    values: Vec<F>,
    adjoints: Vec<F>,
    indices: Arena<u32>,
    partials: Arena<F>,
    customs: Vec<Arc<dyn CustomOp<F>>>,
    sessions: Vec<TapeMark>,
}

impl<F: Float> Default for Tape<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Float> Tape<F> {
    /// Create an empty tape.
    pub fn new() -> Self {
        Tape {
            nodes: Vec::new(),
            values: Vec::new(),
            adjoints: Vec::new(),
            indices: Arena::new(),
            partials: Arena::new(),
            customs: Vec::new(),
            sessions: Vec::new(),
        }
    }

    /// Create a tape with room for `est_nodes` nodes before reallocating.
    pub fn with_capacity(est_nodes: usize) -> Self {
        Tape {
            nodes: Vec::with_capacity(est_nodes),
            values: Vec::with_capacity(est_nodes),
            adjoints: Vec::with_capacity(est_nodes),
            ..Self::new()
        }
    }

    /// Number of recorded nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self) -> TapeStats {
        TapeStats {
            nodes: self.nodes.len(),
            edges: self.nodes.iter().map(Node::num_edges).sum(),
            open_sessions: self.sessions.len(),
            edge_slots: self.indices.len(),
        }
    }

    #[inline]
    fn push(&mut self, node: Node<F>, value: F) -> u32 {
        let index = self.nodes.len();
        assert!(index < CONSTANT as usize, "tape index overflow");
        self.nodes.push(node);
        self.values.push(value);
        self.adjoints.push(F::zero());
        index as u32
    }

    /// Register a new independent variable.
    #[inline]
    pub fn new_variable(&mut self, value: F) -> Var<F> {
        let index = self.push(Node::Leaf, value);
        Var::from_tape(value, index)
    }

    /// Record `value = f(operand)` with precomputed `partial = df/d(operand)`.
    #[inline]
    pub fn push_unary(&mut self, operand: u32, partial: F, value: F) -> u32 {
        if operand == CONSTANT {
            return self.push(Node::Leaf, value);
        }
        self.push(Node::Unary { operand, partial }, value)
    }

    /// Record a binary operation with precomputed partial derivatives.
    #[inline]
    pub fn push_binary(&mut self, lhs: u32, lhs_partial: F, rhs: u32, rhs_partial: F, value: F) -> u32 {
        match (lhs == CONSTANT, rhs == CONSTANT) {
            (false, false) => self.push(
                Node::Binary {
                    lhs,
                    lhs_partial,
                    rhs,
                    rhs_partial,
                },
                value,
            ),
            (false, true) => self.push_unary(lhs, lhs_partial, value),
            (true, false) => self.push_unary(rhs, rhs_partial, value),
            (true, true) => self.push(Node::Leaf, value),
        }
    }

    /// Record a precomputed-gradient node: `value` with fixed partials
    /// `partials[k] = ∂value/∂parents[k]`. Constant parents are dropped.
    pub fn push_precomputed(&mut self, value: F, parents: &[u32], partials: &[F]) -> u32 {
        assert_eq!(
            parents.len(),
            partials.len(),
            "precomputed gradient needs one partial per parent"
        );
        let (parents, partials) = if parents.contains(&CONSTANT) {
            parents
                .iter()
                .zip(partials)
                .filter(|(&p, _)| p != CONSTANT)
                .map(|(&p, &d)| (p, d))
                .unzip()
        } else {
            (parents.to_vec(), partials.to_vec())
        };
        let parents = self.indices.alloc_copy(&parents);
        let partials = self.partials.alloc_copy(&partials);
        self.push_precomputed_slices(value, parents, partials)
    }

    /// Record a precomputed-gradient node over edge storage already living in
    /// this tape's arenas (see [`alloc_edge_slots`](Self::alloc_edge_slots)).
    pub(crate) fn push_precomputed_slices(
        &mut self,
        value: F,
        parents: ArenaSlice,
        partials: ArenaSlice,
    ) -> u32 {
        debug_assert_eq!(parents.len(), partials.len());
        debug_assert!(self
            .indices
            .get(parents)
            .iter()
            .all(|&p| (p as usize) < self.nodes.len()));
        self.push(Node::Precomputed { parents, partials }, value)
    }

    /// Record a custom operation over `operands`; returns the new index.
    ///
    /// Every operand must be a recorded node: the op reads operand values
    /// back from the tape when it propagates.
    pub fn push_custom(&mut self, op: Arc<dyn CustomOp<F>>, operands: &[u32], value: F) -> u32 {
        assert!(
            operands.iter().all(|&p| p != CONSTANT),
            "custom op operands must be recorded variables"
        );
        let op_index = self.customs.len() as u32;
        self.customs.push(op);
        let operands = self.indices.alloc_copy(operands);
        self.push(
            Node::Custom {
                op: op_index,
                operands,
            },
            value,
        )
    }

    /// Allocate `len` parent slots and `len` partial slots in the tape's
    /// arenas, for later use by precomputed-gradient nodes.
    pub(crate) fn alloc_edge_slots(&mut self, len: usize) -> (ArenaSlice, ArenaSlice) {
        (self.indices.alloc_default(len), self.partials.alloc_default(len))
    }

    /// Copy parent indices and partials into the tape's arenas.
    pub(crate) fn alloc_edges(&mut self, parents: &[u32], partials: &[F]) -> (ArenaSlice, ArenaSlice) {
        (self.indices.alloc_copy(parents), self.partials.alloc_copy(partials))
    }

    /// Mutable views of slots returned by [`alloc_edge_slots`](Self::alloc_edge_slots).
    pub(crate) fn edge_slots_mut(
        &mut self,
        parents: ArenaSlice,
        partials: ArenaSlice,
    ) -> (&mut [u32], &mut [F]) {
        (self.indices.get_mut(parents), self.partials.get_mut(partials))
    }

    /// Recorded value of node `index`.
    #[inline]
    pub fn value_at(&self, index: u32) -> F {
        self.values[index as usize]
    }

    /// Adjoint of `var`; zero for constants.
    #[inline]
    pub fn adjoint(&self, var: Var<F>) -> F {
        if var.is_constant() {
            F::zero()
        } else {
            self.adjoints[var.index() as usize]
        }
    }

    /// Adjoints of every node, in construction order.
    #[inline]
    pub fn adjoints(&self) -> &[F] {
        &self.adjoints
    }

    /// Overwrite the adjoint of `var`. Ignored for constants.
    #[inline]
    pub fn set_adjoint(&mut self, var: Var<F>, adjoint: F) {
        if !var.is_constant() {
            self.adjoints[var.index() as usize] = adjoint;
        }
    }

    pub fn set_zero_adjoints(&mut self) {
        self.set_zero_adjoints_from(0);
    }

    /// Zero the adjoints of nodes `start..`.
    pub fn set_zero_adjoints_from(&mut self, start: usize) {
        let start = start.min(self.adjoints.len());
        self.adjoints[start..].fill(F::zero());
    }

    /// Replay the whole tape with the adjoints as they currently are.
    pub fn sweep(&mut self) {
        self.sweep_from(0);
    }

    /// Replay nodes `start..` in reverse order. Nodes before `start` only
    /// receive adjoint contributions; they never propagate.
    pub fn sweep_from(&mut self, start: usize) {
        self.sweep_observed(start, |_, _| {});
    }

    /// Like [`sweep_from`](Self::sweep_from), calling `observer(index, adjoint)`
    /// for every visited node right before it would propagate.
    pub fn sweep_observed(&mut self, start: usize, mut observer: impl FnMut(usize, F)) {
        let Tape {
            nodes,
            values,
            adjoints,
            indices,
            partials,
            customs,
            ..
        } = self;
        let store = EdgeStore {
            indices,
            partials,
            values: values.as_slice(),
            customs: customs.as_slice(),
        };
        for i in (start..nodes.len()).rev() {
            let a = adjoints[i];
            observer(i, a);
            if a == F::zero() {
                continue;
            }
            nodes[i].propagate(i, a, adjoints, &store);
        }
    }

    /// Zero all adjoints, seed `output` with 1 and replay the tape.
    ///
    /// Seeding a constant leaves every adjoint at zero.
    pub fn grad(&mut self, output: Var<F>) {
        self.grad_seeded(&[(output, F::one())]);
    }

    /// Zero all adjoints, add each seed to its variable's adjoint and replay.
    pub fn grad_seeded(&mut self, seeds: &[(Var<F>, F)]) {
        self.set_zero_adjoints();
        for &(var, seed) in seeds {
            if !var.is_constant() {
                let i = var.index() as usize;
                self.adjoints[i] = self.adjoints[i] + seed;
            }
        }
        self.sweep();
    }

    /// Bulk-free every node and edge. All handles recorded on this tape
    /// become invalid.
    pub fn reset(&mut self) {
        debug_assert!(
            self.sessions.is_empty(),
            "tape reset with {} nested session(s) still open",
            self.sessions.len()
        );
        tracing::trace!(nodes = self.nodes.len(), "tape reset");
        self.nodes.clear();
        self.values.clear();
        self.adjoints.clear();
        self.indices.reset();
        self.partials.reset();
        self.customs.clear();
        self.sessions.clear();
    }

    /// Current end of the tape, nodes and arenas.
    pub(crate) fn mark(&self) -> TapeMark {
        TapeMark {
            nodes: self.nodes.len(),
            indices: self.indices.mark(),
            partials: self.partials.mark(),
            customs: self.customs.len(),
        }
    }

    /// Drop every node and edge recorded after `mark`.
    pub(crate) fn rewind(&mut self, mark: TapeMark) {
        self.nodes.truncate(mark.nodes);
        self.values.truncate(mark.nodes);
        self.adjoints.truncate(mark.nodes);
        self.indices.rewind(mark.indices);
        self.partials.rewind(mark.partials);
        self.customs.truncate(mark.customs);
    }

    /// Open a nested region; returns its mark and nesting depth.
    pub(crate) fn open_session(&mut self) -> (TapeMark, usize) {
        let mark = self.mark();
        self.sessions.push(mark);
        (mark, self.sessions.len())
    }

    /// Discard everything recorded since `mark`, keeping the session open.
    pub(crate) fn rewind_session(&mut self, mark: TapeMark) {
        debug_assert_eq!(
            self.sessions.last(),
            Some(&mark),
            "nested session rewound out of stack order"
        );
        self.rewind(mark);
    }

    /// Close the innermost session, discarding or keeping its nodes.
    pub(crate) fn close_session(&mut self, mark: TapeMark, discard: bool) {
        let top = self.sessions.pop();
        debug_assert_eq!(top, Some(mark), "nested sessions closed out of stack order");
        if discard {
            self.rewind(mark);
        }
    }
}

// Thread-local active tape pointer and pool of idle worker tapes.
thread_local! {
    static TAPE_F32: Cell<*mut Tape<f32>> = const { Cell::new(std::ptr::null_mut()) };
    static TAPE_F64: Cell<*mut Tape<f64>> = const { Cell::new(std::ptr::null_mut()) };
    static POOL_F32: RefCell<Vec<Tape<f32>>> = const { RefCell::new(Vec::new()) };
    static POOL_F64: RefCell<Vec<Tape<f64>>> = const { RefCell::new(Vec::new()) };
}

/// Trait to select the correct thread-locals for a given float type.
pub trait TapeThreadLocal: Float {
    fn cell() -> &'static LocalKey<Cell<*mut Tape<Self>>>;
    fn pool() -> &'static LocalKey<RefCell<Vec<Tape<Self>>>>;
}

impl TapeThreadLocal for f32 {
    fn cell() -> &'static LocalKey<Cell<*mut Tape<Self>>> {
        &TAPE_F32
    }
    fn pool() -> &'static LocalKey<RefCell<Vec<Tape<Self>>>> {
        &POOL_F32
    }
}

impl TapeThreadLocal for f64 {
    fn cell() -> &'static LocalKey<Cell<*mut Tape<Self>>> {
        &TAPE_F64
    }
    fn pool() -> &'static LocalKey<RefCell<Vec<Tape<Self>>>> {
        &POOL_F64
    }
}

/// Access the active tape for the current thread. Panics if no tape is active.
#[inline]
pub fn with_active_tape<F: TapeThreadLocal, R>(f: impl FnOnce(&mut Tape<F>) -> R) -> R {
    match try_with_active_tape(f) {
        Some(result) => result,
        None => panic!("No active tape. Activate one with nested_tape::TapeGuard."),
    }
}

/// Access the active tape for the current thread, if there is one.
#[inline]
pub fn try_with_active_tape<F: TapeThreadLocal, R>(f: impl FnOnce(&mut Tape<F>) -> R) -> Option<R> {
    F::cell().with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return None;
        }
        // SAFETY: TapeGuard keeps the pointer valid for as long as it is
        // installed, and the thread-local makes this the only live mutable
        // reference on this thread for the duration of the closure.
        let tape = unsafe { &mut *ptr };
        Some(f(tape))
    })
}

/// RAII guard that sets a tape as the thread-local active tape and restores
/// the previous one on drop.
pub struct TapeGuard<F: TapeThreadLocal> {
    prev: *mut Tape<F>,
}

impl<F: TapeThreadLocal> TapeGuard<F> {
    /// Activate `tape` as the thread-local tape. Returns a guard that restores
    /// the previous tape on drop.
    pub fn new(tape: &mut Tape<F>) -> Self {
        let prev = F::cell().with(|cell| {
            let prev = cell.get();
            cell.set(tape as *mut Tape<F>);
            prev
        });
        TapeGuard { prev }
    }
}

impl<F: TapeThreadLocal> Drop for TapeGuard<F> {
    fn drop(&mut self) {
        F::cell().with(|cell| {
            cell.set(self.prev);
        });
    }
}

/// Lend `f` an empty tape from this thread's pool.
///
/// The tape is reset and returned to the pool afterwards, so its node and
/// arena capacity is reused by the next caller on the same thread. The tape
/// is not activated; pair with [`TapeGuard`] to record on it.
pub fn with_pooled_tape<F: TapeThreadLocal, R>(f: impl FnOnce(&mut Tape<F>) -> R) -> R {
    let mut tape = F::pool()
        .with(|pool| pool.borrow_mut().pop())
        .unwrap_or_default();
    let result = f(&mut tape);
    tape.reset();
    F::pool().with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < MAX_POOLED_TAPES {
            pool.push(tape);
        }
    });
    result
}
