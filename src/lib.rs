//! Reverse-mode automatic differentiation on an arena-backed tape, with
//! nested recording sessions and a parallel map operator.
//!
//! Operations on [`Var`] handles record nodes on the thread's active
//! [`Tape`]. [`NestedSession`] bounds a region of the tape that can be
//! differentiated and discarded on its own. The `parallel_map` family
//! evaluates a function over an index range on a rayon pool, each worker on
//! its own tape, and splices one precomputed-gradient node per output back
//! into the caller's tape.
//!
//! ```
//! use nested_tape::{Tape, TapeGuard, Var};
//!
//! let mut tape = Tape::<f64>::new();
//! let _guard = TapeGuard::new(&mut tape);
//! let x = Var::variable(2.0);
//! let y = Var::variable(3.0);
//! let z = x * y + x.exp();
//! z.grad();
//! assert_eq!(y.adj(), 2.0);
//! assert!((x.adj() - (3.0 + 2.0f64.exp())).abs() < 1e-12);
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod float;
pub mod functions;
pub mod layout;
pub mod matrix;
pub mod nested;
pub mod node;
pub mod operands;
pub mod parallel_map;
pub mod scalar;
pub mod tape;
mod traits;
pub mod var;

pub use config::MapConfig;
pub use error::{Error, Result};
pub use float::Float;
pub use functions::{log_sum_exp, sum};
pub use layout::{BlockedLayout, Tile};
pub use matrix::Matrix;
pub use nested::NestedSession;
pub use node::CustomOp;
pub use operands::{count_vars, deep_copy_vars, save_adjoints, Operands};
pub use parallel_map::{
    map_values, map_values_2d, map_values_blocked, map_values_ranged, parallel_map,
    parallel_map_2d, parallel_map_blocked, parallel_map_ranged,
};
pub use scalar::Scalar;
pub use tape::{with_pooled_tape, Tape, TapeGuard, TapeStats, CONSTANT};
pub use var::Var;

/// Type alias for reverse-mode variables over `f64`.
pub type Var64 = Var<f64>;
/// Type alias for reverse-mode variables over `f32`.
pub type Var32 = Var<f32>;
