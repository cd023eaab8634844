//! Parallel map over an index range or grid.
//!
//! Every entry point takes an *index* function that picks the operands for
//! one index (or one range/block) out of the shared arguments, and an
//! *apply* function that computes the result from those operands. The index
//! function must only select values: it runs on worker threads, and its
//! handles are read as parents on the caller's tape.
//!
//! The AD maps evaluate `apply` on pooled per-thread tapes inside a nested
//! session and splice one precomputed-gradient node per output into the
//! caller's active tape. For element-indexed maps, index 0 is sampled first
//! to learn how many tracked variables each index touches (its *width*);
//! parent and partial slots for all outputs are then allocated up front on
//! the caller's tape and handed to the workers as disjoint chunks, so the
//! spliced nodes point straight into them.
//!
//! All calls block until every tile has finished. A panic in a user function
//! propagates out of the call; an error stops the map and leaves `out`
//! untouched.

use rayon::prelude::*;

use crate::config::MapConfig;
use crate::error::{Error, Result};
use crate::layout::{BlockedLayout, Tile};
use crate::matrix::Matrix;
use crate::nested::NestedSession;
use crate::operands::{deep_copy_vars, Operands};
use crate::tape::{self, Tape, TapeGuard, TapeThreadLocal};
use crate::var::Var;

/// Gradient data produced by one tile of a ranged or blocked AD map.
struct TileGradient<F> {
    tile: Tile,
    /// Outer-tape parents shared by every output of the tile.
    parents: Vec<u32>,
    values: Vec<F>,
    /// `parents.len()` partials per output, output-major.
    partials: Vec<F>,
}

impl MapConfig {
    /// AD map over `0..out.len()`: `out[i] = apply(index(i, args))`.
    ///
    /// ```
    /// use nested_tape::{parallel_map, Tape, TapeGuard, Var};
    ///
    /// let mut tape = Tape::<f64>::new();
    /// let _guard = TapeGuard::new(&mut tape);
    /// let x: Vec<Var<f64>> = (0..8).map(|i| Var::variable(i as f64)).collect();
    ///
    /// let mut out = vec![Var::constant(0.0); x.len()];
    /// parallel_map(|xi: Var<f64>| xi * xi, |i, x: &Vec<Var<f64>>| x[i], &mut out, 2, &x).unwrap();
    ///
    /// out[3].grad();
    /// assert_eq!(x[3].adj(), 6.0);
    /// ```
    pub fn parallel_map<F, A, P, I, G>(
        &self,
        apply: G,
        index: I,
        out: &mut [Var<F>],
        grain: usize,
        args: &A,
    ) -> Result<()>
    where
        F: TapeThreadLocal,
        A: Sync + ?Sized,
        P: Operands<F>,
        I: Fn(usize, &A) -> P + Sync,
        G: Fn(P) -> Var<F> + Sync,
    {
        let layout = BlockedLayout::linear(out.len(), grain)?;
        self.map_cells(layout, |i, _| index(i, args), apply, out)
    }

    /// AD map over a grid: `out[(i, j)] = apply(index(i, j, args))`.
    pub fn parallel_map_2d<F, A, P, I, G>(
        &self,
        apply: G,
        index: I,
        out: &mut Matrix<Var<F>>,
        row_grain: usize,
        col_grain: usize,
        args: &A,
    ) -> Result<()>
    where
        F: TapeThreadLocal,
        A: Sync + ?Sized,
        P: Operands<F>,
        I: Fn(usize, usize, &A) -> P + Sync,
        G: Fn(P) -> Var<F> + Sync,
    {
        let layout = BlockedLayout::new(out.rows(), out.cols(), row_grain, col_grain)?;
        self.map_cells(layout, |i, j| index(i, j, args), apply, out.as_mut_slice())
    }

    /// AD map over ranges of at most `grain` indices:
    /// `out[start..start + len] = apply(index(start, len, args))`.
    ///
    /// Each range records its own width; every output of a range depends on
    /// all tracked variables picked for that range.
    pub fn parallel_map_ranged<F, A, P, I, G>(
        &self,
        apply: G,
        index: I,
        out: &mut [Var<F>],
        grain: usize,
        args: &A,
    ) -> Result<()>
    where
        F: TapeThreadLocal,
        A: Sync + ?Sized,
        P: Operands<F>,
        I: Fn(usize, usize, &A) -> P + Sync,
        G: Fn(P) -> Vec<Var<F>> + Sync,
    {
        let layout = BlockedLayout::linear(out.len(), grain)?;
        self.map_tiles(
            layout,
            |tile| index(tile.row_start, tile.rows, args),
            |operands, tile| {
                let ys = apply(operands);
                if ys.len() != tile.rows {
                    return Err(Error::LengthMismatch {
                        expected: tile.rows,
                        found: ys.len(),
                    });
                }
                Ok(ys)
            },
            out,
        )
    }

    /// AD map over blocks of at most `row_grain × col_grain` cells; `apply`
    /// returns the whole block.
    pub fn parallel_map_blocked<F, A, P, I, G>(
        &self,
        apply: G,
        index: I,
        out: &mut Matrix<Var<F>>,
        row_grain: usize,
        col_grain: usize,
        args: &A,
    ) -> Result<()>
    where
        F: TapeThreadLocal,
        A: Sync + ?Sized,
        P: Operands<F>,
        I: Fn(&Tile, &A) -> P + Sync,
        G: Fn(P) -> Matrix<Var<F>> + Sync,
    {
        let layout = BlockedLayout::new(out.rows(), out.cols(), row_grain, col_grain)?;
        self.map_tiles(
            layout,
            |tile| index(tile, args),
            |operands, tile| block_cells(apply(operands), tile),
            out.as_mut_slice(),
        )
    }

    /// Numeric map over `0..out.len()`. No tape is involved.
    pub fn map_values<T, A, P, I, G>(
        &self,
        apply: G,
        index: I,
        out: &mut [T],
        grain: usize,
        args: &A,
    ) -> Result<()>
    where
        T: Send,
        A: Sync + ?Sized,
        I: Fn(usize, &A) -> P + Sync,
        G: Fn(P) -> T + Sync,
    {
        let layout = BlockedLayout::linear(out.len(), grain)?;
        self.map_tile_values(
            layout,
            |tile| Ok(tile.cells().map(|(i, _)| apply(index(i, args))).collect()),
            out,
        )
    }

    /// Numeric map over a grid.
    pub fn map_values_2d<T, A, P, I, G>(
        &self,
        apply: G,
        index: I,
        out: &mut Matrix<T>,
        row_grain: usize,
        col_grain: usize,
        args: &A,
    ) -> Result<()>
    where
        T: Send,
        A: Sync + ?Sized,
        I: Fn(usize, usize, &A) -> P + Sync,
        G: Fn(P) -> T + Sync,
    {
        let layout = BlockedLayout::new(out.rows(), out.cols(), row_grain, col_grain)?;
        self.map_tile_values(
            layout,
            |tile| Ok(tile.cells().map(|(i, j)| apply(index(i, j, args))).collect()),
            out.as_mut_slice(),
        )
    }

    /// Numeric map over ranges; `apply` returns one value per index.
    pub fn map_values_ranged<T, A, P, I, G>(
        &self,
        apply: G,
        index: I,
        out: &mut [T],
        grain: usize,
        args: &A,
    ) -> Result<()>
    where
        T: Send,
        A: Sync + ?Sized,
        I: Fn(usize, usize, &A) -> P + Sync,
        G: Fn(P) -> Vec<T> + Sync,
    {
        let layout = BlockedLayout::linear(out.len(), grain)?;
        self.map_tile_values(
            layout,
            |tile| {
                let ys = apply(index(tile.row_start, tile.rows, args));
                if ys.len() != tile.rows {
                    return Err(Error::LengthMismatch {
                        expected: tile.rows,
                        found: ys.len(),
                    });
                }
                Ok(ys)
            },
            out,
        )
    }

    /// Numeric map over blocks; `apply` returns the whole block.
    pub fn map_values_blocked<T, A, P, I, G>(
        &self,
        apply: G,
        index: I,
        out: &mut Matrix<T>,
        row_grain: usize,
        col_grain: usize,
        args: &A,
    ) -> Result<()>
    where
        T: Send,
        A: Sync + ?Sized,
        I: Fn(&Tile, &A) -> P + Sync,
        G: Fn(P) -> Matrix<T> + Sync,
    {
        let layout = BlockedLayout::new(out.rows(), out.cols(), row_grain, col_grain)?;
        self.map_tile_values(
            layout,
            |tile| block_cells(apply(index(tile, args)), tile),
            out.as_mut_slice(),
        )
    }

    /// Element-indexed AD map. `out` is in column-major grid order.
    fn map_cells<F, P, I, G>(
        &self,
        layout: BlockedLayout,
        index: I,
        apply: G,
        out: &mut [Var<F>],
    ) -> Result<()>
    where
        F: TapeThreadLocal,
        P: Operands<F>,
        I: Fn(usize, usize) -> P + Sync,
        G: Fn(P) -> Var<F> + Sync,
    {
        let n = layout.len();
        if n == 0 {
            return Ok(());
        }
        let rows = layout.rows();
        let width = index(0, 0).count_vars();

        if width == 0 {
            tracing::debug!(n, "no tracked operands, mapping sequentially");
            let mut ys = Vec::with_capacity(n);
            for j in 0..layout.cols() {
                for i in 0..rows {
                    let operands = index(i, j);
                    self.verify_width(j * rows + i, 0, operands.count_vars())?;
                    ys.push(apply(operands));
                }
            }
            out.copy_from_slice(&ys);
            return Ok(());
        }

        tracing::debug!(n, width, tiles = layout.num_tiles(), "parallel map dispatch");
        let check_width = self.check_width;
        let mut values = vec![F::zero(); n];

        tape::with_active_tape(|outer: &mut Tape<F>| -> Result<()> {
            let mark = outer.mark();
            let (parents, partials) = outer.alloc_edge_slots(n * width);
            let run = {
                let (parent_slots, partial_slots) = outer.edge_slots_mut(parents, partials);
                let tasks: Vec<_> = layout
                    .split_mut(parent_slots, width)
                    .into_iter()
                    .zip(layout.split_mut(partial_slots, width))
                    .zip(layout.split_mut(&mut values, 1))
                    .map(|(((tile, p), (_, d)), (_, v))| (tile, p, d, v))
                    .collect();
                let (index, apply) = (&index, &apply);
                self.install(|| {
                    tasks
                        .into_par_iter()
                        .try_for_each(|(tile, tile_parents, tile_partials, tile_values)| {
                            run_tile(
                                &tile,
                                rows,
                                width,
                                check_width,
                                index,
                                apply,
                                tile_parents,
                                tile_partials,
                                tile_values,
                            )
                        })
                })
            };
            if let Err(err) = run {
                // Hand the unused slots back to the caller's arenas.
                outer.rewind(mark);
                return Err(err);
            }

            for tile in layout.tiles() {
                for (k, (i, j)) in tile.cells().enumerate() {
                    let cell = tile.offset + k;
                    let value = values[cell];
                    let node = outer.push_precomputed_slices(
                        value,
                        parents.sub(cell * width, width),
                        partials.sub(cell * width, width),
                    );
                    out[j * rows + i] = Var::from_tape(value, node);
                }
            }
            Ok(())
        })
    }

    /// Range/block-indexed AD map. `out` is in column-major grid order.
    fn map_tiles<F, P, I, G>(
        &self,
        layout: BlockedLayout,
        index: I,
        apply: G,
        out: &mut [Var<F>],
    ) -> Result<()>
    where
        F: TapeThreadLocal,
        P: Operands<F>,
        I: Fn(&Tile) -> P + Sync,
        G: Fn(P, &Tile) -> Result<Vec<Var<F>>> + Sync,
    {
        if layout.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            n = layout.len(),
            tiles = layout.num_tiles(),
            "ranged parallel map dispatch"
        );
        let tiles = layout.tiles();
        let results: Vec<TileGradient<F>> = self.install(|| {
            tiles
                .into_par_iter()
                .map(|tile| run_range(tile, &index, &apply))
                .collect::<Result<Vec<_>>>()
        })?;

        let rows = layout.rows();
        tape::with_active_tape(|outer: &mut Tape<F>| {
            for result in results {
                let width = result.parents.len();
                let cells = result.tile.cells().zip(&result.values);
                if width == 0 {
                    for ((i, j), &value) in cells {
                        out[j * rows + i] = Var::constant(value);
                    }
                    continue;
                }
                let (parents, partials) = outer.alloc_edges(&result.parents, &result.partials);
                for (k, ((i, j), &value)) in cells.enumerate() {
                    let node = outer.push_precomputed_slices(
                        value,
                        parents,
                        partials.sub(k * width, width),
                    );
                    out[j * rows + i] = Var::from_tape(value, node);
                }
            }
        });
        Ok(())
    }

    /// Numeric map: run each tile, then scatter into `out` (column-major grid
    /// order).
    fn map_tile_values<T, R>(&self, layout: BlockedLayout, run: R, out: &mut [T]) -> Result<()>
    where
        T: Send,
        R: Fn(&Tile) -> Result<Vec<T>> + Sync,
    {
        let tiles = layout.tiles();
        tracing::trace!(n = layout.len(), tiles = tiles.len(), "numeric map dispatch");
        let results: Vec<Vec<T>> =
            self.install(|| tiles.par_iter().map(&run).collect::<Result<Vec<_>>>())?;
        let rows = layout.rows();
        for (tile, values) in tiles.iter().zip(results) {
            for ((i, j), value) in tile.cells().zip(values) {
                out[j * rows + i] = value;
            }
        }
        Ok(())
    }

    fn verify_width(&self, index: usize, expected: usize, found: usize) -> Result<()> {
        if found == expected {
            return Ok(());
        }
        if self.check_width {
            return Err(Error::WidthMismatch {
                index,
                expected,
                found,
            });
        }
        panic!(
            "index {} touched {} tracked variables, but its slot holds {}",
            index, found, expected
        );
    }
}

/// Evaluate one tile of an element-indexed AD map on a pooled worker tape.
///
/// `parents` and `partials` hold `width` slots per cell of the tile, `values`
/// one slot per cell.
#[allow(clippy::too_many_arguments)]
fn run_tile<F, P, I, G>(
    tile: &Tile,
    rows: usize,
    width: usize,
    check_width: bool,
    index: &I,
    apply: &G,
    parents: &mut [u32],
    partials: &mut [F],
    values: &mut [F],
) -> Result<()>
where
    F: TapeThreadLocal,
    P: Operands<F>,
    I: Fn(usize, usize) -> P,
    G: Fn(P) -> Var<F>,
{
    tracing::trace!(row = tile.row_start, col = tile.col_start, cells = tile.len(), "tile start");
    tape::with_pooled_tape(|worker: &mut Tape<F>| {
        let _guard = TapeGuard::new(worker);
        let mut session = NestedSession::<F>::new();
        let mut leaves = vec![0u32; width];

        for (k, (i, j)) in tile.cells().enumerate() {
            let operands = index(i, j);
            let found = operands.count_vars();
            if found != width {
                if check_width {
                    return Err(Error::WidthMismatch {
                        index: j * rows + i,
                        expected: width,
                        found,
                    });
                }
                panic!(
                    "index {} touched {} tracked variables, but its slot holds {}",
                    j * rows + i,
                    found,
                    width
                );
            }
            let slot = k * width..(k + 1) * width;
            operands.save_indices(&mut parents[slot.clone()]);

            let local = deep_copy_vars(&operands);
            local.save_indices(&mut leaves);
            let y = apply(local);
            values[k] = y.value();

            session.grad(y);
            tape::with_active_tape(|t: &mut Tape<F>| {
                let adjoints = t.adjoints();
                for (d, &leaf) in partials[slot].iter_mut().zip(&leaves) {
                    *d = adjoints[leaf as usize];
                }
            });
            session.rewind();
        }
        Ok(())
    })
}

/// Evaluate one tile of a range/block-indexed AD map on a pooled worker tape.
fn run_range<F, P, I, G>(tile: Tile, index: &I, apply: &G) -> Result<TileGradient<F>>
where
    F: TapeThreadLocal,
    P: Operands<F>,
    I: Fn(&Tile) -> P,
    G: Fn(P, &Tile) -> Result<Vec<Var<F>>>,
{
    tracing::trace!(row = tile.row_start, col = tile.col_start, cells = tile.len(), "range start");
    tape::with_pooled_tape(|worker: &mut Tape<F>| {
        let _guard = TapeGuard::new(worker);
        let session = NestedSession::<F>::new();

        let operands = index(&tile);
        let width = operands.count_vars();
        let mut parents = vec![0u32; width];
        operands.save_indices(&mut parents);

        let local = deep_copy_vars(&operands);
        let mut leaves = vec![0u32; width];
        local.save_indices(&mut leaves);
        let ys = apply(local, &tile)?;

        let values: Vec<F> = ys.iter().map(Var::value).collect();
        let mut partials = vec![F::zero(); ys.len() * width];
        if width > 0 {
            for (&y, row) in ys.iter().zip(partials.chunks_mut(width)) {
                session.grad(y);
                tape::with_active_tape(|t: &mut Tape<F>| {
                    let adjoints = t.adjoints();
                    for (d, &leaf) in row.iter_mut().zip(&leaves) {
                        *d = adjoints[leaf as usize];
                    }
                });
            }
        }
        Ok(TileGradient {
            tile,
            parents,
            values,
            partials,
        })
    })
}

/// Check a block result against its tile and flatten it in cell order.
fn block_cells<T>(block: Matrix<T>, tile: &Tile) -> Result<Vec<T>> {
    if block.shape() != (tile.rows, tile.cols) {
        return Err(Error::ShapeMismatch {
            expected: (tile.rows, tile.cols),
            found: block.shape(),
        });
    }
    Ok(block.into_vec())
}

/// [`MapConfig::parallel_map`] with the default configuration.
pub fn parallel_map<F, A, P, I, G>(
    apply: G,
    index: I,
    out: &mut [Var<F>],
    grain: usize,
    args: &A,
) -> Result<()>
where
    F: TapeThreadLocal,
    A: Sync + ?Sized,
    P: Operands<F>,
    I: Fn(usize, &A) -> P + Sync,
    G: Fn(P) -> Var<F> + Sync,
{
    MapConfig::default().parallel_map(apply, index, out, grain, args)
}

/// [`MapConfig::parallel_map_2d`] with the default configuration.
pub fn parallel_map_2d<F, A, P, I, G>(
    apply: G,
    index: I,
    out: &mut Matrix<Var<F>>,
    row_grain: usize,
    col_grain: usize,
    args: &A,
) -> Result<()>
where
    F: TapeThreadLocal,
    A: Sync + ?Sized,
    P: Operands<F>,
    I: Fn(usize, usize, &A) -> P + Sync,
    G: Fn(P) -> Var<F> + Sync,
{
    MapConfig::default().parallel_map_2d(apply, index, out, row_grain, col_grain, args)
}

/// [`MapConfig::parallel_map_ranged`] with the default configuration.
pub fn parallel_map_ranged<F, A, P, I, G>(
    apply: G,
    index: I,
    out: &mut [Var<F>],
    grain: usize,
    args: &A,
) -> Result<()>
where
    F: TapeThreadLocal,
    A: Sync + ?Sized,
    P: Operands<F>,
    I: Fn(usize, usize, &A) -> P + Sync,
    G: Fn(P) -> Vec<Var<F>> + Sync,
{
    MapConfig::default().parallel_map_ranged(apply, index, out, grain, args)
}

/// [`MapConfig::parallel_map_blocked`] with the default configuration.
pub fn parallel_map_blocked<F, A, P, I, G>(
    apply: G,
    index: I,
    out: &mut Matrix<Var<F>>,
    row_grain: usize,
    col_grain: usize,
    args: &A,
) -> Result<()>
where
    F: TapeThreadLocal,
    A: Sync + ?Sized,
    P: Operands<F>,
    I: Fn(&Tile, &A) -> P + Sync,
    G: Fn(P) -> Matrix<Var<F>> + Sync,
{
    MapConfig::default().parallel_map_blocked(apply, index, out, row_grain, col_grain, args)
}

/// [`MapConfig::map_values`] with the default configuration.
pub fn map_values<T, A, P, I, G>(
    apply: G,
    index: I,
    out: &mut [T],
    grain: usize,
    args: &A,
) -> Result<()>
where
    T: Send,
    A: Sync + ?Sized,
    I: Fn(usize, &A) -> P + Sync,
    G: Fn(P) -> T + Sync,
{
    MapConfig::default().map_values(apply, index, out, grain, args)
}

/// [`MapConfig::map_values_2d`] with the default configuration.
pub fn map_values_2d<T, A, P, I, G>(
    apply: G,
    index: I,
    out: &mut Matrix<T>,
    row_grain: usize,
    col_grain: usize,
    args: &A,
) -> Result<()>
where
    T: Send,
    A: Sync + ?Sized,
    I: Fn(usize, usize, &A) -> P + Sync,
    G: Fn(P) -> T + Sync,
{
    MapConfig::default().map_values_2d(apply, index, out, row_grain, col_grain, args)
}

/// [`MapConfig::map_values_ranged`] with the default configuration.
pub fn map_values_ranged<T, A, P, I, G>(
    apply: G,
    index: I,
    out: &mut [T],
    grain: usize,
    args: &A,
) -> Result<()>
where
    T: Send,
    A: Sync + ?Sized,
    I: Fn(usize, usize, &A) -> P + Sync,
    G: Fn(P) -> Vec<T> + Sync,
{
    MapConfig::default().map_values_ranged(apply, index, out, grain, args)
}

/// [`MapConfig::map_values_blocked`] with the default configuration.
pub fn map_values_blocked<T, A, P, I, G>(
    apply: G,
    index: I,
    out: &mut Matrix<T>,
    row_grain: usize,
    col_grain: usize,
    args: &A,
) -> Result<()>
where
    T: Send,
    A: Sync + ?Sized,
    I: Fn(&Tile, &A) -> P + Sync,
    G: Fn(P) -> Matrix<T> + Sync,
{
    MapConfig::default().map_values_blocked(apply, index, out, row_grain, col_grain, args)
}

