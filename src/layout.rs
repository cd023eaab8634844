//! Blocked index arithmetic for the parallel map.
//!
//! A `rows × cols` grid is cut into tiles of at most `row_grain × col_grain`
//! cells. Cells are numbered tile after tile (tiles in column-major order
//! over the tile grid), column-major inside each tile, so every tile owns one
//! contiguous run of cell numbers. Per-cell buffers laid out this way split
//! into disjoint `&mut` chunks, one per tile, with no further bookkeeping.
//!
//! A 1-D range of length `n` is the `n × 1` grid; its cell numbering is the
//! identity.

use crate::error::{Error, Result};

/// One rectangular tile of a [`BlockedLayout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tile {
    pub row_start: usize,
    pub rows: usize,
    pub col_start: usize,
    pub cols: usize,
    /// Number of the tile's first cell.
    pub offset: usize,
}

impl Tile {
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grid coordinates of the tile's cells, in cell-number order.
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> {
        let Tile {
            row_start,
            rows,
            col_start,
            cols,
            ..
        } = *self;
        (col_start..col_start + cols)
            .flat_map(move |j| (row_start..row_start + rows).map(move |i| (i, j)))
    }
}

/// Partition of a `rows × cols` grid into tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockedLayout {
    rows: usize,
    cols: usize,
    row_grain: usize,
    col_grain: usize,
}

impl BlockedLayout {
    pub fn new(rows: usize, cols: usize, row_grain: usize, col_grain: usize) -> Result<Self> {
        if row_grain == 0 || col_grain == 0 {
            return Err(Error::ZeroGrainSize);
        }
        Ok(BlockedLayout {
            rows,
            cols,
            row_grain,
            col_grain,
        })
    }

    /// Ranges of at most `grain` indices over `0..len`.
    pub fn linear(len: usize, grain: usize) -> Result<Self> {
        Self::new(len, 1, grain, 1)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row_tiles(&self) -> usize {
        self.rows.div_ceil(self.row_grain)
    }

    fn col_tiles(&self) -> usize {
        self.cols.div_ceil(self.col_grain)
    }

    pub fn num_tiles(&self) -> usize {
        self.row_tiles() * self.col_tiles()
    }

    /// Tiles in cell-number order.
    pub fn tiles(&self) -> Vec<Tile> {
        let mut tiles = Vec::with_capacity(self.num_tiles());
        let mut offset = 0;
        for tc in 0..self.col_tiles() {
            let col_start = tc * self.col_grain;
            let cols = self.col_grain.min(self.cols - col_start);
            for tr in 0..self.row_tiles() {
                let row_start = tr * self.row_grain;
                let rows = self.row_grain.min(self.rows - row_start);
                tiles.push(Tile {
                    row_start,
                    rows,
                    col_start,
                    cols,
                    offset,
                });
                offset += rows * cols;
            }
        }
        tiles
    }

    /// Cell number of grid position `(i, j)`.
    pub fn cell_offset(&self, i: usize, j: usize) -> usize {
        assert!(
            i < self.rows && j < self.cols,
            "cell ({}, {}) out of bounds for {}x{} layout",
            i,
            j,
            self.rows,
            self.cols
        );
        let row_start = i / self.row_grain * self.row_grain;
        let col_start = j / self.col_grain * self.col_grain;
        let tile_rows = self.row_grain.min(self.rows - row_start);
        let tile_cols = self.col_grain.min(self.cols - col_start);
        // Full tile columns to the left, then tiles above in this tile column.
        self.rows * col_start
            + row_start * tile_cols
            + (j - col_start) * tile_rows
            + (i - row_start)
    }

    /// Split a buffer holding `width` entries per cell (cell-number order)
    /// into one disjoint chunk per tile.
    pub fn split_mut<'a, T>(&self, buf: &'a mut [T], width: usize) -> Vec<(Tile, &'a mut [T])> {
        assert_eq!(
            buf.len(),
            self.len() * width,
            "buffer does not hold {} entries for each of {} cells",
            width,
            self.len()
        );
        let mut rest = buf;
        let mut chunks = Vec::with_capacity(self.num_tiles());
        for tile in self.tiles() {
            let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(tile.len() * width);
            chunks.push((tile, chunk));
            rest = tail;
        }
        chunks
    }
}
