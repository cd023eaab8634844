//! Typed bump arena backing tape edges.
//!
//! Memory is handed out from fixed-capacity blocks. Allocations are never
//! freed individually and never move: a block is created with its final
//! capacity and only ever filled up to it, so an [`ArenaSlice`] stays valid
//! until the arena is rewound past it or reset. Requests larger than a block
//! get a dedicated block of their own.

/// Default block capacity, in elements.
pub const BLOCK_LEN: usize = 1 << 14;

/// Maximum number of emptied blocks kept around for reuse.
const MAX_SPARE_BLOCKS: usize = 4;

/// Handle to a contiguous allocation inside an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaSlice {
    block: u32,
    start: u32,
    len: u32,
}

impl ArenaSlice {
    /// The zero-length slice. Valid for every arena, including an empty one.
    pub const EMPTY: ArenaSlice = ArenaSlice {
        block: 0,
        start: 0,
        len: 0,
    };

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrow this handle to `[offset, offset + len)` without allocating.
    #[inline]
    pub fn sub(&self, offset: usize, len: usize) -> ArenaSlice {
        assert!(
            offset + len <= self.len as usize,
            "sub-slice {}..{} out of bounds for arena slice of length {}",
            offset,
            offset + len,
            self.len
        );
        if len == 0 {
            return ArenaSlice::EMPTY;
        }
        ArenaSlice {
            block: self.block,
            start: self.start + offset as u32,
            len: len as u32,
        }
    }
}

/// Position in an arena that [`Arena::rewind`] can return to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaMark {
    blocks: usize,
    tail_len: usize,
}

/// Typed bump allocator made of fixed-capacity blocks.
pub struct Arena<T> {
    blocks: Vec<Vec<T>>,
    spare: Vec<Vec<T>>,
    block_len: usize,
}

impl<T: Copy + Default> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default> Arena<T> {
    /// Create an empty arena with the default block capacity.
    pub fn new() -> Self {
        Self::with_block_len(BLOCK_LEN)
    }

    /// Create an empty arena whose blocks hold `block_len` elements.
    pub fn with_block_len(block_len: usize) -> Self {
        Arena {
            blocks: Vec::new(),
            spare: Vec::new(),
            block_len: block_len.max(1),
        }
    }

    /// Number of live elements across all blocks.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Vec::is_empty)
    }

    /// Element capacity currently owned by the arena, spare blocks included.
    pub fn capacity(&self) -> usize {
        self.blocks
            .iter()
            .chain(self.spare.iter())
            .map(Vec::capacity)
            .sum()
    }

    /// Number of blocks holding live allocations.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Allocate `len` default-initialised elements.
    pub fn alloc_default(&mut self, len: usize) -> ArenaSlice {
        if len == 0 {
            return ArenaSlice::EMPTY;
        }
        let block = self.block_with_room(len);
        let tail = &mut self.blocks[block];
        let start = tail.len();
        tail.resize(start + len, T::default());
        ArenaSlice {
            block: block as u32,
            start: start as u32,
            len: len as u32,
        }
    }

    /// Allocate a copy of `values`.
    pub fn alloc_copy(&mut self, values: &[T]) -> ArenaSlice {
        if values.is_empty() {
            return ArenaSlice::EMPTY;
        }
        let block = self.block_with_room(values.len());
        let tail = &mut self.blocks[block];
        let start = tail.len();
        tail.extend_from_slice(values);
        ArenaSlice {
            block: block as u32,
            start: start as u32,
            len: values.len() as u32,
        }
    }

    #[inline]
    pub fn get(&self, slice: ArenaSlice) -> &[T] {
        if slice.len == 0 {
            return &[];
        }
        let start = slice.start as usize;
        &self.blocks[slice.block as usize][start..start + slice.len as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, slice: ArenaSlice) -> &mut [T] {
        if slice.len == 0 {
            return &mut [];
        }
        let start = slice.start as usize;
        &mut self.blocks[slice.block as usize][start..start + slice.len as usize]
    }

    /// Current allocation position.
    pub fn mark(&self) -> ArenaMark {
        ArenaMark {
            blocks: self.blocks.len(),
            tail_len: self.blocks.last().map_or(0, Vec::len),
        }
    }

    /// Drop every allocation made after `mark`.
    ///
    /// Slices handed out after the mark become invalid. Emptied blocks are
    /// kept for reuse.
    pub fn rewind(&mut self, mark: ArenaMark) {
        assert!(
            mark.blocks <= self.blocks.len(),
            "arena rewind to a mark that is no longer live"
        );
        while self.blocks.len() > mark.blocks {
            if let Some(block) = self.blocks.pop() {
                self.recycle(block);
            }
        }
        if let Some(tail) = self.blocks.last_mut() {
            tail.truncate(mark.tail_len);
        }
    }

    /// Bulk-free every allocation. All outstanding slices become invalid.
    pub fn reset(&mut self) {
        while let Some(block) = self.blocks.pop() {
            self.recycle(block);
        }
    }

    fn recycle(&mut self, mut block: Vec<T>) {
        if self.spare.len() < MAX_SPARE_BLOCKS {
            block.clear();
            self.spare.push(block);
        }
    }

    /// Index of a block with room for `len` more elements, opening one if needed.
    fn block_with_room(&mut self, len: usize) -> usize {
        assert!(len <= u32::MAX as usize, "arena allocation of {} elements too large", len);
        if let Some(tail) = self.blocks.last() {
            if tail.capacity() - tail.len() >= len {
                return self.blocks.len() - 1;
            }
        }
        let reuse = self.spare.iter().position(|b| b.capacity() >= len);
        let block = match reuse {
            Some(pos) => self.spare.swap_remove(pos),
            None => Vec::with_capacity(len.max(self.block_len)),
        };
        assert!(
            self.blocks.len() < u32::MAX as usize,
            "arena block count overflow"
        );
        self.blocks.push(block);
        self.blocks.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_disjoint_and_stable() {
        let mut arena: Arena<u32> = Arena::with_block_len(4);
        let a = arena.alloc_copy(&[1, 2, 3]);
        let b = arena.alloc_copy(&[4, 5]);
        let c = arena.alloc_default(10);

        assert_eq!(arena.get(a), &[1, 2, 3]);
        assert_eq!(arena.get(b), &[4, 5]);
        assert_eq!(arena.get(c), &[0; 10]);
        assert_eq!(arena.len(), 15);
        // b did not fit behind a, c is oversized.
        assert_eq!(arena.num_blocks(), 3);
    }

    #[test]
    fn get_mut_writes_through() {
        let mut arena: Arena<f64> = Arena::new();
        let s = arena.alloc_default(3);
        arena.get_mut(s).copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(arena.get(s), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn sub_slices_view_parent_allocation() {
        let mut arena: Arena<u32> = Arena::new();
        let s = arena.alloc_copy(&[10, 11, 12, 13, 14, 15]);
        assert_eq!(arena.get(s.sub(2, 3)), &[12, 13, 14]);
        assert_eq!(arena.get(s.sub(6, 0)), &[] as &[u32]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn sub_slice_bounds_checked() {
        let mut arena: Arena<u32> = Arena::new();
        let s = arena.alloc_default(4);
        let _ = s.sub(3, 2);
    }

    #[test]
    fn empty_slice_on_empty_arena() {
        let mut arena: Arena<u32> = Arena::new();
        assert!(arena.get(ArenaSlice::EMPTY).is_empty());
        assert_eq!(arena.alloc_copy(&[]), ArenaSlice::EMPTY);
        assert_eq!(arena.num_blocks(), 0);
    }

    #[test]
    fn rewind_drops_later_allocations_only() {
        let mut arena: Arena<u32> = Arena::with_block_len(4);
        let keep = arena.alloc_copy(&[1, 2]);
        let mark = arena.mark();
        arena.alloc_copy(&[3, 4]);
        arena.alloc_copy(&[5, 6, 7, 8, 9]);
        assert_eq!(arena.len(), 9);

        arena.rewind(mark);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(keep), &[1, 2]);

        // Space behind the mark is handed out again.
        let again = arena.alloc_copy(&[42, 43]);
        assert_eq!(arena.get(again), &[42, 43]);
        assert_eq!(arena.num_blocks(), 1);
    }

    #[test]
    fn reset_keeps_capacity_for_reuse() {
        let mut arena: Arena<u32> = Arena::with_block_len(8);
        arena.alloc_default(8);
        arena.alloc_default(8);
        let cap = arena.capacity();
        arena.reset();
        assert!(arena.is_empty());
        assert_eq!(arena.capacity(), cap);
        arena.alloc_default(8);
        assert_eq!(arena.capacity(), cap);
    }
}
