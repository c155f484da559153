//! Merging physically adjacent free blocks.
//!
//! Every free block is merged with its free neighbours before it enters a bin,
//! so no two free blocks are ever adjacent. That keeps the merge local: a newly
//! freed block has at most one free block on either side, and one pass over
//! predecessor and successor leaves nothing more to merge.

use log::debug;

use crate::block::{Block, Relation, HEADER_SIZE};
use crate::grow::HeapGrower;
use crate::heap::Heap;

/// Grow `left` over `right`, which must start exactly where `left` ends.
///
/// `right`'s header becomes part of `left`'s payload, and the block after
/// `right` (if any) is relinked to `left`. Neither block may be in a bin.
pub(crate) fn absorb(mem: &mut [u8], last: &mut usize, left: Block, right: Block) {
    debug_assert_eq!(left.relation(right, mem), Relation::AdjacentBefore);
    let size = left.size(mem) + HEADER_SIZE + right.size(mem);
    left.set_size(mem, size);
    match left.next(mem) {
        Some(after) => after.set_prev(mem, Some(left)),
        None => *last = left.header(),
    }
}

impl<G: HeapGrower> Heap<G> {
    /// Merge a free block that is not in any bin with its free neighbours.
    ///
    /// Returns the merged block, which starts at the predecessor if that was
    /// free. The caller files it in a bin.
    pub(crate) fn coalesce(&mut self, block: Block) -> Block {
        let mem = self.grower.memory_mut();
        debug_assert!(!block.is_used(mem));
        let mut merged = block;

        if let Some(next) = block.next(mem).filter(|b| !b.is_used(mem)) {
            self.bins.remove(mem, next);
            absorb(mem, &mut self.last, merged, next);
            debug!("merged {} into {}", next.header(), merged.header());
        }

        if let Some(prev) = block.prev(mem).filter(|b| !b.is_used(mem)) {
            self.bins.remove(mem, prev);
            absorb(mem, &mut self.last, prev, merged);
            debug!("merged {} into {}", merged.header(), prev.header());
            merged = prev;
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use std::vec;
    use test_env_log::test;

    use crate::block::{FIRST_BLOCK, HEADER_SIZE};
    use crate::grow::ToyHeap;
    use crate::heap::Heap;

    const PAGE: usize = 4096;

    #[test]
    fn test_merge_with_successor() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let a = heap.allocate(64);
        let b = heap.allocate(64);
        let _fence = heap.allocate(64);

        heap.free(b);
        heap.free(a);
        let merged = heap.block_containing(a).unwrap();
        assert!(!merged.used);
        assert_eq!(merged.payload, a);
        assert_eq!(merged.size, 64 + HEADER_SIZE + 64);
        assert!(heap.validate().is_valid());
    }

    #[test]
    fn test_merge_with_predecessor() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let a = heap.allocate(64);
        let b = heap.allocate(64);
        let _fence = heap.allocate(64);

        heap.free(a);
        heap.free(b);
        let merged = heap.block_containing(b).unwrap();
        assert_eq!(merged.payload, a);
        assert_eq!(merged.size, 64 + HEADER_SIZE + 64);
        assert!(heap.validate().is_valid());
    }

    #[test]
    fn test_sandwich() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let a = heap.allocate(48);
        let b = heap.allocate(80);
        let c = heap.allocate(112);
        let _fence = heap.allocate(16);
        let free_before = heap.census().free_blocks;

        heap.free(a);
        heap.free(c);
        assert_eq!(heap.census().free_blocks, free_before + 2);
        heap.free(b);

        let census = heap.census();
        assert_eq!(census.free_blocks, free_before + 1);
        let merged = heap.block_containing(b).unwrap();
        assert!(!merged.used);
        assert_eq!(merged.header, FIRST_BLOCK);
        assert_eq!(merged.size, 48 + 80 + 112 + 2 * HEADER_SIZE);
        assert!(heap.validate().is_valid());
    }

    #[test]
    fn test_everything_merges_back() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let pointers = [
            heap.allocate(10),
            heap.allocate(200),
            heap.allocate(33),
            heap.allocate(1000),
        ];
        for &i in &[2, 0, 3, 1] {
            heap.free(pointers[i]);
        }

        let only = heap.blocks().collect::<std::vec::Vec<_>>();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].extent(), PAGE - FIRST_BLOCK);
        assert_eq!(heap.last, FIRST_BLOCK);
        assert!(heap.validate().is_valid());
    }
}
