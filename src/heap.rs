//! The allocator core.
//!
//! A [`Heap`](struct.Heap.html) owns a [`HeapGrower`](../grow/trait.HeapGrower.html)
//! and tiles its memory with blocks, from the guard at offset 0 to the very
//! last byte:
//!
//! ```text
//! | guard | block | block | block | ... | block |
//! 0       16                                    memory().len()
//! ```
//!
//! Addresses handed to callers are payload offsets into that memory. `0` is the
//! null sentinel and can never be a payload, since it lies in the guard.
//!
//! The heap performs no locking. Every entry point runs to completion before
//! the next may start; embedders with more than one thread must serialize
//! access themselves, e.g. through a [`SharedHeap`](../sync/struct.SharedHeap.html).

use core::fmt;

use log::{trace, warn};

use crate::bins::BinTable;
use crate::block::{
    payload_size, Block, Relation, ALIGNMENT, FIRST_BLOCK, GUARD_SIZE, HEADER_SIZE, MIN_BLOCK,
    NULL,
};
use crate::coalesce::absorb;
use crate::error::HeapError;
use crate::grow::{round_up, HeapGrower};
use crate::report::HeapReport;

/// A heap managing the memory of a single `HeapGrower`.
pub struct Heap<G> {
    pub grower: G,
    pub(crate) bins: BinTable,
    /// Header offset of the block that ends the heap.
    pub(crate) last: usize,
    // Snapshot handed out by `publish_report`, kept here so its address is
    // stable for as long as the heap is.
    pub(crate) published: HeapReport,
}

/// A physical block, as seen from outside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub header: usize,
    pub payload: usize,
    /// Payload capacity in bytes.
    pub size: usize,
    pub used: bool,
}

impl BlockInfo {
    /// One past the last byte of the payload.
    pub fn end(&self) -> usize {
        self.payload + self.size
    }

    /// Header plus payload.
    pub fn extent(&self) -> usize {
        HEADER_SIZE + self.size
    }
}

/// Walks the physical blocks from the base of the heap to its end.
///
/// The walk stops early, rather than reading out of bounds, if a header claims
/// more memory than there is.
pub struct Blocks<'m> {
    mem: &'m [u8],
    next: Option<Block>,
}

impl<'m> Iterator for Blocks<'m> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.next.take()?;
        if block.header() + HEADER_SIZE > self.mem.len() || block.end(self.mem) > self.mem.len() {
            return None;
        }

        self.next = block.next(self.mem);
        Some(BlockInfo {
            header: block.header(),
            payload: block.payload(),
            size: block.size(self.mem),
            used: block.is_used(self.mem),
        })
    }
}

impl<G: HeapGrower> Heap<G> {
    /// Take over the memory of `grower`, turning all of it (past the guard)
    /// into a single free block.
    ///
    /// If the grower has not granted enough memory for the guard and one
    /// minimum block, it is asked for more first.
    pub fn new(mut grower: G) -> Result<Self, HeapError> {
        let page_size = grower.page_size();
        if page_size == 0 || page_size % ALIGNMENT != 0 {
            return Err(HeapError::Unaligned(page_size));
        }

        let len = grower.memory().len();
        if len < GUARD_SIZE + MIN_BLOCK {
            let missing = round_up(GUARD_SIZE + MIN_BLOCK - len, page_size)
                .ok_or(HeapError::Overflow)?;
            if let Err(err) = grower.grow_heap(missing / page_size) {
                warn!("could not get initial heap pages: {:?}", err);
                return Err(HeapError::GrowthDenied);
            }
        }

        let mem = grower.memory_mut();
        let len = mem.len();
        if len < GUARD_SIZE + MIN_BLOCK {
            return Err(HeapError::TooSmall(len));
        }
        if len % ALIGNMENT != 0 {
            return Err(HeapError::Unaligned(len));
        }

        for byte in &mut mem[..GUARD_SIZE] {
            *byte = 0;
        }
        let first = Block::at(FIRST_BLOCK);
        first.write_header(mem, len - FIRST_BLOCK - HEADER_SIZE, false);
        first.set_prev(mem, None);

        let mut bins = BinTable::default();
        bins.insert(mem, first);
        trace!("new heap of {} bytes", len);

        Ok(Heap {
            grower,
            bins,
            last: FIRST_BLOCK,
            published: HeapReport::default(),
        })
    }

    /// Current size of the managed memory, guard included.
    pub fn capacity(&self) -> usize {
        self.grower.memory().len()
    }

    /// Raw view of the whole heap.
    pub fn memory(&self) -> &[u8] {
        self.grower.memory()
    }

    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            mem: self.grower.memory(),
            next: Some(Block::at(FIRST_BLOCK)),
        }
    }

    /// The block whose header or payload covers `offset`.
    pub fn block_containing(&self, offset: usize) -> Option<BlockInfo> {
        self.blocks()
            .find(|b| b.header <= offset && offset < b.end())
    }

    /// Resolve a caller-supplied address to the live block it belongs to.
    ///
    /// The header in front of `ptr` must claim an aligned size that stays in
    /// bounds, and its predecessor link must point at a block ending exactly
    /// where this one starts.
    fn used_block(&self, ptr: usize) -> Result<Block, HeapError> {
        let mem = self.grower.memory();
        let block = Block::from_payload(ptr)
            .filter(|b| b.payload() <= mem.len().saturating_sub(HEADER_SIZE))
            .ok_or(HeapError::InvalidPointer(ptr))?;

        let size = block.size(mem);
        let linked = match block.prev(mem) {
            None => block.header() == FIRST_BLOCK,
            Some(prev) => {
                prev.header() >= FIRST_BLOCK
                    && prev.header() < block.header()
                    && prev.header() % ALIGNMENT == 0
                    && prev.relation(block, mem) == Relation::AdjacentBefore
            }
        };
        if !linked || size % ALIGNMENT != 0 || block.end(mem) > mem.len() {
            return Err(HeapError::InvalidPointer(ptr));
        }
        if !block.is_used(mem) {
            return Err(HeapError::DoubleFree(ptr));
        }
        Ok(block)
    }

    /// The payload of a live allocation.
    pub fn payload(&self, ptr: usize) -> Option<&[u8]> {
        let block = self.used_block(ptr).ok()?;
        Some(block.payload_slice(self.grower.memory()))
    }

    pub fn payload_mut(&mut self, ptr: usize) -> Option<&mut [u8]> {
        let block = self.used_block(ptr).ok()?;
        Some(block.payload_slice_mut(self.grower.memory_mut()))
    }

    /// Trim a live block down to `want` bytes of payload, if what is left over
    /// can stand as a block of its own. The leftover is merged forward and
    /// filed in its bin.
    fn split(&mut self, block: Block, want: usize) {
        let mem = self.grower.memory_mut();
        let size = block.size(mem);
        if size < want + MIN_BLOCK {
            return;
        }

        let rest = Block::at(block.payload() + want);
        block.set_size(mem, want);
        rest.write_header(mem, size - want - HEADER_SIZE, false);
        rest.set_prev(mem, Some(block));
        match rest.next(mem) {
            Some(next) => next.set_prev(mem, Some(rest)),
            None => self.last = rest.header(),
        }
        trace!(
            "split {} into {} + {}",
            block.header(),
            want,
            size - want - HEADER_SIZE
        );

        let rest = self.coalesce(rest);
        self.bins.insert(self.grower.memory_mut(), rest);
    }

    ////////////////////////////////////////////////////////////
    // Entry points

    /// Allocate `size` bytes, returning the payload address or `0`.
    pub fn allocate(&mut self, size: usize) -> usize {
        self.try_allocate(size).unwrap_or_else(|err| {
            trace!("allocate({}) failed: {}", size, err);
            NULL
        })
    }

    pub fn try_allocate(&mut self, size: usize) -> Result<usize, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let want = payload_size(size).ok_or(HeapError::Overflow)?;

        let block = match self.bins.find_suitable(self.grower.memory(), want) {
            Some(block) => block,
            None => {
                self.grow(want).map_err(|err| match err {
                    HeapError::GrowthDenied => HeapError::Exhausted,
                    err => err,
                })?;
                self.bins
                    .find_suitable(self.grower.memory(), want)
                    .ok_or(HeapError::Exhausted)?
            }
        };

        let mem = self.grower.memory_mut();
        self.bins.remove(mem, block);
        block.set_used(mem, true);
        self.split(block, want);

        trace!("allocate({}) -> {:#x}", size, block.payload());
        Ok(block.payload())
    }

    /// Return an allocation to the heap. `free(0)` does nothing; so does
    /// freeing an address the heap does not recognise as live, apart from
    /// logging a warning.
    pub fn free(&mut self, ptr: usize) {
        if let Err(err) = self.try_free(ptr) {
            warn!("free({:#x}) ignored: {}", ptr, err);
        }
    }

    pub fn try_free(&mut self, ptr: usize) -> Result<(), HeapError> {
        if ptr == NULL {
            return Ok(());
        }
        let block = self.used_block(ptr)?;
        block.set_used(self.grower.memory_mut(), false);
        trace!("free({:#x})", ptr);

        let merged = self.coalesce(block);
        self.bins.insert(self.grower.memory_mut(), merged);
        Ok(())
    }

    /// Allocate a zero-filled array of `count` elements of `size` bytes.
    pub fn calloc(&mut self, count: usize, size: usize) -> usize {
        self.try_calloc(count, size).unwrap_or_else(|err| {
            trace!("calloc({}, {}) failed: {}", count, size, err);
            NULL
        })
    }

    pub fn try_calloc(&mut self, count: usize, size: usize) -> Result<usize, HeapError> {
        let total = count.checked_mul(size).ok_or(HeapError::Overflow)?;
        let ptr = self.try_allocate(total)?;
        // The whole payload, not just `total`: nothing of a previous tenant may
        // show through.
        for byte in Block::at(ptr - HEADER_SIZE).payload_slice_mut(self.grower.memory_mut()) {
            *byte = 0;
        }
        Ok(ptr)
    }

    /// Resize an allocation, moving it only when it cannot grow in place.
    ///
    /// `realloc(0, n)` is `allocate(n)`; `realloc(p, 0)` frees `p` and returns
    /// `0`. On failure the original allocation is untouched.
    pub fn realloc(&mut self, ptr: usize, new_size: usize) -> usize {
        self.try_realloc(ptr, new_size).unwrap_or_else(|err| {
            trace!("realloc({:#x}, {}) failed: {}", ptr, new_size, err);
            NULL
        })
    }

    pub fn try_realloc(&mut self, ptr: usize, new_size: usize) -> Result<usize, HeapError> {
        if ptr == NULL {
            return self.try_allocate(new_size);
        }
        if new_size == 0 {
            self.try_free(ptr)?;
            return Ok(NULL);
        }

        let block = self.used_block(ptr)?;
        let want = payload_size(new_size).ok_or(HeapError::Overflow)?;
        let mem = self.grower.memory_mut();
        let size = block.size(mem);

        if want <= size {
            self.split(block, want);
            trace!("realloc({:#x}, {}) shrunk in place", ptr, new_size);
            return Ok(ptr);
        }

        let absorbable = block
            .next(mem)
            .filter(|next| !next.is_used(mem) && size + next.extent(mem) >= want);
        if let Some(next) = absorbable {
            self.bins.remove(mem, next);
            absorb(mem, &mut self.last, block, next);
            self.split(block, want);
            trace!("realloc({:#x}, {}) grew in place", ptr, new_size);
            return Ok(ptr);
        }

        let moved = self.try_allocate(new_size)?;
        self.grower
            .memory_mut()
            .copy_within(ptr..ptr + size, moved);
        self.try_free(ptr)?;
        trace!("realloc({:#x}, {}) moved to {:#x}", ptr, new_size, moved);
        Ok(moved)
    }
}

impl<G: HeapGrower> fmt::Display for Heap<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Heap(")?;
        let mut start = true;
        for block in self.blocks() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let state = if block.used { "Used" } else { "Free" };
            write!(f, "{}({}, {})", state, block.header, block.size)?;
        }

        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::vec;
    use std::vec::Vec;
    use test_env_log::test;

    use crate::block::{write_word, WORD};
    use crate::grow::ToyHeap;

    const PAGE: usize = 4096;

    fn live(heap: &Heap<ToyHeap>) -> Vec<BlockInfo> {
        heap.blocks().filter(|b| b.used).collect()
    }

    #[test]
    fn test_basic() {
        let mut buf = vec![0u8; 16 * PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();

        const BLOCKS: usize = 3;
        let sizes: [usize; BLOCKS] = [64, 64, 224];

        let mut pointers = [NULL; BLOCKS];
        for (i, &size) in sizes.iter().enumerate() {
            pointers[i] = heap.allocate(size);
            assert!(heap.validate().is_valid());
        }

        // Carved front to back from the one initial block.
        assert_eq!(pointers[0], FIRST_BLOCK + HEADER_SIZE);
        for i in 0..BLOCKS - 1 {
            assert_eq!(pointers[i + 1], pointers[i] + sizes[i] + HEADER_SIZE);
        }
        log::info!("allocated: {}", heap);

        ////////////////////////////////////////////////////////////
        // Deallocation

        heap.free(pointers[1]);
        assert!(heap.validate().is_valid());
        let freed = heap.block_containing(pointers[1]).unwrap();
        assert!(!freed.used);
        assert_eq!(freed.size, 64);
        log::info!("freed: {}", heap);

        ////////////////////////////////////////////////////////////
        // Allocation with a free block in the bins

        // Too big for the hole: comes from the tail.
        let p112 = heap.allocate(112);
        assert_eq!(p112, pointers[2] + 224 + HEADER_SIZE);

        // 32 bytes fit in the hole, and leave a 16-byte remainder behind.
        let p32 = heap.allocate(32);
        assert_eq!(p32, pointers[1]);
        let rest = heap.block_containing(p32 + 32).unwrap();
        assert!(!rest.used);
        assert_eq!(rest.size, 16);

        // 8 bytes round up to the minimum payload and take the remainder.
        let p8 = heap.allocate(8);
        assert_eq!(p8, rest.payload);
        assert!(heap.validate().is_valid());
        log::info!("done: {}", heap);
    }

    #[test]
    fn test_zero_size_and_null_free() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let before = heap.census();

        assert_eq!(heap.try_allocate(0), Err(HeapError::ZeroSize));
        assert_eq!(heap.allocate(0), NULL);
        heap.free(NULL);
        assert_eq!(heap.try_free(NULL), Ok(()));
        assert_eq!(heap.census(), before);
    }

    #[test]
    fn test_free_rejects_foreign_and_double_free() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let a = heap.allocate(64);
        let b = heap.allocate(64);

        assert_eq!(heap.try_free(a + 16), Err(HeapError::InvalidPointer(a + 16)));
        assert_eq!(heap.try_free(a + 3), Err(HeapError::InvalidPointer(a + 3)));
        assert_eq!(heap.try_free(PAGE * 2), Err(HeapError::InvalidPointer(PAGE * 2)));
        assert_eq!(heap.try_free(HEADER_SIZE), Err(HeapError::InvalidPointer(HEADER_SIZE)));
        // Addresses at the very top of the address space, as a host's
        // wrapped-around offset would be.
        let top = usize::MAX & !(ALIGNMENT - 1);
        assert_eq!(heap.try_free(top), Err(HeapError::InvalidPointer(top)));
        assert_eq!(heap.try_realloc(top, 64), Err(HeapError::InvalidPointer(top)));
        assert!(heap.payload(top).is_none());
        heap.free(top);

        assert_eq!(heap.try_free(a), Ok(()));
        assert_eq!(heap.try_free(a), Err(HeapError::DoubleFree(a)));
        heap.free(a);
        assert!(heap.validate().is_valid());
        assert!(heap.payload(b).is_some());
        assert!(heap.payload(a).is_none());
    }

    #[test]
    fn test_free_rejects_forged_predecessor() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let a = heap.allocate(64);
        let _b = heap.allocate(64);
        let c = heap.allocate(64);

        // Point c back at a, which ends well before c starts.
        let header = c - HEADER_SIZE;
        write_word(heap.grower.memory_mut(), header + WORD, a - HEADER_SIZE);
        assert_eq!(heap.try_free(c), Err(HeapError::InvalidPointer(c)));
        assert!(heap.payload(c).is_none());

        write_word(heap.grower.memory_mut(), header + WORD, c - HEADER_SIZE - 80);
        assert_eq!(heap.try_free(c), Ok(()));
        assert!(heap.validate().is_valid());
    }

    #[test]
    fn test_calloc_zeroes_reused_memory() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let fence = heap.allocate(16);
        let p = heap.allocate(100);
        let _after = heap.allocate(16);
        for byte in heap.payload_mut(p).unwrap() {
            *byte = 0xAB;
        }
        heap.free(p);

        let q = heap.calloc(10, 10);
        assert_eq!(q, p);
        assert!(heap.payload(q).unwrap().iter().all(|&b| b == 0));
        assert_ne!(fence, NULL);
    }

    #[test]
    fn test_calloc_overflow() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        assert_eq!(heap.try_calloc(usize::MAX, 2), Err(HeapError::Overflow));
        assert_eq!(heap.calloc(1 << (usize::BITS - 1), 4), NULL);
        assert_eq!(heap.calloc(0, 4), NULL);
    }

    #[test]
    fn test_realloc_null_and_zero() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();

        let p = heap.realloc(NULL, 40);
        assert_eq!(p, FIRST_BLOCK + HEADER_SIZE);
        assert_eq!(heap.realloc(p, 0), NULL);
        assert_eq!(live(&heap).len(), 0);
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn test_realloc_shrinks_in_place() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let p = heap.allocate(256);
        let fence = heap.allocate(16);
        for (i, byte) in heap.payload_mut(p).unwrap().iter_mut().enumerate() {
            *byte = i as u8;
        }

        assert_eq!(heap.realloc(p, 64), p);
        let payload = heap.payload(p).unwrap();
        assert_eq!(payload.len(), 64);
        assert!(payload.iter().enumerate().all(|(i, &b)| b == i as u8));

        let rest = heap.block_containing(p + 64).unwrap();
        assert!(!rest.used);
        assert_eq!(rest.extent(), 256 - 64);
        assert_eq!(rest.end(), fence - HEADER_SIZE);

        // Less than a minimum block of slack: nothing to split off.
        assert_eq!(heap.realloc(p, 60), p);
        assert_eq!(heap.payload(p).unwrap().len(), 64);
        assert!(heap.validate().is_valid());
    }

    #[test]
    fn test_realloc_grows_into_free_neighbour() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let p = heap.allocate(64);
        let q = heap.allocate(128);
        let _fence = heap.allocate(16);
        for byte in heap.payload_mut(p).unwrap() {
            *byte = 7;
        }
        heap.free(q);

        assert_eq!(heap.realloc(p, 150), p);
        let payload = heap.payload(p).unwrap();
        assert_eq!(payload.len(), 160);
        assert!(payload[..64].iter().all(|&b| b == 7));
        // 64 + 16 + 128 = 208 bytes available, 160 taken: 48 left, split off.
        let rest = heap.block_containing(p + 160).unwrap();
        assert!(!rest.used);
        assert_eq!(rest.size, 32);
        assert!(heap.validate().is_valid());
    }

    #[test]
    fn test_realloc_moves_when_boxed_in() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let p = heap.allocate(32);
        let _fence = heap.allocate(16);
        for byte in heap.payload_mut(p).unwrap() {
            *byte = 0x33;
        }

        let q = heap.realloc(p, 500);
        assert_ne!(q, NULL);
        assert_ne!(q, p);
        assert!(heap.payload(q).unwrap()[..32].iter().all(|&b| b == 0x33));
        assert!(heap.payload(p).is_none());
        assert!(heap.validate().is_valid());
    }

    #[test]
    fn test_realloc_failure_keeps_original() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let p = heap.allocate(32);
        for byte in heap.payload_mut(p).unwrap() {
            *byte = 9;
        }

        assert_eq!(heap.try_realloc(p, 2 * PAGE), Err(HeapError::Exhausted));
        assert!(heap.payload(p).unwrap().iter().all(|&b| b == 9));
        assert!(heap.validate().is_valid());
    }

    #[test]
    fn test_initial_growth() {
        let mut buf = vec![0u8; 4 * PAGE];
        let heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 0)).unwrap();
        assert_eq!(heap.capacity(), PAGE);
        assert_eq!(heap.blocks().count(), 1);

        let mut tiny = vec![0u8; 16];
        assert_eq!(
            Heap::new(ToyHeap::new(&mut tiny, 16, 1)).err(),
            Some(HeapError::GrowthDenied)
        );
        let mut odd = vec![0u8; 100];
        assert_eq!(
            Heap::new(ToyHeap::new(&mut odd, 50, 2)).err(),
            Some(HeapError::Unaligned(50))
        );
    }
}
