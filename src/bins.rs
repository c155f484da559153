//! Segregated free lists.
//!
//! Free blocks are filed into one of [`NUM_BINS`](constant.NUM_BINS.html)
//! doubly linked lists by the size of their payload. Class `b` holds payloads
//! whose size, divided by 16, has a bit length of `b`; the last class takes
//! everything larger. Lists are LIFO: a freshly freed block is the first one
//! offered back.

use log::trace;

use crate::block::{Block, ALIGNMENT, FIRST_BLOCK, MIN_BLOCK, NULL};

pub const NUM_BINS: usize = 32;

/// The class a payload of `size` bytes is filed under.
pub fn bin_index(size: usize) -> usize {
    let bits = (usize::BITS - (size >> 4).leading_zeros()) as usize;
    bits.min(NUM_BINS - 1)
}

/// The heads of every free list, as header offsets (`NULL` for empty).
///
/// It maintains a few invariants, checked by
/// [`Heap::validate`](../heap/struct.Heap.html#method.validate):
///
/// - Every block in bin `b` is free and has `bin_index(size) == b`.
/// - Every free block is in exactly one bin.
/// - `next_free` / `prev_free` links are mutually consistent.
pub struct BinTable {
    heads: [usize; NUM_BINS],
}

impl Default for BinTable {
    fn default() -> Self {
        BinTable {
            heads: [NULL; NUM_BINS],
        }
    }
}

/// Walks one bin, refusing to follow links that leave the heap.
pub struct BinIter<'m> {
    mem: &'m [u8],
    next: usize,
    // Every block in the heap takes at least MIN_BLOCK bytes, so a longer walk
    // means the links form a cycle.
    remaining: usize,
}

impl<'m> Iterator for BinIter<'m> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.next == NULL || self.remaining == 0 {
            return None;
        }
        let offset = self.next;
        if offset < FIRST_BLOCK
            || offset % ALIGNMENT != 0
            || offset.saturating_add(MIN_BLOCK) > self.mem.len()
        {
            debug_assert!(false, "free list link {} is outside the heap", offset);
            self.next = NULL;
            return None;
        }
        let block = Block::at(offset);
        self.next = block.next_free(self.mem).map(Block::header).unwrap_or(NULL);
        self.remaining -= 1;
        Some(block)
    }
}

impl BinTable {
    fn head(&self, bin: usize) -> Option<Block> {
        match self.heads[bin] {
            NULL => None,
            offset => Some(Block::at(offset)),
        }
    }

    /// Push a free block onto the front of the list for its size.
    ///
    /// The block's size must not change while it is in a bin; remove it first.
    pub fn insert(&mut self, mem: &mut [u8], block: Block) {
        let bin = bin_index(block.size(mem));
        let head = self.head(bin);
        trace!(
            "bin {}: insert {} ({} bytes)",
            bin,
            block.header(),
            block.size(mem)
        );

        block.set_prev_free(mem, None);
        block.set_next_free(mem, head);
        if let Some(head) = head {
            head.set_prev_free(mem, Some(block));
        }
        self.heads[bin] = block.header();
    }

    /// Unlink a block from whichever list currently holds it.
    pub fn remove(&mut self, mem: &mut [u8], block: Block) {
        let prev = block.prev_free(mem);
        let next = block.next_free(mem);
        trace!("bin {}: remove {}", bin_index(block.size(mem)), block.header());

        match prev {
            Some(prev) => prev.set_next_free(mem, next),
            None => {
                let bin = bin_index(block.size(mem));
                debug_assert_eq!(self.heads[bin], block.header());
                self.heads[bin] = next.map(Block::header).unwrap_or(NULL);
            }
        }
        if let Some(next) = next {
            next.set_prev_free(mem, prev);
        }

        block.set_prev_free(mem, None);
        block.set_next_free(mem, None);
    }

    /// Find a free block with at least `size` bytes of payload.
    ///
    /// The class of `size` is searched first, front to back, then every larger
    /// class. The block is left in its bin.
    pub fn find_suitable(&self, mem: &[u8], size: usize) -> Option<Block> {
        (bin_index(size)..NUM_BINS)
            .find_map(|bin| self.iter_bin(mem, bin).find(|b| b.size(mem) >= size))
    }

    pub fn iter_bin<'m>(&self, mem: &'m [u8], bin: usize) -> BinIter<'m> {
        BinIter {
            mem,
            next: self.heads[bin],
            remaining: mem.len() / MIN_BLOCK,
        }
    }

    /// Every binned block, paired with the class it was found in.
    pub fn iter<'m>(&'m self, mem: &'m [u8]) -> impl Iterator<Item = (usize, Block)> + 'm {
        (0..NUM_BINS).flat_map(move |bin| self.iter_bin(mem, bin).map(move |b| (bin, b)))
    }

    #[cfg(test)]
    pub(crate) fn len(&self, mem: &[u8]) -> usize {
        self.iter(mem).count()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.heads.iter().all(|&head| head == NULL)
    }
}
