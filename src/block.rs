//! Block headers, and the size arithmetic shared by the rest of the heap.
//!
//! Every block lives at a byte offset into the memory exposed by a
//! [`HeapGrower`](../grow/trait.HeapGrower.html), and is laid out as:
//!
//! ```text
//! header                          payload
//! | size | USED | prev header    | next_free | prev_free | ...        |
//! |<-------- HEADER_SIZE -------->|<------------- size --------------->|
//! ```
//!
//! The free-list links only exist while the block is free; once it is handed
//! out, the whole payload belongs to the caller.

use core::ops::Range;

use static_assertions::const_assert;

/// Size of a metadata word; the header stores native `usize` values.
pub const WORD: usize = core::mem::size_of::<usize>();

/// We align every header, payload and payload size to 16 bytes.
pub const ALIGNMENT: usize = 16;

/// Headers are given a full alignment unit, even on targets where two words
/// would fit in less.
pub const HEADER_SIZE: usize = 16;
const_assert!(2 * WORD <= HEADER_SIZE);
const_assert!(HEADER_SIZE % ALIGNMENT == 0);

/// A free payload must be able to hold its two bin links.
pub const MIN_PAYLOAD: usize = 16;
const_assert!(2 * WORD <= MIN_PAYLOAD);

/// The smallest extent (header plus payload) a block can have. A block is only
/// split when the leftover is at least this large.
pub const MIN_BLOCK: usize = HEADER_SIZE + MIN_PAYLOAD;

/// Offset 0 is never handed out: the first alignment unit is a guard, so that 0
/// can mean both "null" to callers and "no link" inside metadata.
pub const GUARD_SIZE: usize = ALIGNMENT;

/// Header offset of the first block in every heap.
pub const FIRST_BLOCK: usize = GUARD_SIZE;

/// The null sentinel address.
pub const NULL: usize = 0;

// Payload sizes are multiples of 16, so the low bit is free for the flag.
const USED: usize = 1;
const_assert!(USED < ALIGNMENT);

/// Round `value` up to the next multiple of `ALIGNMENT`, or `None` on overflow.
pub fn align_up(value: usize) -> Option<usize> {
    value
        .checked_add(ALIGNMENT - 1)
        .map(|v| v & !(ALIGNMENT - 1))
}

/// The payload size a request for `request` bytes occupies.
pub fn payload_size(request: usize) -> Option<usize> {
    align_up(request).map(|size| size.max(MIN_PAYLOAD))
}

pub(crate) fn read_word(mem: &[u8], offset: usize) -> usize {
    let mut bytes = [0u8; WORD];
    bytes.copy_from_slice(&mem[offset..offset + WORD]);
    usize::from_ne_bytes(bytes)
}

pub(crate) fn write_word(mem: &mut [u8], offset: usize, value: usize) {
    mem[offset..offset + WORD].copy_from_slice(&value.to_ne_bytes());
}

fn link(offset: usize) -> Option<Block> {
    if offset == NULL {
        None
    } else {
        Some(Block::at(offset))
    }
}

fn unlink(block: Option<Block>) -> usize {
    block.map(Block::header).unwrap_or(NULL)
}

/// An enum for easy comparison of blocks and their order
#[derive(Debug, PartialEq, Eq)]
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A handle to a block: just the offset of its header.
///
/// A `Block` does not borrow the memory it describes, so every accessor takes
/// the memory slice explicitly. The handle is only meaningful while the header
/// at that offset is intact; the heap is responsible for never keeping a handle
/// to a block that was absorbed by a neighbour.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Block {
    header: usize,
}

impl Block {
    pub const fn at(header: usize) -> Block {
        Block { header }
    }

    /// Recover the block from the payload address handed to a caller.
    ///
    /// Returns `None` for addresses that cannot have a header in front of them.
    /// This does not check the header itself.
    pub fn from_payload(payload: usize) -> Option<Block> {
        if payload < FIRST_BLOCK + HEADER_SIZE || payload % ALIGNMENT != 0 {
            return None;
        }
        Some(Block::at(payload - HEADER_SIZE))
    }

    pub fn header(self) -> usize {
        self.header
    }

    pub fn payload(self) -> usize {
        self.header + HEADER_SIZE
    }

    /// The payload capacity of the block, in bytes.
    pub fn size(self, mem: &[u8]) -> usize {
        read_word(mem, self.header) & !USED
    }

    /// Header plus payload.
    pub fn extent(self, mem: &[u8]) -> usize {
        HEADER_SIZE + self.size(mem)
    }

    pub fn is_used(self, mem: &[u8]) -> bool {
        read_word(mem, self.header) & USED != 0
    }

    /// Offset one past the last payload byte; the header of the physical
    /// successor if there is one.
    pub fn end(self, mem: &[u8]) -> usize {
        self.payload().saturating_add(self.size(mem))
    }

    /// The memory covered by this block, header included.
    pub fn as_range(self, mem: &[u8]) -> Range<usize> {
        self.header..self.end(mem)
    }

    /// The payload as a slice.
    pub fn payload_slice(self, mem: &[u8]) -> &[u8] {
        &mem[self.payload()..self.end(mem)]
    }

    pub fn payload_slice_mut(self, mem: &mut [u8]) -> &mut [u8] {
        let end = self.end(mem);
        &mut mem[self.payload()..end]
    }

    /// Write a complete size word, leaving the predecessor link alone.
    pub fn write_header(self, mem: &mut [u8], size: usize, used: bool) {
        debug_assert!(size % ALIGNMENT == 0, "unaligned block size {}", size);
        write_word(mem, self.header, size | if used { USED } else { 0 });
    }

    pub fn set_size(self, mem: &mut [u8], size: usize) {
        let used = self.is_used(mem);
        self.write_header(mem, size, used);
    }

    pub fn set_used(self, mem: &mut [u8], used: bool) {
        let size = self.size(mem);
        self.write_header(mem, size, used);
    }

    /// The physical predecessor, or `None` for the first block.
    pub fn prev(self, mem: &[u8]) -> Option<Block> {
        link(read_word(mem, self.header + WORD))
    }

    pub fn set_prev(self, mem: &mut [u8], prev: Option<Block>) {
        write_word(mem, self.header + WORD, unlink(prev));
    }

    /// The physical successor, or `None` if this block ends the heap.
    pub fn next(self, mem: &[u8]) -> Option<Block> {
        let end = self.end(mem);
        if end < mem.len() {
            Some(Block::at(end))
        } else {
            None
        }
    }

    /// Next block in the same bin. Only meaningful while free.
    pub fn next_free(self, mem: &[u8]) -> Option<Block> {
        link(read_word(mem, self.payload()))
    }

    /// Previous block in the same bin. Only meaningful while free.
    pub fn prev_free(self, mem: &[u8]) -> Option<Block> {
        link(read_word(mem, self.payload() + WORD))
    }

    pub fn set_next_free(self, mem: &mut [u8], next: Option<Block>) {
        write_word(mem, self.payload(), unlink(next));
    }

    pub fn set_prev_free(self, mem: &mut [u8], prev: Option<Block>) {
        write_word(mem, self.payload() + WORD, unlink(prev));
    }

    /// Compare two blocks to see how they are ordered.
    pub fn relation(self, other: Block, mem: &[u8]) -> Relation {
        let self_range = self.as_range(mem);
        let other_range = other.as_range(mem);

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}
