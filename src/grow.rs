//! Growing the heap.
//!
//! ## [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the host to expand the heap. The heap never asks for memory any other way,
//! so it has no dependency on a particular host API.
//!
//! ## [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a borrowed buffer that can pretend to be a growable heap,
//! committing it a page at a time. It is mainly useful for testing, and for
//! embedders that want a fixed arena.
//!
//! ## `MmapMemory`
//!
//! With the `use_libc` feature, `MmapMemory` reserves a range of virtual
//! memory from a Unix OS up front and commits pages of it on request.

use core::fmt;

use log::{debug, warn};

use crate::block::{Block, HEADER_SIZE};
use crate::error::HeapError;
use crate::heap::Heap;

#[cfg(feature = "use_libc")]
use core::ptr::{null_mut, NonNull};
#[cfg(feature = "use_libc")]
use errno::Errno;

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}

/// The host capability the heap is built on: one contiguous region of bytes
/// that can only ever grow at the end.
pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Growth happens in whole pages of this many bytes. Must be a multiple of
    /// [`ALIGNMENT`](../block/constant.ALIGNMENT.html).
    fn page_size(&self) -> usize;

    /// All memory granted so far. Offset 0 of this slice is offset 0 of the
    /// heap.
    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];

    /// Grow the memory by `pages` pages, returning the new length in bytes.
    ///
    /// Existing bytes must keep their offsets and contents.
    fn grow_heap(&mut self, pages: usize) -> Result<usize, Self::Err>;
}

/// A growable heap carved out of a borrowed buffer.
#[derive(Default)]
pub struct ToyHeap<'a> {
    pub page_size: usize,
    /// Bytes committed so far.
    pub size: usize,
    /// Number of successful growths, for tests to observe.
    pub growths: usize,
    heap: &'a mut [u8],
}

impl<'a> ToyHeap<'a> {
    /// Use `heap` as the backing buffer, with `initial_pages` already
    /// committed (fewer if the buffer is smaller).
    pub fn new(heap: &'a mut [u8], page_size: usize, initial_pages: usize) -> Self {
        let whole_pages = heap.len() / page_size;
        ToyHeap {
            page_size,
            size: initial_pages.min(whole_pages) * page_size,
            growths: 0,
            heap,
        }
    }

    /// The most this heap can ever grow to.
    pub fn capacity(&self) -> usize {
        self.heap.len()
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for ToyHeapOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requested {} bytes, only {} left",
            self.requested, self.available
        )
    }
}

impl HeapGrower for ToyHeap<'_> {
    type Err = ToyHeapOverflowError;

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn memory(&self) -> &[u8] {
        &self.heap[..self.size]
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.heap[..self.size]
    }

    fn grow_heap(&mut self, pages: usize) -> Result<usize, Self::Err> {
        let available = self.heap.len() - self.size;
        let requested = pages.saturating_mul(self.page_size);
        if requested > available {
            return Err(ToyHeapOverflowError {
                requested,
                available,
            });
        }

        self.size += requested;
        self.growths += 1;
        Ok(self.size)
    }
}

/// Reserves address space with `mmap` and commits it a page at a time with
/// `mprotect`, so the heap can grow without ever moving.
#[cfg(feature = "use_libc")]
pub struct MmapMemory {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
    page_size: usize,
}

// The mapping is owned exclusively by this value.
#[cfg(feature = "use_libc")]
unsafe impl Send for MmapMemory {}

#[cfg(feature = "use_libc")]
impl MmapMemory {
    /// Reserve at least `max_bytes` of address space, committing
    /// `initial_pages` of it.
    pub fn reserve(max_bytes: usize, initial_pages: usize) -> Result<Self, Errno> {
        let page_size = sysconf::page::pagesize();
        let reserved = round_up(max_bytes.max(page_size), page_size).ok_or(Errno(libc::ENOMEM))?;

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                reserved,
                // Nothing is accessible until it is committed.
                libc::PROT_NONE,
                // MAP_ANON: We don't want a file descriptor, we're just going to
                //   use the memory.
                //
                // MAP_PRIVATE: We're not sharing this with any other process.
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;

        let mut memory = MmapMemory {
            base,
            reserved,
            committed: 0,
            page_size,
        };
        if initial_pages > 0 {
            memory.grow_heap(initial_pages)?;
        }
        Ok(memory)
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }
}

#[cfg(feature = "use_libc")]
impl HeapGrower for MmapMemory {
    type Err = Errno;

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn memory(&self) -> &[u8] {
        // The first `committed` bytes are mapped read/write for as long as
        // self lives.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.committed) }
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), self.committed) }
    }

    fn grow_heap(&mut self, pages: usize) -> Result<usize, Errno> {
        let bytes = pages
            .checked_mul(self.page_size)
            .ok_or(Errno(libc::ENOMEM))?;
        let new_len = self
            .committed
            .checked_add(bytes)
            .filter(|&len| len <= self.reserved)
            .ok_or(Errno(libc::ENOMEM))?;

        let rc = unsafe {
            libc::mprotect(
                self.base.as_ptr().add(self.committed) as *mut libc::c_void,
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(errno::errno());
        }

        self.committed = new_len;
        Ok(new_len)
    }
}

#[cfg(feature = "use_libc")]
impl Drop for MmapMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.reserved);
        }
    }
}

impl<G: HeapGrower> Heap<G> {
    /// Ask the host for enough pages that a block with `want` bytes of payload
    /// fits at the end of the heap.
    ///
    /// A free tail block counts toward the request. The new pages become one
    /// free block, merged with the tail if it was free, and filed in its bin.
    pub(crate) fn grow(&mut self, want: usize) -> Result<Block, HeapError> {
        let mem = self.grower.memory();
        let old_end = mem.len();
        let tail = Block::at(self.last);
        let have = if tail.is_used(mem) { 0 } else { tail.extent(mem) };
        let needed = want.checked_add(HEADER_SIZE).ok_or(HeapError::Overflow)?;
        let shortfall = needed.saturating_sub(have);

        let page_size = self.grower.page_size();
        let pages = round_up(shortfall, page_size).ok_or(HeapError::Overflow)? / page_size;
        debug!(
            "growing heap of {} bytes by {} pages for {} bytes ({} free at the tail)",
            old_end, pages, want, have
        );

        let new_end = match self.grower.grow_heap(pages) {
            Ok(end) => end,
            Err(err) => {
                warn!("host refused {} more pages: {:?}", pages, err);
                return Err(HeapError::GrowthDenied);
            }
        };
        if new_end < old_end + pages * page_size || new_end != self.grower.memory().len() {
            warn!("host reported an inconsistent heap end {}", new_end);
            return Err(HeapError::GrowthDenied);
        }

        let mem = self.grower.memory_mut();
        let block = Block::at(old_end);
        block.write_header(mem, new_end - old_end - HEADER_SIZE, false);
        block.set_prev(mem, Some(tail));
        self.last = block.header();

        let merged = self.coalesce(block);
        self.bins.insert(self.grower.memory_mut(), merged);
        Ok(merged)
    }
}
