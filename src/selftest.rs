//! A fixed script of heap operations that checks the allocator end to end.
//!
//! [`run_self_test`](fn.run_self_test.html) returns `0` when every check
//! passes, or the 1-based position of the first [`Check`](enum.Check.html) that
//! failed. Everything the script allocates is freed again before it returns,
//! whatever the outcome. Run against a fresh heap, the result is deterministic.

use core::fmt;

use log::{info, warn};

use crate::block::{HEADER_SIZE, NULL};
use crate::grow::HeapGrower;
use crate::heap::Heap;

/// The checks, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Check {
    /// A basic allocation returns writable memory.
    BasicAllocation = 1,
    /// Written data reads back unaltered.
    ReadBack = 2,
    /// Freeing and reallocating the same size returns the same address.
    BinReuse = 3,
    /// Freeing the middle of three free-flanked blocks leaves one block.
    Coalescing = 4,
    /// `calloc` zero-fills memory a previous tenant dirtied.
    ZeroFill = 5,
    /// Shrinking with `realloc` never moves the allocation.
    ShrinkInPlace = 6,
    /// Growing with `realloc` into a free neighbour never moves it.
    GrowInPlace = 7,
    /// The heap grows when nothing free is large enough.
    HeapGrowth = 8,
}

impl Check {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Check::BasicAllocation => "basic allocation",
            Check::ReadBack => "read back",
            Check::BinReuse => "bin reuse",
            Check::Coalescing => "sandwich coalescing",
            Check::ZeroFill => "calloc zero fill",
            Check::ShrinkInPlace => "realloc shrink in place",
            Check::GrowInPlace => "realloc grow in place",
            Check::HeapGrowth => "heap growth",
        };
        write!(f, "check {} ({})", self.code(), what)
    }
}

const MAX_LIVE: usize = 8;

// Tracks what the script has allocated, so an early return cannot leak it.
struct Script<'h, G: HeapGrower> {
    heap: &'h mut Heap<G>,
    live: [usize; MAX_LIVE],
}

impl<'h, G: HeapGrower> Drop for Script<'h, G> {
    fn drop(&mut self) {
        for ptr in self.live.iter_mut().filter(|p| **p != NULL) {
            self.heap.free(*ptr);
            *ptr = NULL;
        }
    }
}

impl<'h, G: HeapGrower> Script<'h, G> {
    fn new(heap: &'h mut Heap<G>) -> Self {
        Script {
            heap,
            live: [NULL; MAX_LIVE],
        }
    }

    fn track(&mut self, ptr: usize) {
        if let Some(slot) = self.live.iter_mut().find(|p| **p == NULL) {
            *slot = ptr;
        }
    }

    fn untrack(&mut self, ptr: usize) {
        if let Some(slot) = self.live.iter_mut().find(|p| **p == ptr) {
            *slot = NULL;
        }
    }

    fn alloc(&mut self, size: usize, check: Check) -> Result<usize, Check> {
        match self.heap.allocate(size) {
            NULL => Err(check),
            ptr => {
                self.track(ptr);
                Ok(ptr)
            }
        }
    }

    fn calloc(&mut self, size: usize, check: Check) -> Result<usize, Check> {
        match self.heap.calloc(1, size) {
            NULL => Err(check),
            ptr => {
                self.track(ptr);
                Ok(ptr)
            }
        }
    }

    fn realloc(&mut self, ptr: usize, size: usize, check: Check) -> Result<usize, Check> {
        match self.heap.realloc(ptr, size) {
            NULL => Err(check),
            moved => {
                self.untrack(ptr);
                self.track(moved);
                Ok(moved)
            }
        }
    }

    fn free(&mut self, ptr: usize) {
        self.untrack(ptr);
        self.heap.free(ptr);
    }

    fn fill(&mut self, ptr: usize, len: usize, pattern: u8, check: Check) -> Result<(), Check> {
        let payload = self.heap.payload_mut(ptr).ok_or(check)?;
        let bytes = payload.get_mut(..len).ok_or(check)?;
        for byte in bytes {
            *byte = pattern;
        }
        Ok(())
    }

    fn holds(&self, ptr: usize, len: usize, pattern: u8) -> bool {
        self.heap
            .payload(ptr)
            .and_then(|payload| payload.get(..len))
            .map_or(false, |bytes| bytes.iter().all(|&b| b == pattern))
    }

    fn basic_allocation(&mut self) -> Result<usize, Check> {
        let p = self.alloc(100, Check::BasicAllocation)?;
        self.fill(p, 100, 0x41, Check::BasicAllocation)?;
        Ok(p)
    }

    fn read_back(&mut self, p: usize) -> Result<(), Check> {
        // A neighbour written afterwards must not bleed into p.
        let q = self.alloc(64, Check::ReadBack)?;
        self.fill(q, 64, 0x5A, Check::ReadBack)?;
        if !self.holds(p, 100, 0x41) || !self.holds(q, 64, 0x5A) {
            return Err(Check::ReadBack);
        }
        self.free(q);
        self.free(p);
        Ok(())
    }

    fn bin_reuse(&mut self) -> Result<(), Check> {
        let p = self.alloc(600, Check::BinReuse)?;
        self.free(p);
        let again = self.alloc(600, Check::BinReuse)?;
        self.free(again);
        if again != p {
            return Err(Check::BinReuse);
        }
        Ok(())
    }

    fn coalescing(&mut self) -> Result<(), Check> {
        const SIZE: usize = 64;
        let a = self.alloc(SIZE, Check::Coalescing)?;
        let b = self.alloc(SIZE, Check::Coalescing)?;
        let c = self.alloc(SIZE, Check::Coalescing)?;
        let fence = self.alloc(SIZE, Check::Coalescing)?;
        if b != a + SIZE + HEADER_SIZE || c != b + SIZE + HEADER_SIZE {
            return Err(Check::Coalescing);
        }

        self.free(a);
        self.free(c);
        self.free(b);

        let merged = self
            .heap
            .block_containing(a - HEADER_SIZE)
            .ok_or(Check::Coalescing)?;
        self.free(fence);
        if merged.used || merged.header > a - HEADER_SIZE || merged.end() < c + SIZE {
            return Err(Check::Coalescing);
        }
        Ok(())
    }

    fn zero_fill(&mut self) -> Result<(), Check> {
        let p = self.alloc(256, Check::ZeroFill)?;
        self.fill(p, 256, 0xAB, Check::ZeroFill)?;
        self.free(p);

        let q = self.calloc(256, Check::ZeroFill)?;
        let zeroed = self
            .heap
            .payload(q)
            .map_or(false, |payload| payload.iter().all(|&b| b == 0));
        self.free(q);
        if !zeroed {
            return Err(Check::ZeroFill);
        }
        Ok(())
    }

    fn shrink_in_place(&mut self) -> Result<(), Check> {
        let p = self.alloc(256, Check::ShrinkInPlace)?;
        self.fill(p, 256, 0x66, Check::ShrinkInPlace)?;
        let q = self.realloc(p, 64, Check::ShrinkInPlace)?;
        let intact = self.holds(q, 64, 0x66);
        self.free(q);
        if q != p || !intact {
            return Err(Check::ShrinkInPlace);
        }
        Ok(())
    }

    fn grow_in_place(&mut self) -> Result<(), Check> {
        // Shrinking in front of a fence leaves a free block right behind p,
        // wherever p happens to be.
        let p = self.alloc(256, Check::GrowInPlace)?;
        let fence = self.alloc(16, Check::GrowInPlace)?;
        let p = self.realloc(p, 64, Check::GrowInPlace)?;
        self.fill(p, 64, 0x77, Check::GrowInPlace)?;

        let q = self.realloc(p, 200, Check::GrowInPlace)?;
        let intact = self.holds(q, 64, 0x77);
        self.free(q);
        self.free(fence);
        if q != p || !intact {
            return Err(Check::GrowInPlace);
        }
        Ok(())
    }

    fn heap_growth(&mut self) -> Result<(), Check> {
        let capacity = self.heap.capacity();
        let largest = self.heap.census().largest_free_block;

        let big = self.alloc(largest + 1, Check::HeapGrowth)?;
        if self.heap.capacity() <= capacity {
            return Err(Check::HeapGrowth);
        }
        self.fill(big, largest + 1, 0x11, Check::HeapGrowth)?;

        let small = self.alloc(32, Check::HeapGrowth)?;
        self.fill(small, 32, 0x22, Check::HeapGrowth)?;
        if !self.holds(big, largest + 1, 0x11) {
            return Err(Check::HeapGrowth);
        }
        self.free(small);
        self.free(big);
        Ok(())
    }
}

/// Run every check in order, stopping at the first failure.
pub fn run<G: HeapGrower>(heap: &mut Heap<G>) -> Result<(), Check> {
    let mut script = Script::new(heap);
    let p = script.basic_allocation()?;
    script.read_back(p)?;
    script.bin_reuse()?;
    script.coalescing()?;
    script.zero_fill()?;
    script.shrink_in_place()?;
    script.grow_in_place()?;
    script.heap_growth()?;
    Ok(())
}

/// Run the self-test, returning `0` on success or the failing check's code.
pub fn run_self_test<G: HeapGrower>(heap: &mut Heap<G>) -> u32 {
    match run(heap) {
        Ok(()) => {
            info!("heap self-test passed");
            0
        }
        Err(check) => {
            warn!("heap self-test failed at {}", check);
            check.code()
        }
    }
}
