//! Sharing one heap between threads.
//!
//! A [`Heap`](../heap/struct.Heap.html) never locks. An embedding that calls
//! into it from more than one thread has to serialize those calls itself;
//! `SharedHeap` does that with a spin lock, and can live in a `static`.

use spin::Mutex;

use crate::block::NULL;
use crate::error::HeapError;
use crate::grow::HeapGrower;
use crate::heap::Heap;
use crate::report::HeapReport;
use crate::selftest;

/// A heap behind a spin lock, created on first use.
pub struct SharedHeap<G> {
    heap: Mutex<Option<Heap<G>>>,
}

impl<G: HeapGrower + Default> Default for SharedHeap<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> SharedHeap<G> {
    pub const fn new() -> Self {
        SharedHeap {
            heap: Mutex::new(None),
        }
    }
}

impl<G: HeapGrower> SharedHeap<G> {
    /// Use `heap` from now on, returning the one it replaces.
    pub fn install(&self, heap: Heap<G>) -> Option<Heap<G>> {
        self.heap.lock().replace(heap)
    }

    /// Run `f` with exclusive access to the heap, if there is one.
    pub fn with<R, F: FnOnce(&mut Heap<G>) -> R>(&self, f: F) -> Option<R> {
        self.heap.lock().as_mut().map(f)
    }
}

impl<G: HeapGrower + Default> SharedHeap<G> {
    /// Run `f` with exclusive access to the heap, creating it from
    /// `G::default()` first if needed.
    pub fn with_or_init<R, F: FnOnce(&mut Heap<G>) -> R>(&self, f: F) -> Result<R, HeapError> {
        let mut guard = self.heap.lock();
        if guard.is_none() {
            *guard = Some(Heap::new(G::default())?);
        }
        match guard.as_mut() {
            Some(heap) => Ok(f(heap)),
            None => Err(HeapError::Exhausted),
        }
    }

    pub fn allocate(&self, size: usize) -> usize {
        self.with_or_init(|heap| heap.allocate(size))
            .unwrap_or(NULL)
    }

    pub fn free(&self, ptr: usize) {
        // Nothing can have been allocated from a heap that does not exist yet.
        self.with(|heap| heap.free(ptr));
    }

    pub fn calloc(&self, count: usize, size: usize) -> usize {
        self.with_or_init(|heap| heap.calloc(count, size))
            .unwrap_or(NULL)
    }

    pub fn realloc(&self, ptr: usize, new_size: usize) -> usize {
        self.with_or_init(|heap| heap.realloc(ptr, new_size))
            .unwrap_or(NULL)
    }

    /// Publish a fresh report and return its address, which stays the same
    /// for as long as the heap is installed.
    pub fn publish_report(&self) -> Option<*const HeapReport> {
        self.with_or_init(|heap| heap.publish_report() as *const HeapReport)
            .ok()
    }

    pub fn report(&self) -> HeapReport {
        self.with_or_init(|heap| heap.report()).unwrap_or_default()
    }

    /// Run the self-test, reporting a heap that cannot even be created as a
    /// failure of the first check.
    pub fn run_self_test(&self) -> u32 {
        self.with_or_init(|heap| selftest::run_self_test(heap))
            .unwrap_or_else(|_| selftest::Check::BasicAllocation.code())
    }
}
