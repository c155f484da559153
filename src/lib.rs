#![no_std]

//! A segregated-fit heap allocator over a single, growable, linear memory.
//!
//! The heap manages one contiguous byte region owned by a host, which can only
//! grow at the end. All metadata lives inside that region, and every address
//! is an offset into it, so the allocator needs no general-purpose memory
//! manager of its own.
//!
//! ## Basic Types
//!
//! ### [`Heap`](heap/struct.Heap.html)
//!
//! A `Heap` is a single-threaded allocator context: `allocate`, `free`,
//! `calloc` and `realloc`, returning `0` on failure. Free blocks are kept in
//! size-class [bins](bins/index.html), merged with their free neighbours as
//! soon as they are freed, and the heap grows when nothing fits.
//!
//! ### [`HeapGrower`](grow/trait.HeapGrower.html)
//!
//! `HeapGrower` is the host capability a heap is built on: the memory itself,
//! and a way to ask for more pages of it. [`ToyHeap`](grow/struct.ToyHeap.html)
//! implements it over a borrowed buffer.
//!
//! ### [`HeapReport`](report/struct.HeapReport.html)
//!
//! A fixed-layout snapshot of the heap's statistics, for hosts.
//!
//! ### [`SharedHeap`](sync/struct.SharedHeap.html)
//!
//! A `SharedHeap` wraps a `Heap` in a spin lock, for embeddings that call in
//! from more than one thread.

#[cfg(test)]
extern crate std;

pub mod bins;
pub mod block;
mod coalesce;
pub mod error;
pub mod grow;
pub mod heap;
pub mod report;
pub mod selftest;
pub mod sync;
#[cfg(target_arch = "wasm32")]
pub mod wasm;

pub use crate::block::NULL;
pub use crate::error::HeapError;
#[cfg(feature = "use_libc")]
pub use crate::grow::MmapMemory;
pub use crate::grow::{HeapGrower, ToyHeap, ToyHeapOverflowError};
pub use crate::heap::{BlockInfo, Heap};
pub use crate::report::{Census, HeapReport, Validity};
pub use crate::selftest::{run_self_test, Check};
pub use crate::sync::SharedHeap;
