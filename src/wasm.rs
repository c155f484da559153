//! C-ABI entry points for a WebAssembly host.
//!
//! The heap covers linear memory from `__heap_base` (as placed by the linker)
//! to the current end of memory, and grows with `memory.grow`. Addresses
//! crossing this boundary are absolute linear-memory addresses; `0` is the
//! null sentinel on both sides.

use core::arch::wasm32;

use crate::block::{align_up, NULL};
use crate::grow::HeapGrower;
use crate::report::HeapReport;
use crate::sync::SharedHeap;

/// WebAssembly pages are always 64 KiB.
pub const WASM_PAGE: usize = 64 * 1024;

extern "C" {
    static __heap_base: u8;
}

#[derive(Debug)]
pub struct MemoryGrowFailed;

/// Linear memory past `__heap_base`.
pub struct WasmMemory {
    base: usize,
}

impl Default for WasmMemory {
    fn default() -> Self {
        let base = unsafe { core::ptr::addr_of!(__heap_base) as usize };
        WasmMemory {
            base: align_up(base).unwrap_or(base),
        }
    }
}

impl WasmMemory {
    fn len(&self) -> usize {
        (wasm32::memory_size(0) * WASM_PAGE).saturating_sub(self.base)
    }

    fn to_address(&self, offset: usize) -> usize {
        match offset {
            NULL => NULL,
            offset => self.base + offset,
        }
    }

    fn to_offset(&self, address: usize) -> usize {
        match address {
            NULL => NULL,
            // Anything below the heap lands far outside it, and is rejected.
            address => address.wrapping_sub(self.base),
        }
    }
}

impl HeapGrower for WasmMemory {
    type Err = MemoryGrowFailed;

    fn page_size(&self) -> usize {
        WASM_PAGE
    }

    fn memory(&self) -> &[u8] {
        // Everything from the heap base to the end of linear memory belongs to
        // the heap; nothing else is placed there.
        unsafe { core::slice::from_raw_parts(self.base as *const u8, self.len()) }
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.base as *mut u8, self.len()) }
    }

    fn grow_heap(&mut self, pages: usize) -> Result<usize, MemoryGrowFailed> {
        if wasm32::memory_grow(0, pages) == usize::MAX {
            return Err(MemoryGrowFailed);
        }
        Ok(self.len())
    }
}

static HEAP: SharedHeap<WasmMemory> = SharedHeap::new();

fn memory() -> WasmMemory {
    WasmMemory::default()
}

#[no_mangle]
pub extern "C" fn allocate(size: usize) -> usize {
    memory().to_address(HEAP.allocate(size))
}

#[no_mangle]
pub extern "C" fn free(address: usize) {
    HEAP.free(memory().to_offset(address));
}

#[no_mangle]
pub extern "C" fn calloc(count: usize, size: usize) -> usize {
    memory().to_address(HEAP.calloc(count, size))
}

#[no_mangle]
pub extern "C" fn realloc(address: usize, new_size: usize) -> usize {
    let memory = memory();
    memory.to_address(HEAP.realloc(memory.to_offset(address), new_size))
}

/// Address of the seven-field report, refreshed by this call.
#[no_mangle]
pub extern "C" fn get_heap_report() -> *const HeapReport {
    HEAP.publish_report().unwrap_or(core::ptr::null())
}

#[no_mangle]
pub extern "C" fn run_self_test() -> u32 {
    HEAP.run_self_test()
}
