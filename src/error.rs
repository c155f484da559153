use core::fmt;

/// Why a heap operation could not be carried out.
///
/// None of these ever escape the four allocation entry points, which turn
/// them into the null sentinel; they exist so the cause can be logged, and for
/// the `try_` variants of those entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// A zero-byte allocation was requested.
    ZeroSize,
    /// The requested size cannot be represented, e.g. `count * size` in
    /// `calloc` wrapped around.
    Overflow,
    /// No free block is large enough and the heap could not be grown.
    Exhausted,
    /// The host refused to grant more pages.
    GrowthDenied,
    /// The initial memory is too small to hold the guard and one block.
    TooSmall(usize),
    /// A page size or memory length is not a multiple of the alignment.
    Unaligned(usize),
    /// The address was never handed out by this heap.
    InvalidPointer(usize),
    /// The address refers to a block that is already free.
    DoubleFree(usize),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapError::ZeroSize => write!(f, "zero-sized allocation"),
            HeapError::Overflow => write!(f, "allocation size overflows"),
            HeapError::Exhausted => write!(f, "heap exhausted"),
            HeapError::GrowthDenied => write!(f, "host denied heap growth"),
            HeapError::TooSmall(len) => write!(f, "{} bytes is too small for a heap", len),
            HeapError::Unaligned(len) => write!(f, "{} is not a multiple of the alignment", len),
            HeapError::InvalidPointer(ptr) => write!(f, "{:#x} is not a heap address", ptr),
            HeapError::DoubleFree(ptr) => write!(f, "{:#x} is already free", ptr),
        }
    }
}
