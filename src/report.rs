//! Heap statistics, and verification of the heap's invariants.
//!
//! Nothing here mutates allocator state: every figure is recomputed from a walk
//! over the physical blocks (and, for [`Validity`](struct.Validity.html), the
//! bins), so it always reflects the most recent allocation, free or merge.

use core::convert::TryFrom;

use static_assertions::const_assert_eq;

use crate::bins::bin_index;
use crate::block::{Block, FIRST_BLOCK, GUARD_SIZE};
use crate::grow::HeapGrower;
use crate::heap::Heap;

/// Aggregate figures for a heap, at full width.
///
/// Byte counts include headers, so `used_bytes + free_bytes == total_size`.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Census {
    /// Managed bytes: everything but the guard.
    pub total_size: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Extent of the largest free block, header included. Requests of up to
    /// `largest_free_block - HEADER_SIZE` bytes are served without growing.
    pub largest_free_block: usize,
}

impl Census {
    /// How much of the free memory is unusable for one large request, as a
    /// percentage: `100 * (1 - largest / free)`, over block extents.
    pub fn fragmentation(&self) -> u32 {
        if self.free_bytes == 0 {
            return 0;
        }
        let largest = self.largest_free_block as u128;
        100 - (largest * 100 / self.free_bytes as u128) as u32
    }
}

/// The fixed seven-field record published to hosts.
///
/// Fields are 32 bits wide regardless of the target, and saturate. Byte
/// counts, `largest_free_block` included, cover headers as well as payloads,
/// so `fragmentation` can be recomputed from the other fields as
/// `100 - largest_free_block * 100 / free_bytes`.
#[repr(C)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapReport {
    pub total_size: u32,
    pub used_bytes: u32,
    pub free_bytes: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub largest_free_block: u32,
    pub fragmentation: u32,
}
const_assert_eq!(core::mem::size_of::<HeapReport>(), 7 * 4);

fn saturate(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

impl From<Census> for HeapReport {
    fn from(census: Census) -> Self {
        HeapReport {
            total_size: saturate(census.total_size),
            used_bytes: saturate(census.used_bytes),
            free_bytes: saturate(census.free_bytes),
            total_blocks: saturate(census.total_blocks),
            free_blocks: saturate(census.free_blocks),
            largest_free_block: saturate(census.largest_free_block),
            fragmentation: census.fragmentation(),
        }
    }
}

impl HeapReport {
    /// The fields in layout order.
    pub fn to_words(&self) -> [u32; 7] {
        [
            self.total_size,
            self.used_bytes,
            self.free_bytes,
            self.total_blocks,
            self.free_blocks,
            self.largest_free_block,
            self.fragmentation,
        ]
    }
}

/// Validity contains a representation of all invalid states found in a heap.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks claiming memory past the end of the heap, or a block walk that
    /// does not finish exactly at the end.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,

    /// Blocks whose predecessor link does not name the block physically
    /// before them.
    pub broken_links: usize,

    /// Number of free blocks directly adjacent to another free block, and not
    /// merged. This shouldn't happen, but isn't totally corrupt.
    pub adjacents: usize,

    /// Free blocks that no bin holds.
    pub unbinned: usize,

    /// Bin entries that are in use, filed under the wrong class, or whose
    /// back link is wrong.
    pub misbinned: usize,

    /// The heap's record of its last block disagrees with the walk.
    pub bad_tail: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.broken_links == 0
            && self.adjacents == 0
            && self.unbinned == 0
            && self.misbinned == 0
            && self.bad_tail == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

impl<G: HeapGrower> Heap<G> {
    pub fn census(&self) -> Census {
        let mut census = Census {
            total_size: self.capacity().saturating_sub(GUARD_SIZE),
            ..Census::default()
        };

        for block in self.blocks() {
            census.total_blocks += 1;
            if block.used {
                census.used_blocks += 1;
                census.used_bytes += block.extent();
            } else {
                census.free_blocks += 1;
                census.free_bytes += block.extent();
                census.largest_free_block = census.largest_free_block.max(block.extent());
            }
        }

        census
    }

    /// A snapshot in the host-facing layout.
    pub fn report(&self) -> HeapReport {
        self.census().into()
    }

    /// Refresh the snapshot kept inside the heap and return it. The reference
    /// always points at the same place for the lifetime of the heap.
    pub fn publish_report(&mut self) -> &HeapReport {
        self.published = self.report();
        &self.published
    }

    /// Check the block layout and the bins against each other.
    pub fn validate(&self) -> Validity {
        let mut validity = Validity::default();
        let mem = self.grower.memory();

        let mut previous: Option<crate::heap::BlockInfo> = None;
        let mut free_blocks = 0;
        for block in self.blocks() {
            let expected_prev = previous.map(|p| Block::at(p.header));
            if Block::at(block.header).prev(mem) != expected_prev {
                validity.broken_links += 1;
            }
            if let Some(previous) = previous {
                if !previous.used && !block.used {
                    validity.adjacents += 1;
                }
            }
            if !block.used {
                free_blocks += 1;
            }
            previous = Some(block);
        }

        match previous {
            Some(last) => {
                if last.end() != mem.len() {
                    validity.overlaps += 1;
                }
                if last.header != self.last {
                    validity.bad_tail += 1;
                }
            }
            None => validity.overlaps += 1,
        }

        let mut binned = 0;
        let mut previous_in_bin: Option<(usize, Block)> = None;
        for (bin, block) in self.bins.iter(mem) {
            binned += 1;
            if block.header() < FIRST_BLOCK
                || block.is_used(mem)
                || bin_index(block.size(mem)) != bin
            {
                validity.misbinned += 1;
            }
            let expected = previous_in_bin
                .filter(|&(previous_bin, _)| previous_bin == bin)
                .map(|(_, previous)| previous);
            if block.prev_free(mem) != expected {
                validity.misbinned += 1;
            }
            previous_in_bin = Some((bin, block));
        }
        validity.unbinned = free_blocks - core::cmp::min(free_blocks, binned);
        if binned > free_blocks {
            validity.misbinned += binned - free_blocks;
        }

        validity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::vec;
    use test_env_log::test;

    use crate::block::{write_word, HEADER_SIZE, NULL};
    use crate::grow::ToyHeap;

    const PAGE: usize = 4096;

    #[test]
    fn test_fresh_heap_report() {
        let mut buf = vec![0u8; PAGE];
        let heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let report = heap.report();
        assert_eq!(
            report.to_words(),
            [
                (PAGE - GUARD_SIZE) as u32,
                0,
                (PAGE - GUARD_SIZE) as u32,
                1,
                1,
                (PAGE - GUARD_SIZE) as u32,
                0
            ]
        );
    }

    #[test]
    fn test_conservation_and_counts() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let a = heap.allocate(100);
        let _b = heap.allocate(200);
        let c = heap.allocate(300);
        let _d = heap.allocate(16);
        heap.free(a);
        heap.free(c);

        let census = heap.census();
        assert_eq!(census.used_bytes + census.free_bytes, census.total_size);
        assert_eq!(census.used_blocks + census.free_blocks, census.total_blocks);
        assert_eq!(census.total_blocks, 5);
        assert_eq!(census.free_blocks, 3);
        assert_eq!(census.used_bytes, 208 + 16 + 16 + 16);
    }

    #[test]
    fn test_fragmentation() {
        let census = Census {
            free_bytes: 400,
            largest_free_block: 100,
            ..Census::default()
        };
        assert_eq!(census.fragmentation(), 75);
        assert_eq!(Census::default().fragmentation(), 0);

        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let a = heap.allocate(1024);
        let _fence = heap.allocate(16);
        assert_eq!(heap.report().fragmentation, 0);
        heap.free(a);
        // Two free blocks now: 1040 bytes and the tail.
        let report = heap.report();
        let tail = report.free_bytes - 1040;
        assert_eq!(report.largest_free_block, tail);
        assert_eq!(report.fragmentation, 100 - tail * 100 / report.free_bytes);
        assert!(report.fragmentation > 0);
    }

    #[test]
    fn test_fragmentation_from_published_fields() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let recomputed = |r: &HeapReport| 100 - r.largest_free_block * 100 / r.free_bytes;

        let fresh = heap.report();
        assert_eq!(fresh.fragmentation, 0);
        assert_eq!(recomputed(&fresh), fresh.fragmentation);

        let a = heap.allocate(300);
        let _b = heap.allocate(40);
        let c = heap.allocate(700);
        let _d = heap.allocate(16);
        heap.free(a);
        heap.free(c);
        let report = heap.report();
        assert_eq!(report.free_blocks, 3);
        assert_eq!(recomputed(&report), report.fragmentation);

        // The largest request served without growing.
        let capacity = heap.capacity();
        let p = heap.allocate(report.largest_free_block as usize - HEADER_SIZE);
        assert_ne!(p, NULL);
        assert_eq!(heap.capacity(), capacity);
    }

    #[test]
    fn test_published_report_is_stable() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let first = heap.publish_report() as *const HeapReport;
        let p = heap.allocate(500);
        let report = *heap.publish_report();
        assert_eq!(heap.publish_report() as *const HeapReport, first);
        assert_eq!(report.free_blocks, 1);
        assert_eq!(report.used_bytes, 512 + HEADER_SIZE as u32);
        assert_ne!(p, NULL);
    }

    #[test]
    fn test_validate_detects_corruption() {
        let mut buf = vec![0u8; PAGE];
        let mut heap = Heap::new(ToyHeap::new(&mut buf, PAGE, 1)).unwrap();
        let a = heap.allocate(64);
        let _b = heap.allocate(64);
        assert!(heap.validate().is_valid());

        // Pretend `a` was freed without going through the heap.
        let header = a - HEADER_SIZE;
        let size = Block::at(header).size(heap.memory());
        write_word(heap.grower.memory_mut(), header, size);
        let validity = heap.validate();
        assert!(!validity.is_valid());
        assert_eq!(validity.unbinned, 1);

        // And a predecessor link pointing nowhere useful.
        write_word(heap.grower.memory_mut(), header + crate::block::WORD, 4000);
        assert_eq!(heap.validate().broken_links, 1);
    }
}
