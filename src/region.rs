//! Heap regions.
//!
//! The marking universe is a contiguous reservation carved into fixed,
//! power-of-two sized regions. The engine only consumes region metadata:
//! bounds, the allocation top, and the top-at-mark-start (TAMS) snapshot
//! taken at the initial-mark pause. Objects at or above their region's TAMS
//! were allocated during the cycle and are implicitly live; survivor regions
//! keep TAMS at bottom and are instead scanned wholesale as root regions.

use memmap2::MmapMut;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::object::{HeapObjectHeader, ObjRef};
use crate::utils::{align_up, formatted_size, WORD_SIZE};

#[derive(Clone, Copy, Debug)]
pub struct HeapLayout {
    pub region_size_bytes: usize,
    pub region_size_log: usize,
    pub num_regions: usize,
    pub heap_size: usize,
}

impl HeapLayout {
    pub const MIN_REGION_SIZE: usize = 64 * 1024;
    pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;
    pub const MIN_NUM_REGIONS: usize = 2;

    /// Compute a region size for the given heap size, aiming at
    /// `target_num_regions` and rounding to a power of two.
    pub fn setup_sizes(max_heap_size: usize, target_num_regions: usize) -> HeapLayout {
        assert!(max_heap_size >= Self::MIN_NUM_REGIONS * Self::MIN_REGION_SIZE);
        let target = target_num_regions.max(Self::MIN_NUM_REGIONS);

        let mut region_size = max_heap_size / target;
        region_size = region_size.clamp(Self::MIN_REGION_SIZE, Self::MAX_REGION_SIZE);

        let region_size_log = (usize::BITS - 1 - region_size.leading_zeros()) as usize;
        region_size = 1 << region_size_log;

        let heap_size = align_up(max_heap_size, region_size);
        HeapLayout {
            region_size_bytes: region_size,
            region_size_log,
            num_regions: heap_size / region_size,
            heap_size,
        }
    }
}

pub struct HeapRegion {
    index: u32,
    bottom: usize,
    end: usize,
    top: AtomicUsize,
    tams: AtomicUsize,
    survivor: AtomicBool,
    marked_bytes: AtomicUsize,
}

impl HeapRegion {
    fn new(index: u32, bottom: usize, end: usize) -> Self {
        Self {
            index,
            bottom,
            end,
            top: AtomicUsize::new(bottom),
            tams: AtomicUsize::new(bottom),
            survivor: AtomicBool::new(false),
            marked_bytes: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn bottom(&self) -> usize {
        self.bottom
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Top-at-mark-start. Objects at or above this address are implicitly
    /// live for the current cycle.
    #[inline]
    pub fn top_at_mark_start(&self) -> usize {
        self.tams.load(Ordering::Acquire)
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    #[inline]
    pub fn is_survivor(&self) -> bool {
        self.survivor.load(Ordering::Relaxed)
    }

    pub fn set_survivor(&self, survivor: bool) {
        self.survivor.store(survivor, Ordering::Relaxed);
    }

    pub(crate) fn record_top_at_mark_start(&self) {
        // Survivor regions are scanned from the roots instead; everything in
        // them stays implicitly live this cycle.
        let tams = if self.is_survivor() { self.bottom } else { self.top() };
        self.tams.store(tams, Ordering::Release);
    }

    pub(crate) fn reset_top_at_mark_start(&self) {
        self.tams.store(self.bottom, Ordering::Release);
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn set_marked_bytes(&self, bytes: usize) {
        self.marked_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Bump-allocate `words` words. Returns the start address.
    pub fn allocate(&self, words: usize) -> Option<usize> {
        let bytes = words * WORD_SIZE;
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if top + bytes > self.end {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(top),
                Err(actual) => top = actual,
            }
        }
    }

    /// Return the region to its empty state, e.g. after the collector
    /// reclaimed it off the cleanup list.
    pub fn reset_allocation(&self) {
        self.top.store(self.bottom, Ordering::Release);
        self.tams.store(self.bottom, Ordering::Release);
        self.survivor.store(false, Ordering::Relaxed);
        self.marked_bytes.store(0, Ordering::Relaxed);
    }
}

/// The region table plus the heap reservation behind it.
pub struct RegionedHeap {
    #[allow(dead_code)]
    storage: MmapMut,
    begin: usize,
    end: usize,
    layout: HeapLayout,
    regions: Vec<HeapRegion>,
}

unsafe impl Send for RegionedHeap {}
unsafe impl Sync for RegionedHeap {}

impl RegionedHeap {
    pub fn new(max_heap_size: usize, target_num_regions: usize) -> std::io::Result<Self> {
        let layout = HeapLayout::setup_sizes(max_heap_size, target_num_regions);
        let storage = MmapMut::map_anon(layout.heap_size)?;
        let begin = storage.as_ptr() as usize;
        debug_assert!(begin % WORD_SIZE == 0);
        let end = begin + layout.heap_size;

        let regions = (0..layout.num_regions)
            .map(|i| {
                let bottom = begin + i * layout.region_size_bytes;
                HeapRegion::new(i as u32, bottom, bottom + layout.region_size_bytes)
            })
            .collect();

        Ok(Self {
            storage,
            begin,
            end,
            layout,
            regions,
        })
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.heap_size
    }

    #[inline]
    pub fn region_size(&self) -> usize {
        self.layout.region_size_bytes
    }

    #[inline]
    pub fn num_regions(&self) -> usize {
        self.layout.num_regions
    }

    #[inline]
    pub fn region(&self, index: u32) -> &HeapRegion {
        &self.regions[index as usize]
    }

    pub fn regions(&self) -> impl Iterator<Item = &HeapRegion> {
        self.regions.iter()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    #[inline]
    pub fn addr_to_region_index(&self, addr: usize) -> u32 {
        debug_assert!(self.contains(addr));
        ((addr - self.begin) >> self.layout.region_size_log) as u32
    }

    #[inline]
    pub fn addr_to_region(&self, addr: usize) -> &HeapRegion {
        self.region(self.addr_to_region_index(addr))
    }

    pub fn record_top_at_mark_start(&self) {
        for region in &self.regions {
            region.record_top_at_mark_start();
        }
    }

    pub fn reset_top_at_mark_start(&self) {
        for region in &self.regions {
            region.reset_top_at_mark_start();
        }
    }

    /// Indices of the current survivor regions, in region order.
    pub fn survivor_snapshot(&self) -> Vec<u32> {
        self.regions
            .iter()
            .filter(|r| r.is_survivor())
            .map(|r| r.index())
            .collect()
    }

    /// Allocate and zero a plain object with `payload_words` reference
    /// slots in the given region.
    pub fn alloc_plain(&self, region_index: u32, payload_words: usize) -> Option<ObjRef> {
        self.alloc_with(region_index, HeapObjectHeader::new_plain(payload_words))
    }

    /// Allocate and zero a reference array of `len` elements.
    pub fn alloc_ref_array(&self, region_index: u32, len: usize) -> Option<ObjRef> {
        self.alloc_with(region_index, HeapObjectHeader::new_ref_array(len))
    }

    fn alloc_with(&self, region_index: u32, header: HeapObjectHeader) -> Option<ObjRef> {
        let region = self.region(region_index);
        let addr = region.allocate(header.size_words())?;
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0, header.size_words() * WORD_SIZE);
            (addr as *mut HeapObjectHeader).write(header);
        }
        Some(ObjRef::from_addr(addr))
    }

    pub fn print_layout(&self) {
        eprintln!(
            "[concmark] heap {:#x}..{:#x}: {} regions of {}",
            self.begin,
            self.end,
            self.layout.num_regions,
            formatted_size(self.layout.region_size_bytes),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_sizes_power_of_two() {
        let layout = HeapLayout::setup_sizes(16 * 1024 * 1024, 16);
        assert!(layout.region_size_bytes.is_power_of_two());
        assert_eq!(
            layout.num_regions * layout.region_size_bytes,
            layout.heap_size
        );
        assert!(layout.heap_size >= 16 * 1024 * 1024);
    }

    #[test]
    fn region_lookup() {
        let heap = RegionedHeap::new(4 * 1024 * 1024, 4).unwrap();
        assert!(heap.num_regions() >= 4);
        let r1 = heap.region(1);
        assert_eq!(heap.addr_to_region_index(r1.bottom()), 1);
        assert_eq!(heap.addr_to_region_index(r1.end() - 8), 1);
        assert_eq!(heap.addr_to_region_index(r1.end()), 2);
    }

    #[test]
    fn tams_snapshot_skips_survivors() {
        let heap = RegionedHeap::new(4 * 1024 * 1024, 4).unwrap();
        heap.alloc_plain(0, 10).unwrap();
        heap.alloc_plain(1, 10).unwrap();
        heap.region(1).set_survivor(true);

        heap.record_top_at_mark_start();
        assert_eq!(heap.region(0).top_at_mark_start(), heap.region(0).top());
        assert_eq!(heap.region(1).top_at_mark_start(), heap.region(1).bottom());
        assert_eq!(heap.survivor_snapshot(), vec![1]);
    }

    #[test]
    fn allocation_is_contiguous_and_zeroed() {
        let heap = RegionedHeap::new(4 * 1024 * 1024, 4).unwrap();
        let a = heap.alloc_plain(0, 2).unwrap();
        let b = heap.alloc_plain(0, 2).unwrap();
        unsafe {
            assert_eq!(a.end(), b.addr());
            assert!(a.slot(0).is_none() && a.slot(1).is_none());
        }
    }
}
