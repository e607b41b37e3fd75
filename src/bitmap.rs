//! Mark bitmaps.
//!
//! One bit per heap word over a fixed address range, backed by an anonymous
//! mapping. Two instances exist per engine: the completed (prev) bitmap and
//! the under-construction (next) bitmap. Setting bits is a relaxed word CAS;
//! publication to other workers happens through the queues and the global
//! mark stack, whose release/acquire transfers also cover the bits.

use atomic::{Atomic, Ordering};
use memmap2::MmapMut;
use std::mem::size_of;

use crate::utils::{is_aligned, WORD_SIZE};

const BITS_PER_WORD: usize = size_of::<usize>() * 8;

pub struct MarkBitmap {
    #[allow(dead_code)]
    mem_map: MmapMut,
    bitmap_begin: *mut Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

unsafe impl Send for MarkBitmap {}
unsafe impl Sync for MarkBitmap {}

impl MarkBitmap {
    pub fn create(
        name: &'static str,
        heap_begin: usize,
        heap_capacity: usize,
    ) -> std::io::Result<Self> {
        debug_assert!(is_aligned(heap_begin, WORD_SIZE));
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        let mem_map = MmapMut::map_anon(bitmap_size.max(1))?;
        let bitmap_begin = mem_map.as_ptr() as *mut Atomic<usize>;
        Ok(Self {
            mem_map,
            bitmap_begin,
            bitmap_size,
            heap_begin,
            heap_limit: heap_begin + heap_capacity,
            name,
        })
    }

    /// Placeholder for an engine whose initialization failed. Covers no
    /// addresses; every query on it would be out of range.
    pub fn degenerate() -> Self {
        let mem_map = MmapMut::map_anon(1).expect("cannot map a single page");
        let bitmap_begin = mem_map.as_ptr() as *mut Atomic<usize>;
        Self {
            mem_map,
            bitmap_begin,
            bitmap_size: 0,
            heap_begin: 0,
            heap_limit: 0,
            name: "degenerate",
        }
    }

    pub fn compute_bitmap_size(heap_capacity: usize) -> usize {
        let bytes_covered_per_word = WORD_SIZE * BITS_PER_WORD;
        (heap_capacity + bytes_covered_per_word - 1) / bytes_covered_per_word * size_of::<usize>()
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    #[inline]
    fn offset_to_index(offset: usize) -> usize {
        offset / WORD_SIZE / BITS_PER_WORD
    }

    #[inline]
    fn index_to_offset(index: usize) -> usize {
        index * WORD_SIZE * BITS_PER_WORD
    }

    #[inline]
    fn offset_bit_index(offset: usize) -> usize {
        (offset / WORD_SIZE) % BITS_PER_WORD
    }

    #[inline]
    fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    #[inline]
    fn word(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(
            index < self.bitmap_size / size_of::<usize>(),
            "{}: word index {} out of {}",
            self.name,
            index,
            self.bitmap_size / size_of::<usize>()
        );
        unsafe { &*self.bitmap_begin.add(index) }
    }

    #[inline]
    fn check_addr(&self, addr: usize) {
        debug_assert!(
            addr >= self.heap_begin && addr < self.heap_limit,
            "{}: address {:#x} outside [{:#x}, {:#x})",
            self.name,
            addr,
            self.heap_begin,
            self.heap_limit
        );
        debug_assert!(is_aligned(addr, WORD_SIZE));
    }

    /// Atomically set the bit for `addr`. Returns `true` iff this call
    /// performed the 0 -> 1 transition.
    #[inline]
    pub fn mark(&self, addr: usize) -> bool {
        self.check_addr(addr);
        let offset = addr - self.heap_begin;
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let entry = self.word(index);

        let mut old_word = entry.load(Ordering::Relaxed);
        loop {
            if old_word & mask != 0 {
                return false;
            }
            match entry.compare_exchange_weak(
                old_word,
                old_word | mask,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => old_word = actual,
            }
        }
    }

    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.check_addr(addr);
        let offset = addr - self.heap_begin;
        let index = Self::offset_to_index(offset);
        self.word(index).load(Ordering::Relaxed) & Self::offset_to_mask(offset) != 0
    }

    #[inline]
    pub fn clear(&self, addr: usize) {
        self.check_addr(addr);
        let offset = addr - self.heap_begin;
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let entry = self.word(index);
        entry.fetch_and(!mask, Ordering::Relaxed);
    }

    /// Zero all bits in `[begin, end)`. Only called at a safepoint or during
    /// a cooperative clearing phase with no concurrent setters on the range.
    pub fn clear_range(&self, begin: usize, end: usize) {
        if begin >= end {
            return;
        }
        self.check_addr(begin);
        debug_assert!(end <= self.heap_limit);

        let mut begin_offset = begin - self.heap_begin;
        let end_offset = end - self.heap_begin;

        // Leading partial word.
        while begin_offset < end_offset && Self::offset_bit_index(begin_offset) != 0 {
            self.clear(self.heap_begin + begin_offset);
            begin_offset += WORD_SIZE;
        }
        // Whole words.
        while begin_offset < end_offset
            && Self::index_to_offset(Self::offset_to_index(begin_offset) + 1) <= end_offset
        {
            let index = Self::offset_to_index(begin_offset);
            self.word(index).store(0, Ordering::Relaxed);
            begin_offset = Self::index_to_offset(index + 1);
        }
        // Trailing partial word.
        while begin_offset < end_offset {
            self.clear(self.heap_begin + begin_offset);
            begin_offset += WORD_SIZE;
        }
    }

    pub fn clear_all(&self) {
        let words = self.bitmap_size / size_of::<usize>();
        for i in 0..words {
            self.word(i).store(0, Ordering::Relaxed);
        }
    }

    /// First marked address in `[addr, limit)`, or `None`. Bitmap words are
    /// re-read on every step, so a bit set concurrently ahead of the cursor
    /// is observed; this is what lets region scans rely on the below-finger
    /// enqueue rule instead of re-visiting.
    pub fn get_next_marked_addr(&self, addr: usize, limit: usize) -> Option<usize> {
        if addr >= limit {
            return None;
        }
        self.check_addr(addr);
        debug_assert!(limit <= self.heap_limit);

        let end_offset = limit - self.heap_begin;
        let end_index = Self::offset_to_index(end_offset + (WORD_SIZE * BITS_PER_WORD) - WORD_SIZE);

        let mut offset = addr - self.heap_begin;
        let mut index = Self::offset_to_index(offset);
        while index < end_index {
            let mut word = self.word(index).load(Ordering::Relaxed);
            // Mask off bits below the cursor in the first word.
            word &= !((1usize << Self::offset_bit_index(offset)) - 1);
            if word != 0 {
                let shift = word.trailing_zeros() as usize;
                let found = self.heap_begin + Self::index_to_offset(index) + shift * WORD_SIZE;
                return if found < limit { Some(found) } else { None };
            }
            index += 1;
            offset = Self::index_to_offset(index);
        }
        None
    }

    /// Last marked address in `[lo, hi)`, or `None`. Used to locate an
    /// array header from an interior slice cursor: interior words of an
    /// array contain no object starts, so the closest bit at or below the
    /// cursor is the array itself.
    pub fn find_last_marked_addr(&self, lo: usize, hi: usize) -> Option<usize> {
        if lo >= hi {
            return None;
        }
        self.check_addr(lo);
        debug_assert!(hi <= self.heap_limit);

        let lo_offset = lo - self.heap_begin;
        let lo_index = Self::offset_to_index(lo_offset);
        let last_offset = hi - self.heap_begin - WORD_SIZE;
        let mut index = Self::offset_to_index(last_offset);

        loop {
            let mut word = self.word(index).load(Ordering::Relaxed);
            if index == Self::offset_to_index(last_offset) {
                // Mask off bits above the end in the first (highest) word.
                let bit = Self::offset_bit_index(last_offset);
                if bit + 1 < BITS_PER_WORD {
                    word &= (1usize << (bit + 1)) - 1;
                }
            }
            if index == lo_index {
                word &= !((1usize << Self::offset_bit_index(lo_offset)) - 1);
            }
            if word != 0 {
                let high = BITS_PER_WORD - 1 - word.leading_zeros() as usize;
                return Some(self.heap_begin + Self::index_to_offset(index) + high * WORD_SIZE);
            }
            if index == lo_index {
                return None;
            }
            index -= 1;
        }
    }

    /// Visit marked addresses in `[lo, hi)` in ascending order. Loads each
    /// bitmap word once, so bits set concurrently during the visit may be
    /// missed; callers wanting the stronger guarantee use
    /// `get_next_marked_addr`.
    pub fn visit_marked_range(&self, lo: usize, hi: usize, mut visitor: impl FnMut(usize)) {
        let mut addr = lo;
        while let Some(found) = self.get_next_marked_addr(addr, hi) {
            visitor(found);
            addr = found + WORD_SIZE;
            if addr >= hi {
                break;
            }
        }
    }

    /// Number of marked bits in `[lo, hi)`.
    pub fn count_marked_range(&self, lo: usize, hi: usize) -> usize {
        let mut count = 0;
        self.visit_marked_range(lo, hi, |_| count += 1);
        count
    }

    pub fn is_clear_range(&self, lo: usize, hi: usize) -> bool {
        self.get_next_marked_addr(lo, hi).is_none()
    }
}

impl std::fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[begin={:#x},end={:#x}]",
            self.name, self.heap_begin, self.heap_limit
        )
    }
}
