//! Global overflow mark stack.
//!
//! Grey entries that do not fit the per-worker queues travel through this
//! stack in chunks of `ENTRIES_PER_CHUNK` entries. The backing store is one
//! always-committed anonymous mapping sized for the maximum capacity;
//! resizing never moves memory, it only raises the usable chunk count at a
//! stop-the-world point while the stack is empty.
//!
//! Chunk bookkeeping is lock free. Chunks are addressed by their index into
//! the reservation and threaded onto two singly linked lists (`chunk_list`
//! holds data, `free_list` holds recycled chunks) whose heads pack a 32-bit
//! version counter next to the head index into a single word, so a pop whose
//! head was recycled and re-pushed in between fails its compare-exchange
//! instead of corrupting the list. A high-water mark splits the reservation
//! into chunks that have entered circulation and untouched ones.
//!
//! `free_list`, `chunk_list` (with its counter) and `hwm` sit on their own
//! cache lines.

use crossbeam_utils::CachePadded;
use memmap2::MmapMut;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::entry::TaskEntry;

/// Entries per chunk. One slot of the 1024-word chunk pays for the header.
pub const ENTRIES_PER_CHUNK: usize = 1024 - 1;

const NIL: u32 = u32::MAX;

#[repr(C)]
struct Chunk {
    next: u32,
    _pad: u32,
    data: [TaskEntry; ENTRIES_PER_CHUNK],
}

#[inline]
const fn pack(version: u32, index: u32) -> u64 {
    ((version as u64) << 32) | index as u64
}

#[inline]
const fn head_index(packed: u64) -> u32 {
    packed as u32
}

#[inline]
const fn head_version(packed: u64) -> u32 {
    (packed >> 32) as u32
}

pub struct MarkStack {
    #[allow(dead_code)]
    reservation: MmapMut,
    base: *mut Chunk,
    max_chunk_capacity: usize,
    chunk_capacity: AtomicUsize,

    free_list: CachePadded<AtomicU64>,
    chunk_list: CachePadded<AtomicU64>,
    chunks_in_chunk_list: CachePadded<AtomicUsize>,
    hwm: CachePadded<AtomicUsize>,
}

unsafe impl Send for MarkStack {}
unsafe impl Sync for MarkStack {}

impl MarkStack {
    pub fn new(initial_chunk_capacity: usize, max_chunk_capacity: usize) -> std::io::Result<Self> {
        assert!(initial_chunk_capacity > 0 && initial_chunk_capacity <= max_chunk_capacity);
        assert!(max_chunk_capacity < NIL as usize);
        let reservation = MmapMut::map_anon(max_chunk_capacity * size_of::<Chunk>())?;
        let base = reservation.as_ptr() as *mut Chunk;
        Ok(Self {
            reservation,
            base,
            max_chunk_capacity,
            chunk_capacity: AtomicUsize::new(initial_chunk_capacity),
            free_list: CachePadded::new(AtomicU64::new(pack(0, NIL))),
            chunk_list: CachePadded::new(AtomicU64::new(pack(0, NIL))),
            chunks_in_chunk_list: CachePadded::new(AtomicUsize::new(0)),
            hwm: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    /// Placeholder used when engine initialization failed.
    pub fn degenerate() -> Self {
        Self::new(1, 1).expect("cannot map a single chunk")
    }

    #[inline]
    unsafe fn chunk(&self, index: u32) -> *mut Chunk {
        debug_assert!((index as usize) < self.max_chunk_capacity);
        self.base.add(index as usize)
    }

    fn remove_chunk_from_list(&self, list: &AtomicU64) -> Option<u32> {
        let mut head = list.load(Ordering::Acquire);
        loop {
            let index = head_index(head);
            if index == NIL {
                return None;
            }
            // The chunk stays mapped forever, so reading a stale `next` is
            // benign; the version check rejects the swap if the head moved.
            let next = unsafe { (*self.chunk(index)).next };
            let new_head = pack(head_version(head).wrapping_add(1), next);
            match list.compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(index),
                Err(actual) => head = actual,
            }
        }
    }

    fn add_chunk_to_list(&self, list: &AtomicU64, index: u32) {
        let mut head = list.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*self.chunk(index)).next = head_index(head);
            }
            let new_head = pack(head_version(head).wrapping_add(1), index);
            match list.compare_exchange_weak(head, new_head, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Take a chunk from the free list, or carve a fresh one out of the
    /// reservation below the current capacity.
    fn allocate_new_chunk(&self) -> Option<u32> {
        if let Some(index) = self.remove_chunk_from_list(&self.free_list) {
            return Some(index);
        }
        // The claim is not reverted on failure; capacity only ever grows, so
        // an over-bumped hwm stays correct after expansion resets it.
        let claimed = self.hwm.fetch_add(1, Ordering::Relaxed);
        if claimed >= self.chunk_capacity.load(Ordering::Relaxed) {
            return None;
        }
        Some(claimed as u32)
    }

    /// Push a full buffer of entries as one chunk. The caller terminates a
    /// partially filled buffer with null entries. Returns `false` when the
    /// stack is out of chunks (overflow).
    pub fn par_push_chunk(&self, buffer: &[TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        let index = match self.allocate_new_chunk() {
            Some(index) => index,
            None => return false,
        };
        unsafe {
            (*self.chunk(index)).data.copy_from_slice(buffer);
        }
        self.add_chunk_to_list(&self.chunk_list, index);
        self.chunks_in_chunk_list.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pop one chunk into `buffer`. Returns `false` if no chunk was
    /// available.
    pub fn par_pop_chunk(&self, buffer: &mut [TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        let index = match self.remove_chunk_from_list(&self.chunk_list) {
            Some(index) => index,
            None => return false,
        };
        self.chunks_in_chunk_list.fetch_sub(1, Ordering::Relaxed);
        unsafe {
            buffer.copy_from_slice(&(*self.chunk(index)).data);
        }
        self.add_chunk_to_list(&self.free_list, index);
        true
    }

    /// Double the usable capacity, up to the maximum. Only legal at a
    /// stop-the-world point with the stack empty: the free list is discarded
    /// wholesale since every chunk is re-derivable from the reservation once
    /// the high-water mark is reset.
    pub fn expand(&self) {
        assert!(self.is_empty(), "expanding a non-empty mark stack");
        let current = self.chunk_capacity.load(Ordering::Relaxed);
        if current >= self.max_chunk_capacity {
            return;
        }
        self.chunk_capacity
            .store((current * 2).min(self.max_chunk_capacity), Ordering::Relaxed);
        self.set_empty();
    }

    /// Drop all content. Only legal while no task is pushing or popping.
    pub fn set_empty(&self) {
        let chunks = self.chunk_list.load(Ordering::Relaxed);
        self.chunk_list.store(
            pack(head_version(chunks).wrapping_add(1), NIL),
            Ordering::Relaxed,
        );
        let free = self.free_list.load(Ordering::Relaxed);
        self.free_list.store(
            pack(head_version(free).wrapping_add(1), NIL),
            Ordering::Relaxed,
        );
        self.chunks_in_chunk_list.store(0, Ordering::Relaxed);
        self.hwm.store(0, Ordering::Relaxed);
    }

    /// Racy; a hint only.
    pub fn is_empty(&self) -> bool {
        head_index(self.chunk_list.load(Ordering::Relaxed)) == NIL
    }

    /// Approximate number of entries on the stack. Racy; a hint only.
    pub fn size(&self) -> usize {
        self.chunks_in_chunk_list.load(Ordering::Relaxed) * ENTRIES_PER_CHUNK
    }

    /// Current capacity in chunks.
    pub fn capacity(&self) -> usize {
        self.chunk_capacity.load(Ordering::Relaxed)
    }

    pub fn max_capacity(&self) -> usize {
        self.max_chunk_capacity
    }
}
