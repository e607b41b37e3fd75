//! Concurrent marking engine for region-based, mostly-concurrent tracing
//! collectors.
//!
//! Implements snapshot-at-the-beginning liveness analysis over a heap of
//! fixed-size regions: dual mark bitmaps (completed and under construction),
//! per-worker task queues with work stealing, a lock-free global overflow
//! stack, finger-based region claiming, cooperative yielding, and the
//! overflow/restart and termination protocols that tie a marking gang
//! together. The surrounding collector drives the cycle through the phase
//! entry points on [`ConcurrentMark`] and supplies roots, SATB buffers, a
//! yield capability and (optionally) a reference processor.

pub mod bitmap;
pub mod entry;
pub mod mark;
pub mod mark_stack;
pub mod object;
pub mod region;
pub mod root_regions;
pub mod satb;
pub mod sync;
pub mod task;
pub mod task_queue;
pub mod utils;

#[cfg(test)]
mod tests;

pub use bitmap::MarkBitmap;
pub use entry::TaskEntry;
pub use mark::{ConcurrentMark, MarkOptions, MarkPhase, RefProcContext, ReferenceProcessor};
pub use mark_stack::{MarkStack, ENTRIES_PER_CHUNK};
pub use object::{HeapObjectHeader, ObjRef};
pub use region::{HeapLayout, HeapRegion, RegionedHeap};
pub use root_regions::RootRegions;
pub use satb::SatbQueueSet;
pub use sync::{NeverYield, YieldDelegate};
pub use task::TaskStats;
