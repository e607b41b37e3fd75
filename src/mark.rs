//! The concurrent marking orchestrator.
//!
//! Owns the two mark bitmaps, the global mark stack, the finger, the root
//! region claim set and the gang synchronization, and sequences the cycle:
//!
//! ```text
//! Idle -> (initial mark pause) -> RootScan -> ConcMark -> (remark pause)
//!      -> Cleanup -> Idle
//! ```
//!
//! A global mark stack overflow quiesces every worker behind two barrier
//! gates, resets the marking state and resumes from the bottom of the heap;
//! the already-built bitmap makes the retry converge. An overflow during the
//! remark pause instead schedules another round of concurrent marking. An
//! external abort (a full collection) drains everything back to `Idle`.

use parking_lot::Mutex;
use scoped_threadpool::Pool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::bitmap::MarkBitmap;
use crate::entry::TaskEntry;
use crate::mark_stack::{MarkStack, ENTRIES_PER_CHUNK};
use crate::object::ObjRef;
use crate::region::{HeapRegion, RegionedHeap};
use crate::root_regions::RootRegions;
use crate::satb::SatbQueueSet;
use crate::sync::{BarrierSync, NeverYield, Terminator, YieldDelegate};
use crate::task::{GangContext, MarkingTask, TaskStats};
use crate::task_queue::{LocalTaskQueue, TaskQueueSet};
use crate::utils::{formatted_size, NumberSeq, WORD_SIZE};

/// Engine knobs. Values are in effect from the next cycle start.
#[derive(Clone, Debug)]
pub struct MarkOptions {
    /// Concurrent marking workers (>= 1).
    pub num_workers: usize,
    /// Initial global mark stack capacity, in chunks.
    pub mark_stack_initial_chunks: usize,
    /// Maximum global mark stack capacity, in chunks.
    pub mark_stack_max_chunks: usize,
    /// Per-worker queue bound, in entries.
    pub local_queue_capacity: usize,
    /// Words scanned between two marking clock calls.
    pub words_scanned_period: usize,
    /// References visited between two marking clock calls.
    pub refs_reached_period: usize,
    /// Soft duration of one concurrent marking step.
    pub step_duration_ms: f64,
    /// Log phase transitions and timings to stderr.
    pub verbose: bool,
    /// Run invariant checks at phase boundaries.
    pub verify: bool,
}

impl Default for MarkOptions {
    fn default() -> Self {
        Self {
            num_workers: 4,
            mark_stack_initial_chunks: 16,
            mark_stack_max_chunks: 1024,
            local_queue_capacity: 16 * 1024,
            words_scanned_period: 12 * 1024,
            refs_reached_period: 1024,
            step_duration_ms: 10.0,
            verbose: false,
            verify: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MarkPhase {
    Idle,
    RootScan,
    ConcMark,
    Remark,
    Cleanup,
}

/// Callbacks handed to the reference processor during remark.
pub trait RefProcContext {
    /// The liveness predicate of the finished marking: marked, or allocated
    /// since mark start.
    fn is_alive(&self, obj: ObjRef) -> bool;
    /// Grey one referent and drain the marking work it uncovers.
    fn keep_alive(&mut self, obj: ObjRef);
    /// Fully drain all outstanding marking work.
    fn complete_drain(&mut self);
}

/// External reference processing, invoked once during the remark pause.
pub trait ReferenceProcessor: Send + Sync {
    fn process_discovered_references(&self, clear_all_soft_refs: bool, ctx: &mut dyn RefProcContext);
}

#[derive(Clone, Copy)]
enum GangMode {
    Concurrent,
    Remark,
}

pub struct ConcurrentMark {
    heap: Arc<RegionedHeap>,
    options: MarkOptions,
    completed_initialization: bool,

    bitmaps: [MarkBitmap; 2],
    next_bitmap_index: AtomicUsize,

    global_mark_stack: MarkStack,
    finger: AtomicUsize,
    root_regions: RootRegions,
    satb: SatbQueueSet,

    first_overflow_barrier_sync: BarrierSync,
    second_overflow_barrier_sync: BarrierSync,

    has_overflown: AtomicBool,
    num_overflows: AtomicUsize,
    has_aborted: AtomicBool,
    restart_for_overflow: AtomicBool,
    phase: atomic::Atomic<MarkPhase>,
    marking_in_progress: AtomicBool,
    num_active_tasks: AtomicUsize,

    workers: Mutex<Pool>,
    yield_delegate: Arc<dyn YieldDelegate>,
    ref_processor: Option<Arc<dyn ReferenceProcessor>>,

    cleanup_list: Mutex<Vec<u32>>,

    init_times_ms: Mutex<NumberSeq>,
    remark_times_ms: Mutex<NumberSeq>,
    cleanup_times_ms: Mutex<NumberSeq>,
    accum_task_time_ms: Vec<atomic::Atomic<f64>>,
    last_task_stats: Mutex<Vec<TaskStats>>,
}

impl ConcurrentMark {
    pub fn new(heap: Arc<RegionedHeap>, options: MarkOptions) -> Self {
        let mut completed_initialization = true;
        let num_workers = options.num_workers.max(1);

        let prev = MarkBitmap::create("prev-mark-bitmap", heap.begin(), heap.capacity())
            .unwrap_or_else(|_| {
                completed_initialization = false;
                MarkBitmap::degenerate()
            });
        let next = MarkBitmap::create("next-mark-bitmap", heap.begin(), heap.capacity())
            .unwrap_or_else(|_| {
                completed_initialization = false;
                MarkBitmap::degenerate()
            });
        let global_mark_stack = MarkStack::new(
            options.mark_stack_initial_chunks,
            options.mark_stack_max_chunks,
        )
        .unwrap_or_else(|_| {
            completed_initialization = false;
            MarkStack::degenerate()
        });

        let finger = AtomicUsize::new(heap.begin());
        Self {
            options: MarkOptions {
                num_workers,
                ..options
            },
            completed_initialization,
            bitmaps: [prev, next],
            next_bitmap_index: AtomicUsize::new(1),
            global_mark_stack,
            finger,
            root_regions: RootRegions::new(),
            satb: SatbQueueSet::new(),
            first_overflow_barrier_sync: BarrierSync::new(),
            second_overflow_barrier_sync: BarrierSync::new(),
            has_overflown: AtomicBool::new(false),
            num_overflows: AtomicUsize::new(0),
            has_aborted: AtomicBool::new(false),
            restart_for_overflow: AtomicBool::new(false),
            phase: atomic::Atomic::new(MarkPhase::Idle),
            marking_in_progress: AtomicBool::new(false),
            num_active_tasks: AtomicUsize::new(0),
            workers: Mutex::new(Pool::new(num_workers as u32)),
            yield_delegate: Arc::new(NeverYield),
            ref_processor: None,
            cleanup_list: Mutex::new(Vec::new()),
            init_times_ms: Mutex::new(NumberSeq::new()),
            remark_times_ms: Mutex::new(NumberSeq::new()),
            cleanup_times_ms: Mutex::new(NumberSeq::new()),
            accum_task_time_ms: (0..num_workers).map(|_| atomic::Atomic::new(0.0f64)).collect(),
            last_task_stats: Mutex::new(Vec::new()),
            heap,
        }
    }

    /// Install the collector's safepoint yield capability. Must be done
    /// before the engine is shared with other threads.
    pub fn set_yield_delegate(&mut self, delegate: Arc<dyn YieldDelegate>) {
        self.yield_delegate = delegate;
    }

    /// Install the reference processor invoked during remark.
    pub fn set_reference_processor(&mut self, processor: Arc<dyn ReferenceProcessor>) {
        self.ref_processor = Some(processor);
    }

    /// Whether bitmap and mark stack reservations all succeeded. A failed
    /// engine must not be used for marking.
    pub fn completed_initialization(&self) -> bool {
        self.completed_initialization
    }

    // -- queries -------------------------------------------------------------

    #[inline]
    pub fn heap(&self) -> &RegionedHeap {
        &self.heap
    }

    #[inline]
    pub(crate) fn options(&self) -> &MarkOptions {
        &self.options
    }

    #[inline]
    pub fn phase(&self) -> MarkPhase {
        self.phase.load(Ordering::Acquire)
    }

    /// True while marking work is outstanding: from the initial mark until
    /// the concurrent phase completes (or the cycle aborts).
    pub fn concurrent_marking_in_progress(&self) -> bool {
        self.marking_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn clear_concurrent_marking_in_progress(&self) {
        self.marking_in_progress.store(false, Ordering::Release);
    }

    /// True in the phases running alongside mutators.
    pub(crate) fn concurrent(&self) -> bool {
        matches!(self.phase(), MarkPhase::RootScan | MarkPhase::ConcMark)
    }

    /// Number of tasks in the current (or last) marking gang.
    pub fn num_active_tasks(&self) -> usize {
        self.num_active_tasks.load(Ordering::Relaxed)
    }

    pub fn has_aborted(&self) -> bool {
        self.has_aborted.load(Ordering::Acquire)
    }

    pub fn restart_for_overflow(&self) -> bool {
        self.restart_for_overflow.load(Ordering::Acquire)
    }

    pub fn root_regions(&self) -> &RootRegions {
        &self.root_regions
    }

    pub fn satb(&self) -> &SatbQueueSet {
        &self.satb
    }

    pub fn prev_mark_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[1 - self.next_bitmap_index.load(Ordering::Acquire)]
    }

    pub fn next_mark_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[self.next_bitmap_index.load(Ordering::Acquire)]
    }

    fn swap_mark_bitmaps(&self) {
        self.next_bitmap_index.fetch_xor(1, Ordering::AcqRel);
    }

    /// For assertions only; scans the whole bitmap.
    pub fn next_mark_bitmap_is_clear(&self) -> bool {
        self.next_mark_bitmap()
            .is_clear_range(self.heap.begin(), self.heap.end())
    }

    /// Region indices found fully dead by the last `cleanup()`; ownership of
    /// their reclamation belongs to the collector.
    pub fn take_cleanup_list(&self) -> Vec<u32> {
        std::mem::take(&mut self.cleanup_list.lock())
    }

    /// Per-worker counters from the most recent marking gang.
    pub fn last_task_stats(&self) -> Vec<TaskStats> {
        self.last_task_stats.lock().clone()
    }

    // -- bitmap helpers ------------------------------------------------------

    /// Mark `obj` in the next bitmap if it is below its region's TAMS.
    /// Returns whether this call marked it.
    pub fn mark_in_next_bitmap(&self, obj: ObjRef) -> bool {
        let region = self.heap.addr_to_region(obj.addr());
        self.mark_in_next_bitmap_in(region, obj)
    }

    /// Region-aware variant for callers that already hold the region.
    pub fn mark_in_next_bitmap_in(&self, region: &HeapRegion, obj: ObjRef) -> bool {
        if obj.addr() >= region.top_at_mark_start() {
            return false;
        }
        let next = self.next_mark_bitmap();
        // Racy pre-check keeps the common already-marked case cheap.
        if next.is_marked(obj.addr()) {
            return false;
        }
        next.mark(obj.addr())
    }

    pub fn is_marked_in_next_bitmap(&self, obj: ObjRef) -> bool {
        self.next_mark_bitmap().is_marked(obj.addr())
    }

    /// The prev bitmap is normally read-only; use with care.
    pub fn mark_in_prev_bitmap(&self, obj: ObjRef) -> bool {
        self.prev_mark_bitmap().mark(obj.addr())
    }

    pub fn is_marked_in_prev_bitmap(&self, obj: ObjRef) -> bool {
        self.prev_mark_bitmap().is_marked(obj.addr())
    }

    pub fn clear_range_in_prev_bitmap(&self, begin: usize, end: usize) {
        self.prev_mark_bitmap().clear_range(begin, end);
    }

    /// Liveness under the current (unfinished or just finished) marking.
    pub fn is_live(&self, obj: ObjRef) -> bool {
        let region = self.heap.addr_to_region(obj.addr());
        obj.addr() >= region.top_at_mark_start() || self.is_marked_in_next_bitmap(obj)
    }

    // -- mark stack hooks ----------------------------------------------------

    pub(crate) fn mark_stack_push(&self, buffer: &[TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        if !self.global_mark_stack.par_push_chunk(buffer) {
            self.set_has_overflown();
            return false;
        }
        true
    }

    pub(crate) fn mark_stack_pop(&self, buffer: &mut [TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        self.global_mark_stack.par_pop_chunk(buffer)
    }

    pub(crate) fn mark_stack_size(&self) -> usize {
        self.global_mark_stack.size()
    }

    pub(crate) fn mark_stack_is_empty(&self) -> bool {
        self.global_mark_stack.is_empty()
    }

    pub(crate) fn partial_mark_stack_size_target(&self) -> usize {
        self.global_mark_stack.capacity() * ENTRIES_PER_CHUNK / 3
    }

    pub(crate) fn has_overflown(&self) -> bool {
        self.has_overflown.load(Ordering::Acquire)
    }

    fn set_has_overflown(&self) {
        if !self.has_overflown.swap(true, Ordering::AcqRel) {
            self.num_overflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// How many times the global stack overflowed since the cycle started.
    pub fn overflow_episodes(&self) -> usize {
        self.num_overflows.load(Ordering::Relaxed)
    }

    fn clear_has_overflown(&self) {
        self.has_overflown.store(false, Ordering::Release);
    }

    // -- finger --------------------------------------------------------------

    #[inline]
    pub(crate) fn finger(&self) -> usize {
        self.finger.load(Ordering::Acquire)
    }

    /// Claim the region at the finger, advancing it by one region. `None`
    /// when the finger ran past the heap; the region returned may still be
    /// empty, which the caller handles by giving it up. Kept cheap so tasks
    /// can call their clock between claims.
    pub(crate) fn claim_region(&self, _worker_id: usize) -> Option<u32> {
        let pre = self
            .finger
            .fetch_add(self.heap.region_size(), Ordering::AcqRel);
        if pre >= self.heap.end() {
            return None;
        }
        Some(self.heap.addr_to_region_index(pre))
    }

    pub(crate) fn out_of_regions(&self) -> bool {
        self.finger.load(Ordering::Acquire) >= self.heap.end()
    }

    // -- yield ---------------------------------------------------------------

    pub(crate) fn should_yield(&self) -> bool {
        self.yield_delegate.should_yield()
    }

    /// Yield to the environment if it asked for it. Returns whether we did.
    pub fn do_yield_check(&self) -> bool {
        if self.yield_delegate.should_yield() {
            self.yield_delegate.yield_now();
            true
        } else {
            false
        }
    }

    // -- overflow barriers ---------------------------------------------------

    pub(crate) fn enter_first_sync_barrier(&self, worker_id: usize) {
        let entered = self.first_overflow_barrier_sync.enter();
        // Everyone has stopped manipulating the global structures. Task 0
        // alone resets them; the others wait at the second gate after their
        // local re-initialization. During remark the overflow flag is left
        // up so the remark loop exits and schedules the full restart.
        if worker_id == 0 && entered {
            self.reset_marking_state(self.concurrent());
        }
    }

    pub(crate) fn enter_second_sync_barrier(&self, _worker_id: usize) {
        let _ = self.second_overflow_barrier_sync.enter();
    }

    // -- state resets --------------------------------------------------------

    fn reset(&self) {
        self.finger.store(self.heap.begin(), Ordering::Release);
        self.clear_has_overflown();
        self.num_overflows.store(0, Ordering::Relaxed);
        self.global_mark_stack.set_empty();
        self.cleanup_list.lock().clear();
        self.last_task_stats.lock().clear();
        for accum in &self.accum_task_time_ms {
            accum.store(0.0, Ordering::Relaxed);
        }
    }

    pub(crate) fn reset_marking_state(&self, clear_overflow: bool) {
        self.global_mark_stack.set_empty();
        if self.has_overflown() {
            // Grow the stack for the retry, up to its maximum.
            self.global_mark_stack.expand();
            if clear_overflow {
                self.clear_has_overflown();
            }
        }
        self.finger.store(self.heap.begin(), Ordering::Release);
    }

    fn set_non_marking_state(&self) {
        self.marking_in_progress.store(false, Ordering::Release);
        self.num_active_tasks.store(0, Ordering::Relaxed);
        self.phase.store(MarkPhase::Idle, Ordering::Release);
    }

    fn set_concurrency_and_phase(&self, active_tasks: usize, concurrent: bool) {
        self.num_active_tasks.store(active_tasks, Ordering::Relaxed);
        self.first_overflow_barrier_sync.set_n_workers(active_tasks);
        self.second_overflow_barrier_sync.set_n_workers(active_tasks);
        self.phase.store(
            if concurrent {
                MarkPhase::ConcMark
            } else {
                MarkPhase::Remark
            },
            Ordering::Release,
        );
    }

    fn calc_active_marking_workers(&self) -> usize {
        self.options.num_workers
    }

    /// Quiesce after an external abort: every structure back to a state the
    /// next cycle can start from. Idempotent.
    fn drain_to_idle(&self) {
        self.clear_bitmap(self.next_mark_bitmap(), false);
        self.reset_marking_state(true);
        self.restart_for_overflow.store(false, Ordering::Release);
        self.satb.abandon_partial_marking();
        self.satb.set_active(false);
        self.root_regions.cancel_scan();
        self.heap.reset_top_at_mark_start();
        self.set_non_marking_state();
        if self.options.verbose {
            eprintln!("[concmark] cycle aborted, back to idle");
        }
    }

    // -- phase entry points --------------------------------------------------

    /// First half of the initial-mark pause: snapshot TAMS and reset the
    /// marking state. The collector then marks its strong roots via
    /// `mark_in_next_bitmap` before calling the post hook.
    pub fn checkpoint_roots_initial_pre(&self) {
        assert_eq!(self.phase(), MarkPhase::Idle, "marking cycle already running");
        let start = Instant::now();
        self.has_aborted.store(false, Ordering::Release);
        self.restart_for_overflow.store(false, Ordering::Release);
        self.heap.record_top_at_mark_start();
        self.reset();
        if self.options.verify {
            assert!(
                self.next_mark_bitmap_is_clear(),
                "next mark bitmap dirty at cycle start"
            );
        }
        self.init_times_ms
            .lock()
            .add(start.elapsed().as_secs_f64() * 1000.0);
    }

    /// Second half of the initial-mark pause: arm SATB logging and the root
    /// region claim set, and let the cycle begin.
    pub fn checkpoint_roots_initial_post(&self) {
        let start = Instant::now();
        self.root_regions
            .prepare_for_scan(self.heap.survivor_snapshot());
        self.satb.set_active(true);
        self.marking_in_progress.store(true, Ordering::Release);
        self.phase.store(MarkPhase::RootScan, Ordering::Release);
        self.init_times_ms
            .lock()
            .add(start.elapsed().as_secs_f64() * 1000.0);
        if self.options.verbose {
            eprintln!(
                "[concmark] cycle start: {} regions, {} root regions",
                self.heap.num_regions(),
                self.root_regions.num_root_regions()
            );
        }
    }

    /// Scan every root (survivor) region, marking all objects reachable
    /// from them. Must finish before the next evacuation pause; an abort
    /// stops further claims.
    pub fn scan_root_regions(&self) {
        if self.root_regions.scan_in_progress() {
            let active = self
                .options
                .num_workers
                .min(self.root_regions.num_root_regions())
                .max(1);
            let mut pool = self.workers.lock();
            pool.scoped(|scope| {
                for _ in 0..active {
                    scope.execute(|| {
                        while let Some(index) = self.root_regions.claim_next() {
                            self.scan_root_region(index);
                        }
                    });
                }
            });
            drop(pool);
            self.root_regions.scan_finished();
        }
    }

    /// Mark everything directly reachable from one root region. Pure bitmap
    /// marking: the finger is still at the heap bottom, so the concurrent
    /// phase will scan whatever this discovers.
    fn scan_root_region(&self, index: u32) {
        let region = self.heap.region(index);
        let top = region.top();
        let mut cur = region.bottom();
        while cur < top {
            let obj = ObjRef::from_addr(cur);
            unsafe {
                let header = obj.header();
                let payload = obj.payload_start();
                for i in 0..header.payload_words() {
                    let word = ((payload + i * WORD_SIZE) as *const usize).read();
                    if word != 0 && self.heap.contains(word) {
                        self.mark_in_next_bitmap(ObjRef::from_addr(word));
                    }
                }
                cur += header.size_words() * WORD_SIZE;
            }
        }
    }

    /// The concurrent phase proper: run the marking gang to a tentative
    /// transitive closure. Returns with either marking complete,
    /// `has_aborted`, or after an in-flight overflow restart.
    pub fn mark_from_roots(&self) {
        if self.has_aborted() {
            self.drain_to_idle();
            return;
        }
        self.restart_for_overflow.store(false, Ordering::Release);
        let active = self.calc_active_marking_workers();
        self.set_concurrency_and_phase(active, true);
        if self.options.verbose {
            eprintln!("[concmark] concurrent mark with {} workers", active);
        }
        self.run_marking_gang(active, GangMode::Concurrent);
        if self.has_aborted() {
            self.drain_to_idle();
        }
    }

    /// The remark pause: drain residual SATB buffers and finish marking
    /// with mutators stopped. On overflow, schedules another concurrent
    /// round (`restart_for_overflow`); otherwise processes weak references
    /// and swaps the bitmaps.
    pub fn checkpoint_roots_final(&self, clear_all_soft_refs: bool) {
        if self.has_aborted() {
            self.drain_to_idle();
            return;
        }
        let start = Instant::now();
        let active = self.calc_active_marking_workers();
        self.set_concurrency_and_phase(active, false);
        self.run_marking_gang(active, GangMode::Remark);

        let mut finished = !self.has_overflown();
        if finished {
            debug_assert!(!self.satb.completed_buffers_exist());
            self.weak_refs_work(clear_all_soft_refs);
            // Reference processing drains serially and may itself overflow.
            finished = !self.has_overflown();
        }

        if finished {
            if self.options.verify {
                self.verify_after_remark();
            }
            self.satb.set_active(false);
            self.clear_concurrent_marking_in_progress();
            self.swap_mark_bitmaps();
            self.phase.store(MarkPhase::Cleanup, Ordering::Release);
            if self.options.verbose {
                eprintln!("[concmark] remark complete");
            }
        } else {
            // We overflowed. Restart concurrent marking; the marking state
            // is cleared now so the next round starts from the bitmap.
            self.restart_for_overflow.store(true, Ordering::Release);
            self.reset_marking_state(true);
            if self.options.verbose {
                eprintln!("[concmark] remark overflow, restarting concurrent mark");
            }
        }
        self.remark_times_ms
            .lock()
            .add(start.elapsed().as_secs_f64() * 1000.0);
    }

    /// The cleanup pause: aggregate per-region liveness from the completed
    /// marking and queue fully dead regions for the collector.
    pub fn cleanup(&self) {
        if self.has_aborted() {
            self.drain_to_idle();
            return;
        }
        assert_eq!(self.phase(), MarkPhase::Cleanup);
        let start = Instant::now();

        let prev = self.prev_mark_bitmap();
        let claim = AtomicUsize::new(0);
        let reclaimable = Mutex::new(Vec::new());
        let mut pool = self.workers.lock();
        pool.scoped(|scope| {
            for _ in 0..self.options.num_workers {
                scope.execute(|| loop {
                    let index = claim.fetch_add(1, Ordering::Relaxed);
                    if index >= self.heap.num_regions() {
                        break;
                    }
                    let region = self.heap.region(index as u32);
                    let mut live_bytes = region.top() - region.top_at_mark_start();
                    prev.visit_marked_range(
                        region.bottom(),
                        region.top_at_mark_start(),
                        |addr| unsafe {
                            live_bytes += ObjRef::from_addr(addr).size_words() * WORD_SIZE;
                        },
                    );
                    region.set_marked_bytes(live_bytes);
                    if live_bytes == 0 && region.used() > 0 {
                        reclaimable.lock().push(region.index());
                    }
                });
            }
        });
        drop(pool);

        let mut reclaimable = reclaimable.into_inner();
        reclaimable.sort_unstable();
        if self.options.verbose {
            let live: usize = self.heap.regions().map(|r| r.marked_bytes()).sum();
            eprintln!(
                "[concmark] cleanup: {} live, {} fully dead regions",
                formatted_size(live),
                reclaimable.len()
            );
        }
        *self.cleanup_list.lock() = reclaimable;

        self.cleanup_times_ms
            .lock()
            .add(start.elapsed().as_secs_f64() * 1000.0);
    }

    /// Concurrent tail of cleanup: prepare for the next cycle and go idle.
    pub fn complete_cleanup(&self) {
        if self.has_aborted() {
            self.drain_to_idle();
            return;
        }
        self.cleanup_for_next_mark();
    }

    /// Clear the next bitmap for the coming cycle, yielding to safepoint
    /// requests, then go idle.
    pub fn cleanup_for_next_mark(&self) {
        self.clear_bitmap(self.next_mark_bitmap(), true);
        self.heap.reset_top_at_mark_start();
        self.set_non_marking_state();
        if self.options.verbose {
            eprintln!("[concmark] cycle complete");
        }
    }

    /// Clear the prev bitmap with the worker gang. Safepoint only; marks on
    /// it are dead at that point.
    pub fn clear_prev_bitmap(&self) {
        self.clear_bitmap(self.prev_mark_bitmap(), false);
    }

    fn clear_bitmap(&self, bitmap: &MarkBitmap, may_yield: bool) {
        let claim = AtomicUsize::new(0);
        let mut pool = self.workers.lock();
        pool.scoped(|scope| {
            for _ in 0..self.options.num_workers {
                scope.execute(|| loop {
                    let index = claim.fetch_add(1, Ordering::Relaxed);
                    if index >= self.heap.num_regions() {
                        break;
                    }
                    let region = self.heap.region(index as u32);
                    bitmap.clear_range(region.bottom(), region.end());
                    if may_yield {
                        self.do_yield_check();
                        if self.has_aborted() {
                            break;
                        }
                    }
                });
            }
        });
    }

    /// Abandon the current cycle (e.g. a full collection took over). Marking
    /// tasks notice at their next clock call and unwind; the phase that owns
    /// the gang then drains the engine back to `Idle`. Sticky until the next
    /// cycle starts.
    pub fn abort(&self) {
        if self.phase() == MarkPhase::Idle || self.has_aborted() {
            return;
        }
        self.has_aborted.store(true, Ordering::SeqCst);
        self.first_overflow_barrier_sync.abort();
        self.second_overflow_barrier_sync.abort();
        self.root_regions.abort();
        self.satb.abandon_partial_marking();
        if self.options.verbose {
            eprintln!("[concmark] marking aborted");
        }
    }

    /// Orderly teardown; aborts and drains a cycle still in flight.
    pub fn shutdown(&self) {
        if self.phase() != MarkPhase::Idle {
            self.abort();
            self.drain_to_idle();
        }
    }

    // -- gangs ---------------------------------------------------------------

    fn run_marking_gang(&self, active: usize, mode: GangMode) {
        let mut queues = Vec::with_capacity(active);
        let mut stealers = Vec::with_capacity(active);
        for _ in 0..active {
            let (queue, stealer) = LocalTaskQueue::new(self.options.local_queue_capacity);
            queues.push(queue);
            stealers.push(stealer);
        }
        let ctx = GangContext {
            cm: self,
            queues: TaskQueueSet::new(stealers),
            terminator: Terminator::new(active),
        };

        let mut pool = self.workers.lock();
        pool.scoped(|scope| {
            for (worker_id, queue) in queues.into_iter().enumerate() {
                let ctx = &ctx;
                scope.execute(move || {
                    let mut task = MarkingTask::new(worker_id, queue, ctx);
                    match mode {
                        GangMode::Concurrent => ctx.cm.concurrent_mark_worker(&mut task),
                        GangMode::Remark => ctx.cm.remark_worker(&mut task),
                    }
                    ctx.cm.record_task_stats(&task);
                });
            }
        });
    }

    fn concurrent_mark_worker(&self, task: &mut MarkingTask) {
        if self.has_aborted() {
            return;
        }
        loop {
            task.do_marking_step(self.options.step_duration_ms, true, false);
            self.do_yield_check();
            if self.has_aborted() || !task.has_aborted() {
                break;
            }
        }
    }

    fn remark_worker(&self, task: &mut MarkingTask) {
        loop {
            task.do_marking_step(1.0e9, true, false);
            // An overflow aborts remark entirely; concurrent marking will
            // restart instead. Leaving is only safe once this worker has
            // passed the overflow barriers (or never needs to): a peer that
            // flagged the overflow is parked in the first gate.
            if !task.has_aborted() || self.has_aborted() || task.synced_on_overflow() {
                break;
            }
        }
    }

    fn record_task_stats(&self, task: &MarkingTask) {
        let stats = task.stats();
        let accum = &self.accum_task_time_ms[stats.worker_id];
        accum.store(
            accum.load(Ordering::Relaxed) + stats.elapsed_ms,
            Ordering::Relaxed,
        );
        self.last_task_stats.lock().push(stats);
    }

    // -- reference processing ------------------------------------------------

    fn weak_refs_work(&self, clear_all_soft_refs: bool) {
        let Some(processor) = self.ref_processor.clone() else {
            return;
        };
        // Serial discipline: one task, no termination gang, no barriers.
        let (queue, stealer) = LocalTaskQueue::new(self.options.local_queue_capacity);
        let ctx = GangContext {
            cm: self,
            queues: TaskQueueSet::new(vec![stealer]),
            terminator: Terminator::new(1),
        };
        let mut task = MarkingTask::new(0, queue, &ctx);

        struct DrainContext<'e, 't> {
            cm: &'e ConcurrentMark,
            task: &'t mut MarkingTask<'e>,
        }
        impl RefProcContext for DrainContext<'_, '_> {
            fn is_alive(&self, obj: ObjRef) -> bool {
                self.cm.is_live(obj)
            }
            fn keep_alive(&mut self, obj: ObjRef) {
                self.task.keep_alive_and_drain(obj);
            }
            fn complete_drain(&mut self) {
                self.task.do_marking_step(1.0e9, true, true);
            }
        }

        let mut drain_ctx = DrainContext { cm: self, task: &mut task };
        processor.process_discovered_references(clear_all_soft_refs, &mut drain_ctx);
        drain_ctx.task.do_marking_step(1.0e9, true, true);
    }

    // -- verification --------------------------------------------------------

    /// Invariant checks after a successful remark, before the bitmap swap.
    fn verify_after_remark(&self) {
        assert!(
            self.global_mark_stack.is_empty(),
            "global mark stack not empty after remark"
        );
        assert!(
            !self.satb.completed_buffers_exist(),
            "unprocessed SATB buffers after remark"
        );
        assert!(self.out_of_regions(), "unclaimed regions after remark");

        let next = self.next_mark_bitmap();
        for region in self.heap.regions() {
            let tams = region.top_at_mark_start();
            next.visit_marked_range(region.bottom(), tams, |addr| {
                let obj = ObjRef::from_addr(addr);
                let end = unsafe { obj.end() };
                assert!(
                    end <= region.top(),
                    "marked object {:#x} overruns its region",
                    addr
                );
            });
            assert!(
                next.is_clear_range(tams, region.end()),
                "marks above TAMS in region {}",
                region.index()
            );
        }
    }

    // -- reporting -----------------------------------------------------------

    pub fn print_summary(&self) {
        let init = self.init_times_ms.lock();
        let remark = self.remark_times_ms.lock();
        let cleanup = self.cleanup_times_ms.lock();
        eprintln!("[concmark] summary:");
        eprintln!(
            "  init:    {:>4} pauses, avg {:.3}ms, max {:.3}ms",
            init.num(),
            init.avg(),
            init.maximum()
        );
        eprintln!(
            "  remark:  {:>4} pauses, avg {:.3}ms, max {:.3}ms",
            remark.num(),
            remark.avg(),
            remark.maximum()
        );
        eprintln!(
            "  cleanup: {:>4} pauses, avg {:.3}ms, max {:.3}ms",
            cleanup.num(),
            cleanup.avg(),
            cleanup.maximum()
        );
        let total: f64 = self
            .accum_task_time_ms
            .iter()
            .map(|a| a.load(Ordering::Relaxed))
            .sum();
        eprintln!("  task time: {:.3}ms across {} workers", total, self.options.num_workers);
    }
}
