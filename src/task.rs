//! Marking tasks.
//!
//! One task per gang worker. A task repeatedly pops grey entries, scans
//! them, and greys the references it discovers, interleaving four work
//! sources: SATB buffers, its own queue, the global mark stack, and fresh
//! heap regions claimed through the global finger. Every step runs against
//! a soft time budget and checks a clock at bounded intervals so aborts,
//! yields and overflow restarts propagate promptly.

use rand::rngs::SmallRng;
use std::time::Instant;

use crate::entry::TaskEntry;
use crate::mark::ConcurrentMark;
use crate::mark_stack::ENTRIES_PER_CHUNK;
use crate::object::ObjRef;
use crate::region::HeapRegion;
use crate::sync::Terminator;
use crate::task_queue::{steal_rng, LocalTaskQueue, TaskQueueSet};
use crate::utils::{TruncatedSeq, WORD_SIZE};

/// Element words scanned per array slice before the remainder is pushed
/// back as a continuation entry.
pub(crate) const OBJ_ARRAY_SLICE_WORDS: usize = 512;

/// Entries left in the local queue by a partial drain.
const LOCAL_DRAIN_TARGET: usize = 64;

/// Past-step window for the time-target correction.
const STEP_DIFF_WINDOW: usize = 10;

/// Shared state of one marking gang run.
pub(crate) struct GangContext<'a> {
    pub cm: &'a ConcurrentMark,
    pub queues: TaskQueueSet,
    pub terminator: Terminator,
}

/// Counters a task leaves behind for reporting.
#[derive(Clone, Debug, Default)]
pub struct TaskStats {
    pub worker_id: usize,
    pub refs_reached: usize,
    pub words_scanned: usize,
    pub steps: usize,
    pub elapsed_ms: f64,
    pub termination_ms: f64,
}

pub(crate) struct MarkingTask<'a> {
    worker_id: usize,
    cm: &'a ConcurrentMark,
    gang: &'a GangContext<'a>,
    queue: LocalTaskQueue,
    rng: SmallRng,

    curr_region: Option<u32>,
    local_finger: usize,
    region_limit: usize,

    words_scanned: usize,
    words_scanned_limit: usize,
    real_words_scanned_limit: usize,
    refs_reached: usize,
    refs_reached_limit: usize,
    real_refs_reached_limit: usize,

    has_aborted: bool,
    has_timed_out: bool,
    draining_satb: bool,
    synced_on_overflow: bool,
    concurrent: bool,

    step_start: Instant,
    time_target_ms: f64,
    step_diffs_ms: TruncatedSeq,
    steps: usize,
    elapsed_ms: f64,
    termination_ms: f64,
}

impl<'a> MarkingTask<'a> {
    pub fn new(worker_id: usize, queue: LocalTaskQueue, gang: &'a GangContext<'a>) -> Self {
        let cm = gang.cm;
        let words_period = cm.options().words_scanned_period;
        let refs_period = cm.options().refs_reached_period;
        Self {
            worker_id,
            cm,
            gang,
            queue,
            rng: steal_rng(worker_id),
            curr_region: None,
            local_finger: 0,
            region_limit: 0,
            words_scanned: 0,
            words_scanned_limit: words_period,
            real_words_scanned_limit: words_period,
            refs_reached: 0,
            refs_reached_limit: refs_period,
            real_refs_reached_limit: refs_period,
            has_aborted: false,
            has_timed_out: false,
            draining_satb: false,
            synced_on_overflow: false,
            concurrent: false,
            step_start: Instant::now(),
            time_target_ms: 0.0,
            step_diffs_ms: TruncatedSeq::new(STEP_DIFF_WINDOW),
            steps: 0,
            elapsed_ms: 0.0,
            termination_ms: 0.0,
        }
    }

    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted
    }

    /// Whether the last step went through the two overflow barriers. The
    /// remark loop must not exit before its worker has; a peer may already
    /// be waiting in the first gate.
    #[inline]
    pub fn synced_on_overflow(&self) -> bool {
        self.synced_on_overflow
    }

    #[inline]
    fn set_has_aborted(&mut self) {
        self.has_aborted = true;
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            worker_id: self.worker_id,
            refs_reached: self.refs_reached,
            words_scanned: self.words_scanned,
            steps: self.steps,
            elapsed_ms: self.elapsed_ms,
            termination_ms: self.termination_ms,
        }
    }

    fn elapsed_step_ms(&self) -> f64 {
        self.step_start.elapsed().as_secs_f64() * 1000.0
    }

    // -- limits and the clock ------------------------------------------------

    fn recalculate_limits(&mut self) {
        let opts = self.cm.options();
        self.real_words_scanned_limit = self.words_scanned + opts.words_scanned_period;
        self.words_scanned_limit = self.real_words_scanned_limit;
        self.real_refs_reached_limit = self.refs_reached + opts.refs_reached_period;
        self.refs_reached_limit = self.real_refs_reached_limit;
    }

    /// After an expensive operation, pull the next clock call closer.
    fn decrease_limits(&mut self) {
        let opts = self.cm.options();
        self.words_scanned_limit = self
            .real_words_scanned_limit
            .saturating_sub(3 * opts.words_scanned_period / 4);
        self.refs_reached_limit = self
            .real_refs_reached_limit
            .saturating_sub(3 * opts.refs_reached_period / 4);
    }

    #[inline]
    fn check_limits(&mut self) {
        if self.words_scanned >= self.words_scanned_limit
            || self.refs_reached >= self.refs_reached_limit
        {
            self.reached_limit();
        }
    }

    fn reached_limit(&mut self) {
        self.regular_clock_call();
    }

    /// Called at bounded intervals during a step. Checks every condition
    /// that should make the step wind down.
    fn regular_clock_call(&mut self) {
        if self.has_aborted {
            return;
        }
        self.recalculate_limits();

        // (1) A global stack overflow was flagged.
        if self.cm.has_overflown() {
            self.set_has_aborted();
            return;
        }
        // (2) Marking was aborted from outside.
        if self.cm.has_aborted() {
            self.set_has_aborted();
            return;
        }
        // (3) The environment wants us to yield; abort the step, the worker
        // loop yields and restarts it.
        if self.cm.should_yield() {
            self.set_has_aborted();
            return;
        }
        // (4) Time quota.
        if self.elapsed_step_ms() > self.time_target_ms {
            self.set_has_aborted();
            self.has_timed_out = true;
            return;
        }
        // (5) SATB buffers piled up; go process them. Not while we already
        // are, and only concurrently (remark drains them up front).
        if self.concurrent && !self.draining_satb && self.cm.satb().completed_buffers_exist() {
            self.set_has_aborted();
        }
    }

    // -- greying -------------------------------------------------------------

    /// Would the bitmap scan still reach `addr`, or has every finger that
    /// could find it already passed? Only in the latter case must the
    /// object be enqueued.
    fn is_below_finger(&self, addr: usize, global_finger: usize) -> bool {
        if self.curr_region.is_some() && addr >= self.local_finger && addr < self.region_limit {
            // Our own scan of the current region will get there.
            return false;
        }
        addr < global_finger
    }

    fn make_reference_grey(&mut self, obj: ObjRef, region: &HeapRegion) {
        if !self.cm.mark_in_next_bitmap_in(region, obj) {
            return;
        }
        self.refs_reached += 1;
        let global_finger = self.cm.finger();
        if self.is_below_finger(obj.addr(), global_finger) {
            self.push(TaskEntry::from_obj(obj));
        }
    }

    /// Filter and grey one discovered reference.
    fn deal_with_reference(&mut self, addr: usize) {
        if addr == 0 {
            return;
        }
        let heap = self.cm.heap();
        if !heap.contains(addr) {
            return;
        }
        let region = heap.addr_to_region(addr);
        if addr >= region.top_at_mark_start() {
            // Allocated since mark start; implicitly live.
            return;
        }
        self.make_reference_grey(ObjRef::from_addr(addr), region);
    }

    // -- scanning ------------------------------------------------------------

    fn scan_task_entry(&mut self, entry: TaskEntry) {
        debug_assert!(!entry.is_null());
        if entry.is_array_slice() {
            self.words_scanned += self.process_slice(entry.slice());
        } else {
            let obj = entry.obj();
            unsafe {
                if obj.is_ref_array() && obj.header().payload_words() > 2 * OBJ_ARRAY_SLICE_WORDS {
                    self.words_scanned += self.process_obj_array(obj);
                } else {
                    self.words_scanned += self.scan_object(obj);
                }
            }
        }
        self.check_limits();
    }

    /// Visit every reference slot of a plain object (or a small array).
    unsafe fn scan_object(&mut self, obj: ObjRef) -> usize {
        let header = obj.header();
        let payload = obj.payload_start();
        for i in 0..header.payload_words() {
            let word = ((payload + i * WORD_SIZE) as *const usize).read();
            if word != 0 {
                self.deal_with_reference(word);
            }
        }
        header.size_words()
    }

    /// Start slicing a large reference array: scan the first stride, push
    /// the continuation.
    fn process_obj_array(&mut self, obj: ObjRef) -> usize {
        let total_words = unsafe { obj.size_words() };
        self.process_array_slice(obj, obj.addr(), total_words)
    }

    /// Resume a continuation. The owning array is found by walking the
    /// bitmap backwards: its bit is set before any slice of it is pushed,
    /// and an array's interior holds no object starts.
    fn process_slice(&mut self, slice: usize) -> usize {
        let heap = self.cm.heap();
        let region = heap.addr_to_region(slice);
        let start = self
            .cm
            .next_mark_bitmap()
            .find_last_marked_addr(region.bottom(), slice + WORD_SIZE)
            .expect("array slice without a marked array start");
        let obj = ObjRef::from_addr(start);
        debug_assert!(unsafe { obj.is_ref_array() });
        debug_assert!(slice < unsafe { obj.end() });

        let already_scanned = (slice - start) / WORD_SIZE;
        let remaining = unsafe { obj.size_words() } - already_scanned;
        self.process_array_slice(obj, slice, remaining)
    }

    fn process_array_slice(&mut self, obj: ObjRef, from: usize, remaining_words: usize) -> usize {
        let words_to_scan = remaining_words.min(OBJ_ARRAY_SLICE_WORDS);
        if remaining_words > OBJ_ARRAY_SLICE_WORDS {
            self.push(TaskEntry::from_slice(from + OBJ_ARRAY_SLICE_WORDS * WORD_SIZE));
        }
        self.scan_array_range(obj, from, from + words_to_scan * WORD_SIZE);
        words_to_scan
    }

    /// Visit array elements overlapping `[from, to)`, skipping the header
    /// word if the range covers it.
    fn scan_array_range(&mut self, obj: ObjRef, from: usize, to: usize) {
        let lo = from.max(obj.payload_start());
        let hi = to.min(unsafe { obj.end() });
        let mut addr = lo;
        while addr < hi {
            let word = unsafe { (addr as *const usize).read() };
            if word != 0 {
                self.deal_with_reference(word);
            }
            addr += WORD_SIZE;
        }
    }

    // -- queue transfers -----------------------------------------------------

    /// Push onto the local queue, spilling one chunk to the global stack if
    /// it is full. A rejected spill raises the global overflow flag and the
    /// spilled entries are dropped; the restart re-derives them from the
    /// bitmap.
    fn push(&mut self, entry: TaskEntry) {
        if !self.queue.push(entry) {
            self.move_entries_to_global_stack();
            let pushed = self.queue.push(entry);
            debug_assert!(pushed, "local queue still full after spilling a chunk");
        }
    }

    fn move_entries_to_global_stack(&mut self) {
        let mut buffer = [TaskEntry::null(); ENTRIES_PER_CHUNK];
        let mut n = 0;
        while n < ENTRIES_PER_CHUNK {
            match self.queue.pop() {
                Some(entry) => {
                    buffer[n] = entry;
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            if !self.cm.mark_stack_push(&buffer) {
                self.set_has_aborted();
            }
        }
        // Chunk transfers are expensive; make the next clock call sooner.
        self.decrease_limits();
    }

    fn get_entries_from_global_stack(&mut self) -> bool {
        let mut buffer = [TaskEntry::null(); ENTRIES_PER_CHUNK];
        if !self.cm.mark_stack_pop(&mut buffer) {
            return false;
        }
        for entry in buffer {
            if entry.is_null() {
                break;
            }
            self.push(entry);
        }
        self.decrease_limits();
        true
    }

    // -- draining ------------------------------------------------------------

    fn drain_local_queue(&mut self, partially: bool) {
        if self.has_aborted {
            return;
        }
        let target_size = if partially {
            (self.queue.max_elems() / 3).min(LOCAL_DRAIN_TARGET)
        } else {
            0
        };
        if self.queue.len() > target_size {
            while let Some(entry) = self.queue.pop() {
                self.scan_task_entry(entry);
                if self.has_aborted || self.queue.len() <= target_size {
                    break;
                }
            }
        }
    }

    fn drain_global_stack(&mut self, partially: bool) {
        if self.has_aborted {
            return;
        }
        // Policy: the local queue is drained before touching the global
        // stack, so transfers land in a near-empty queue.
        let target_size = if partially {
            self.cm.partial_mark_stack_size_target()
        } else {
            0
        };
        while !self.has_aborted && self.cm.mark_stack_size() > target_size {
            if !self.get_entries_from_global_stack() {
                break;
            }
            self.drain_local_queue(partially);
        }
    }

    fn drain_satb_buffers(&mut self) {
        if self.has_aborted {
            return;
        }
        self.draining_satb = true;
        while !self.has_aborted {
            match self.cm.satb().drain_next_buffer() {
                Some(buffer) => {
                    for obj in buffer.iter() {
                        self.deal_with_reference(obj.addr());
                    }
                    self.regular_clock_call();
                }
                None => break,
            }
        }
        self.draining_satb = false;
        self.decrease_limits();
    }

    // -- region scanning -----------------------------------------------------

    fn setup_for_region(&mut self, index: u32) {
        let region = self.cm.heap().region(index);
        self.curr_region = Some(index);
        self.local_finger = region.bottom();
        // The region may be empty; the scan loop notices and gives it up.
        self.region_limit = region.top_at_mark_start();
    }

    fn giveup_current_region(&mut self) {
        self.clear_region_fields();
    }

    fn clear_region_fields(&mut self) {
        self.curr_region = None;
        self.local_finger = 0;
        self.region_limit = 0;
    }

    /// Scan marked objects in `[local_finger, region_limit)`. Re-queries the
    /// bitmap on every step so bits set concurrently ahead of the finger are
    /// found, which is what permits skipping the enqueue for them.
    fn scan_current_region(&mut self) {
        debug_assert!(self.curr_region.is_some());
        loop {
            if self.local_finger >= self.region_limit {
                // Empty region, or scanned to the limit.
                self.giveup_current_region();
                self.regular_clock_call();
                return;
            }
            let next = self
                .cm
                .next_mark_bitmap()
                .get_next_marked_addr(self.local_finger, self.region_limit);
            let addr = match next {
                Some(addr) => addr,
                None => {
                    self.giveup_current_region();
                    self.regular_clock_call();
                    return;
                }
            };
            debug_assert!(addr < self.cm.finger(), "scanning above the global finger");

            self.local_finger = addr;
            let obj = ObjRef::from_addr(addr);
            self.scan_task_entry(TaskEntry::from_obj(obj));
            self.drain_local_queue(true);
            self.drain_global_stack(true);

            if self.has_aborted {
                // Keep the region; the next step resumes at the finger and
                // rescans the interrupted object, which is idempotent.
                return;
            }
            self.local_finger = addr + unsafe { obj.size_words() } * WORD_SIZE;
        }
    }

    // -- termination ---------------------------------------------------------

    fn offer_termination(&mut self) -> bool {
        // The exit capability handed to the terminator: everything that
        // should pull an idle worker back out of the protocol. Pure
        // observation; the clock below turns it into task state.
        let cm = self.cm;
        let concurrent = self.concurrent;
        let step_start = self.step_start;
        let time_target_ms = self.time_target_ms;
        let finished = self.gang.terminator.offer_termination(|| {
            cm.has_overflown()
                || cm.has_aborted()
                || cm.should_yield()
                || !cm.mark_stack_is_empty()
                || (concurrent && cm.satb().completed_buffers_exist())
                || step_start.elapsed().as_secs_f64() * 1000.0 > time_target_ms
        });
        if !finished {
            // Record why we left; sets the abort and timeout flags.
            self.regular_clock_call();
        }
        finished
    }

    // -- the step ------------------------------------------------------------

    /// One marking step, bounded by `time_target_ms`. With `do_termination`
    /// the step ends in the termination protocol once no work is left.
    /// `is_serial` steps run single-threaded and skip the terminator and
    /// the overflow barriers.
    pub fn do_marking_step(&mut self, time_target_ms: f64, do_termination: bool, is_serial: bool) {
        self.step_start = Instant::now();
        self.steps += 1;
        self.has_aborted = false;
        self.has_timed_out = false;
        self.draining_satb = false;
        self.synced_on_overflow = false;
        self.concurrent = self.cm.concurrent();

        // Aim below the raw target by the typical overshoot of past steps.
        self.time_target_ms = time_target_ms - self.step_diffs_ms.median();
        self.recalculate_limits();

        self.drain_satb_buffers();
        self.drain_local_queue(true);
        self.drain_global_stack(true);

        while !self.has_aborted {
            if self.curr_region.is_none() {
                while !self.has_aborted && self.curr_region.is_none() && !self.cm.out_of_regions() {
                    if let Some(index) = self.cm.claim_region(self.worker_id) {
                        self.setup_for_region(index);
                    }
                    // Claiming stays cheap so the clock keeps ticking even
                    // over runs of empty regions.
                    self.regular_clock_call();
                }
            }
            if self.curr_region.is_none() {
                break;
            }
            self.scan_current_region();
            self.drain_local_queue(true);
            self.drain_global_stack(true);
        }

        if !self.has_aborted {
            // Out of regions. Reduce the SATB backlog so remark has less to
            // do; the global stack cannot be assumed empty, peers still push.
            debug_assert!(self.cm.out_of_regions());
            self.drain_satb_buffers();
        }
        self.drain_local_queue(false);
        self.drain_global_stack(false);

        // Work stealing: everything of ours is done, try to relieve peers.
        if do_termination && !self.has_aborted {
            while !self.has_aborted {
                match self.gang.queues.steal(self.worker_id, &self.queue, &mut self.rng) {
                    Some(entry) => {
                        self.scan_task_entry(entry);
                        self.drain_local_queue(false);
                        self.drain_global_stack(false);
                    }
                    None => break,
                }
            }
        }

        if do_termination && !self.has_aborted {
            let termination_start = Instant::now();
            let finished = is_serial || self.offer_termination();
            self.termination_ms += termination_start.elapsed().as_secs_f64() * 1000.0;
            if finished {
                if !is_serial && self.worker_id == 0 && self.concurrent {
                    // Concurrent marking is complete; let task 0 flip the
                    // flag before the remark pause can observe it.
                    self.cm.clear_concurrent_marking_in_progress();
                }
            } else {
                // More work appeared somewhere. Abort the step; the worker
                // loop restarts it.
                self.set_has_aborted();
            }
        }

        let elapsed_ms = self.elapsed_step_ms();
        self.elapsed_ms += elapsed_ms;

        if self.has_aborted {
            if self.has_timed_out {
                self.step_diffs_ms.add(elapsed_ms - self.time_target_ms);
            }
            if self.cm.has_overflown() {
                // Global overflow: quiesce everyone behind the first
                // barrier, re-initialize, and resume past the second.
                if !is_serial {
                    self.cm.enter_first_sync_barrier(self.worker_id);
                }
                self.clear_region_fields();
                self.queue.set_empty();
                if !is_serial {
                    self.cm.enter_second_sync_barrier(self.worker_id);
                    self.synced_on_overflow = true;
                }
            }
        }
    }

    /// Serial helper used during reference processing: grey one object and
    /// drain everything it uncovers.
    pub fn keep_alive_and_drain(&mut self, obj: ObjRef) {
        self.deal_with_reference(obj.addr());
        self.drain_local_queue(false);
        self.drain_global_stack(false);
    }
}
