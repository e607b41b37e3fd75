//! Snapshot-at-the-beginning buffer plumbing.
//!
//! Mutator-side write barriers log overwritten references into thread-local
//! buffers and hand completed buffers to this set; marking tasks pull them
//! and re-grey every logged reference. The engine only depends on the pull
//! side; how buffers are produced is the embedder's business.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::object::ObjRef;

pub struct SatbQueueSet {
    completed: Mutex<VecDeque<Box<[ObjRef]>>>,
    n_completed: AtomicUsize,
    active: AtomicBool,
}

impl SatbQueueSet {
    pub fn new() -> Self {
        Self {
            completed: Mutex::new(VecDeque::new()),
            n_completed: AtomicUsize::new(0),
            active: AtomicBool::new(false),
        }
    }

    /// Whether barriers should currently log. Toggled by the engine at the
    /// cycle boundaries.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Producer side: hand over a completed buffer of overwritten refs.
    /// Buffers enqueued while marking is inactive are dropped.
    pub fn enqueue_completed_buffer(&self, buffer: Box<[ObjRef]>) {
        if !self.is_active() || buffer.is_empty() {
            return;
        }
        let mut completed = self.completed.lock();
        completed.push_back(buffer);
        self.n_completed.store(completed.len(), Ordering::Release);
    }

    /// Consumer side: pull the next completed buffer, if any.
    pub fn drain_next_buffer(&self) -> Option<Box<[ObjRef]>> {
        let mut completed = self.completed.lock();
        let buffer = completed.pop_front();
        self.n_completed.store(completed.len(), Ordering::Release);
        buffer
    }

    /// Racy hint used by the marking clock to decide whether to go process
    /// buffers.
    pub fn completed_buffers_exist(&self) -> bool {
        self.n_completed.load(Ordering::Acquire) > 0
    }

    /// Drop all pending buffers, e.g. when marking is aborted.
    pub fn abandon_partial_marking(&self) {
        let mut completed = self.completed.lock();
        completed.clear();
        self.n_completed.store(0, Ordering::Release);
    }
}

impl Default for SatbQueueSet {
    fn default() -> Self {
        Self::new()
    }
}
