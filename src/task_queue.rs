//! Per-worker task queues.
//!
//! Each marking worker owns the push/pop side of a LIFO deque; peers steal
//! batches from the other end. The deque itself is unbounded, so the owner
//! enforces the capacity: `push` reports failure at the bound and the owner
//! reacts by flushing a chunk's worth of entries to the global mark stack.

use crossbeam_deque::{Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::entry::TaskEntry;

pub struct LocalTaskQueue {
    worker: Worker<TaskEntry>,
    max_elems: usize,
}

impl LocalTaskQueue {
    pub fn new(max_elems: usize) -> (Self, Stealer<TaskEntry>) {
        assert!(max_elems > 0);
        let worker = Worker::new_lifo();
        let stealer = worker.stealer();
        (Self { worker, max_elems }, stealer)
    }

    /// Owner-side push. `false` means the queue is at capacity and the
    /// caller must make room (by moving entries to the global stack).
    #[inline]
    pub fn push(&self, entry: TaskEntry) -> bool {
        debug_assert!(!entry.is_null());
        if self.worker.len() >= self.max_elems {
            return false;
        }
        self.worker.push(entry);
        true
    }

    #[inline]
    pub fn pop(&self) -> Option<TaskEntry> {
        self.worker.pop()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.worker.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    #[inline]
    pub fn max_elems(&self) -> usize {
        self.max_elems
    }

    /// Discard everything, e.g. while re-initializing after an overflow.
    pub fn set_empty(&self) {
        while self.worker.pop().is_some() {}
    }

    pub(crate) fn worker(&self) -> &Worker<TaskEntry> {
        &self.worker
    }
}

/// The steal side of every queue in a marking gang.
pub struct TaskQueueSet {
    stealers: Vec<Stealer<TaskEntry>>,
}

impl TaskQueueSet {
    pub fn new(stealers: Vec<Stealer<TaskEntry>>) -> Self {
        Self { stealers }
    }

    pub fn len(&self) -> usize {
        self.stealers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stealers.is_empty()
    }

    /// Attempt to steal one entry for `queue`, probing random victims. A
    /// successful steal moves a batch and returns one entry, like the
    /// sweeper gangs do.
    pub fn steal(
        &self,
        thief_id: usize,
        queue: &LocalTaskQueue,
        rng: &mut SmallRng,
    ) -> Option<TaskEntry> {
        let n = self.stealers.len();
        if n == 1 {
            return None;
        }
        let range = Uniform::new(0, n);

        for _ in 0..2 * n {
            let mut victim_id = thief_id;
            while victim_id == thief_id {
                victim_id = range.sample(rng);
            }

            let stealer = &self.stealers[victim_id];
            loop {
                match stealer.steal_batch_and_pop(queue.worker()) {
                    Steal::Empty => break,
                    Steal::Success(entry) => return Some(entry),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }
}

/// Per-worker RNG driving victim selection.
pub fn steal_rng(worker_id: usize) -> SmallRng {
    const INIT_SEED: u64 = 17;
    SmallRng::seed_from_u64(INIT_SEED + worker_id as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjRef;

    fn entry(i: usize) -> TaskEntry {
        TaskEntry::from_obj(ObjRef::from_addr((i + 1) * 8))
    }

    #[test]
    fn push_bound_and_lifo_pop() {
        let (queue, _stealer) = LocalTaskQueue::new(4);
        for i in 0..4 {
            assert!(queue.push(entry(i)));
        }
        assert!(!queue.push(entry(4)));
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop(), Some(entry(3)));
        assert!(queue.push(entry(4)));
        queue.set_empty();
        assert!(queue.is_empty());
    }

    #[test]
    fn steal_moves_entries_between_queues() {
        let (victim, victim_stealer) = LocalTaskQueue::new(1024);
        let (thief, thief_stealer) = LocalTaskQueue::new(1024);
        for i in 0..100 {
            assert!(victim.push(entry(i)));
        }
        let set = TaskQueueSet::new(vec![victim_stealer, thief_stealer]);
        let mut rng = steal_rng(1);

        let stolen = set.steal(1, &thief, &mut rng);
        assert!(stolen.is_some());
        let total = thief.len() + victim.len() + 1;
        assert_eq!(total, 100);
    }

    #[test]
    fn single_queue_has_no_victims() {
        let (queue, stealer) = LocalTaskQueue::new(16);
        queue.push(entry(0));
        let set = TaskQueueSet::new(vec![stealer]);
        let mut rng = steal_rng(0);
        assert!(set.steal(0, &queue, &mut rng).is_none());
    }
}
