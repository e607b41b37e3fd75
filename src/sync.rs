//! Gang synchronization: termination detection, the overflow barrier gates,
//! and the cooperative yield capability.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Quiescence detector for a gang of marking workers.
///
/// Workers with nothing left to do offer termination; the offer count
/// reaching the gang size is terminal and every participant observes it.
/// While waiting, a worker polls its `should_exit` capability between naps:
/// a raised abort or overflow flag, a pending yield, or fresh work on the
/// global stack takes it back out of the protocol to resume marking.
/// Deregistering is a compare-exchange that refuses to fire once the
/// terminal count has been reached, so no worker can sneak back to work
/// after a peer has already declared the gang idle.
pub struct Terminator {
    n_workers: usize,
    offered: AtomicUsize,
}

impl Terminator {
    pub fn new(n_workers: usize) -> Terminator {
        assert!(n_workers > 0);
        Terminator {
            n_workers,
            offered: AtomicUsize::new(0),
        }
    }

    /// Offer to terminate. Returns `true` once every worker of the gang is
    /// offering simultaneously, `false` when `should_exit` sent this worker
    /// back out; either way the caller is no longer registered as idle.
    pub fn offer_termination(&self, should_exit: impl Fn() -> bool) -> bool {
        if self.offered.fetch_add(1, Ordering::AcqRel) + 1 == self.n_workers {
            // Last offer in; the count is terminal from here on.
            return true;
        }
        loop {
            if self.offered.load(Ordering::Acquire) == self.n_workers {
                return true;
            }
            if should_exit() {
                return self.deregister_or_terminate();
            }
            thread::sleep(Duration::from_micros(1));
        }
    }

    /// Withdraw this worker's offer, unless the gang terminated while it
    /// was deciding. Our own registration keeps the count above zero.
    fn deregister_or_terminate(&self) -> bool {
        let mut offered = self.offered.load(Ordering::Acquire);
        loop {
            if offered == self.n_workers {
                return true;
            }
            match self.offered.compare_exchange(
                offered,
                offered - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return false,
                Err(actual) => offered = actual,
            }
        }
    }
}

struct BarrierState {
    n_workers: usize,
    arrived: usize,
    generation: usize,
    aborted: bool,
}

/// An N-arrival gate. Entering blocks until `n_workers` distinct workers
/// have arrived, then releases them all and rearms for the next use. Two of
/// these serialize the overflow restart: nobody resumes marking until every
/// worker has stopped touching the global structures and re-initialized.
pub struct BarrierSync {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl BarrierSync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                n_workers: 0,
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Arm the gate for a gang of `n` workers and clear a previous abort.
    pub fn set_n_workers(&self, n: usize) {
        let mut state = self.state.lock();
        state.n_workers = n;
        state.arrived = 0;
        state.aborted = false;
    }

    /// Arrive at the gate. Returns `false` if the gate was aborted, in
    /// which case the caller should bail out of the protocol entirely.
    pub fn enter(&self) -> bool {
        let mut state = self.state.lock();
        if state.aborted {
            return false;
        }
        state.arrived += 1;
        if state.arrived >= state.n_workers {
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
            return true;
        }
        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            self.cond.wait(&mut state);
        }
        !state.aborted
    }

    /// Release every waiter with a failure indication; subsequent arrivals
    /// fail immediately until the gate is rearmed.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cond.notify_all();
    }
}

impl Default for BarrierSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative yield capability supplied by the surrounding collector.
///
/// The engine only knows how to ask: `should_yield` is polled from the
/// marking clock and bitmap clearing; `yield_now` may block for an
/// arbitrarily long safepoint, and after it returns the caller re-reads
/// phase state.
pub trait YieldDelegate: Send + Sync {
    fn should_yield(&self) -> bool {
        false
    }

    fn yield_now(&self) {}
}

/// Default delegate for embedders without safepoint machinery.
pub struct NeverYield;

impl YieldDelegate for NeverYield {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn terminator_all_idle() {
        let terminator = Arc::new(Terminator::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let terminator = terminator.clone();
                std::thread::spawn(move || terminator.offer_termination(|| false))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn terminator_single_worker() {
        let terminator = Terminator::new(1);
        assert!(terminator.offer_termination(|| false));
    }

    #[test]
    fn terminator_exit_predicate_resumes_worker() {
        use std::sync::atomic::AtomicBool;

        // Two workers, only one offering: it can never terminate and must
        // come back out once the exit condition fires.
        let terminator = Arc::new(Terminator::new(2));
        let exit = Arc::new(AtomicBool::new(false));
        let worker = {
            let terminator = terminator.clone();
            let exit = exit.clone();
            std::thread::spawn(move || {
                terminator.offer_termination(|| exit.load(Ordering::Acquire))
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        exit.store(true, Ordering::Release);
        assert!(!worker.join().unwrap());

        // The withdrawn offer must not linger: both workers offering now
        // terminates the gang.
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let terminator = terminator.clone();
                std::thread::spawn(move || terminator.offer_termination(|| false))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn barrier_releases_all_and_rearms() {
        let barrier = Arc::new(BarrierSync::new());
        barrier.set_n_workers(3);
        for _ in 0..2 {
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    let barrier = barrier.clone();
                    std::thread::spawn(move || barrier.enter())
                })
                .collect();
            for h in handles {
                assert!(h.join().unwrap());
            }
        }
    }

    #[test]
    fn barrier_abort_releases_waiters() {
        let barrier = Arc::new(BarrierSync::new());
        barrier.set_n_workers(2);
        let b = barrier.clone();
        let waiter = std::thread::spawn(move || b.enter());
        std::thread::sleep(Duration::from_millis(10));
        barrier.abort();
        assert!(!waiter.join().unwrap());
        assert!(!barrier.enter());
        barrier.set_n_workers(1);
        assert!(barrier.enter());
    }
}
