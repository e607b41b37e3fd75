//! Root region claiming.
//!
//! Survivor regions populated during the initial-mark pause are not empty at
//! the start of the cycle and may be collected by an evacuation pause while
//! marking runs, so they are scanned up front: every object reachable from
//! them gets marked before concurrent marking proper begins. Workers claim
//! survivor regions one at a time through an atomic index; an abort
//! short-circuits further claims but regions already claimed are still
//! scanned to completion.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct RootRegions {
    survivors: Mutex<Vec<u32>>,
    num_regions: AtomicUsize,
    claimed_index: AtomicUsize,
    scan_in_progress: AtomicBool,
    should_abort: AtomicBool,
    lock: Mutex<()>,
    scan_done: Condvar,
}

impl RootRegions {
    pub fn new() -> Self {
        Self {
            survivors: Mutex::new(Vec::new()),
            num_regions: AtomicUsize::new(0),
            claimed_index: AtomicUsize::new(0),
            scan_in_progress: AtomicBool::new(false),
            should_abort: AtomicBool::new(false),
            lock: Mutex::new(()),
            scan_done: Condvar::new(),
        }
    }

    /// Install the survivor snapshot and arm the claim protocol. Called at
    /// the initial-mark pause.
    pub fn prepare_for_scan(&self, survivors: Vec<u32>) {
        assert!(!self.scan_in_progress());
        self.num_regions.store(survivors.len(), Ordering::Relaxed);
        *self.survivors.lock() = survivors;
        self.claimed_index.store(0, Ordering::Relaxed);
        self.should_abort.store(false, Ordering::Relaxed);
        self.scan_in_progress.store(true, Ordering::Release);
    }

    /// Claim the next root region, or `None` once all are claimed or the
    /// scan was aborted.
    pub fn claim_next(&self) -> Option<u32> {
        if self.should_abort.load(Ordering::Acquire) {
            return None;
        }
        let index = self.claimed_index.fetch_add(1, Ordering::Relaxed);
        let survivors = self.survivors.lock();
        survivors.get(index).copied()
    }

    pub fn num_root_regions(&self) -> usize {
        self.num_regions.load(Ordering::Relaxed)
    }

    /// Make subsequent `claim_next` calls return `None`. In-flight regions
    /// are still fully scanned by their claimants.
    pub fn abort(&self) {
        self.should_abort.store(true, Ordering::Release);
    }

    pub fn scan_in_progress(&self) -> bool {
        self.scan_in_progress.load(Ordering::Acquire)
    }

    /// Scanning is done (all regions claimed, or aborted): wake waiters.
    pub fn scan_finished(&self) {
        assert!(self.scan_in_progress());
        if !self.should_abort.load(Ordering::Acquire) {
            assert!(
                self.claimed_index.load(Ordering::Relaxed) >= self.num_root_regions(),
                "scan finished with unclaimed root regions"
            );
        }
        self.notify_scan_done();
    }

    pub fn cancel_scan(&self) {
        if self.scan_in_progress() {
            self.notify_scan_done();
        }
    }

    fn notify_scan_done(&self) {
        let guard = self.lock.lock();
        self.scan_in_progress.store(false, Ordering::Release);
        self.scan_done.notify_all();
        drop(guard);
    }

    /// Block until the scan completes. Returns whether we actually waited.
    pub fn wait_until_scan_finished(&self) -> bool {
        if !self.scan_in_progress() {
            return false;
        }
        let mut guard = self.lock.lock();
        let mut waited = false;
        while self.scan_in_progress() {
            waited = true;
            self.scan_done.wait(&mut guard);
        }
        waited
    }
}

impl Default for RootRegions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn claims_are_unique_and_exhaustive() {
        let rr = Arc::new(RootRegions::new());
        rr.prepare_for_scan(vec![3, 5, 9]);
        assert_eq!(rr.num_root_regions(), 3);

        let mut handles = vec![];
        let claimed = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..4 {
            let rr = rr.clone();
            let claimed = claimed.clone();
            handles.push(std::thread::spawn(move || {
                while let Some(r) = rr.claim_next() {
                    claimed.lock().push(r);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut got = claimed.lock().clone();
        got.sort_unstable();
        assert_eq!(got, vec![3, 5, 9]);
        rr.scan_finished();
        assert!(!rr.scan_in_progress());
    }

    #[test]
    fn abort_short_circuits_claims() {
        let rr = RootRegions::new();
        rr.prepare_for_scan(vec![1, 2, 3]);
        assert_eq!(rr.claim_next(), Some(1));
        rr.abort();
        assert_eq!(rr.claim_next(), None);
        rr.scan_finished();
    }

    #[test]
    fn waiters_are_released() {
        let rr = Arc::new(RootRegions::new());
        rr.prepare_for_scan(vec![0]);
        let rr2 = rr.clone();
        let waiter = std::thread::spawn(move || rr2.wait_until_scan_finished());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(rr.claim_next(), Some(0));
        assert_eq!(rr.claim_next(), None);
        rr.scan_finished();
        assert!(waiter.join().unwrap());
        assert!(!rr.wait_until_scan_finished());
    }
}
