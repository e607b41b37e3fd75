//! End-to-end marking cycles over synthetic heaps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::mark::{ConcurrentMark, MarkOptions, MarkPhase, RefProcContext, ReferenceProcessor};
use crate::object::ObjRef;
use crate::region::RegionedHeap;
use crate::utils::WORD_SIZE;

fn engine(heap_bytes: usize, target_regions: usize, options: MarkOptions) -> Arc<ConcurrentMark> {
    let heap = Arc::new(RegionedHeap::new(heap_bytes, target_regions).unwrap());
    let cm = ConcurrentMark::new(heap, options);
    assert!(cm.completed_initialization());
    Arc::new(cm)
}

/// Allocates objects region by region, moving on when one fills up.
struct GraphBuilder<'h> {
    heap: &'h RegionedHeap,
    region: u32,
}

impl<'h> GraphBuilder<'h> {
    fn new(heap: &'h RegionedHeap) -> Self {
        Self { heap, region: 0 }
    }

    fn plain(&mut self, slots: usize) -> ObjRef {
        loop {
            if let Some(obj) = self.heap.alloc_plain(self.region, slots) {
                return obj;
            }
            self.region += 1;
            assert!((self.region as usize) < self.heap.num_regions(), "test heap exhausted");
        }
    }

    fn array(&mut self, len: usize) -> ObjRef {
        loop {
            if let Some(obj) = self.heap.alloc_ref_array(self.region, len) {
                return obj;
            }
            self.region += 1;
            assert!((self.region as usize) < self.heap.num_regions(), "test heap exhausted");
        }
    }
}

fn link(parent: ObjRef, index: usize, child: ObjRef) {
    unsafe { parent.set_slot(index, Some(child)) }
}

/// Drive one full cycle the way the collector's marking thread does.
fn run_cycle(cm: &ConcurrentMark, roots: &[ObjRef]) {
    cm.checkpoint_roots_initial_pre();
    for &root in roots {
        cm.mark_in_next_bitmap(root);
    }
    cm.checkpoint_roots_initial_post();
    cm.scan_root_regions();
    loop {
        cm.mark_from_roots();
        if cm.has_aborted() {
            return;
        }
        cm.checkpoint_roots_final(false);
        if cm.has_aborted() {
            return;
        }
        if !cm.restart_for_overflow() {
            break;
        }
    }
    cm.cleanup();
    cm.complete_cleanup();
}

fn marked_count(cm: &ConcurrentMark) -> usize {
    // After a completed cycle the finished marking is the prev bitmap.
    cm.prev_mark_bitmap()
        .count_marked_range(cm.heap().begin(), cm.heap().end())
}

#[test]
fn empty_heap_cycle() {
    let cm = engine(4 * 1024 * 1024, 4, MarkOptions::default());
    run_cycle(&cm, &[]);

    assert!(!cm.has_aborted());
    assert!(!cm.restart_for_overflow());
    assert_eq!(cm.phase(), MarkPhase::Idle);
    assert_eq!(marked_count(&cm), 0);
    assert!(cm.next_mark_bitmap_is_clear());
    assert!(cm.take_cleanup_list().is_empty());
}

#[test]
fn linked_list_is_fully_marked() {
    let cm = engine(4 * 1024 * 1024, 4, MarkOptions::default());
    let mut builder = GraphBuilder::new(cm.heap());

    let mut nodes = Vec::with_capacity(1000);
    for _ in 0..1000 {
        nodes.push(builder.plain(1));
    }
    for window in nodes.windows(2) {
        link(window[0], 0, window[1]);
    }

    run_cycle(&cm, &[nodes[0]]);

    assert!(!cm.has_aborted());
    assert_eq!(marked_count(&cm), 1000);
    for &node in &nodes {
        assert!(cm.is_marked_in_prev_bitmap(node));
    }
    // A forward chain is discovered entirely by the bitmap scan; nothing
    // ever reaches the global stack.
    assert_eq!(cm.overflow_episodes(), 0);

    let live: usize = cm.heap().regions().map(|r| r.marked_bytes()).sum();
    assert_eq!(live, 1000 * 2 * WORD_SIZE);
}

#[test]
fn backward_chain_goes_through_the_queues() {
    // Children sit below their parents, so every link is below the local
    // finger and takes the enqueue path.
    let cm = engine(4 * 1024 * 1024, 4, MarkOptions::default());
    let mut builder = GraphBuilder::new(cm.heap());

    let mut nodes = Vec::with_capacity(1000);
    for _ in 0..1000 {
        nodes.push(builder.plain(1));
    }
    for window in nodes.windows(2) {
        link(window[1], 0, window[0]);
    }

    run_cycle(&cm, &[nodes[999]]);

    assert!(!cm.has_aborted());
    assert_eq!(marked_count(&cm), 1000);
}

fn build_fanout_graph(builder: &mut GraphBuilder) -> (Vec<ObjRef>, ObjRef, ObjRef) {
    let root = builder.plain(100);
    let mut all = vec![root];
    for i in 0..100 {
        let mid = builder.plain(100);
        link(root, i, mid);
        all.push(mid);
        for j in 0..100 {
            let leaf = builder.plain(0);
            link(mid, j, leaf);
            all.push(leaf);
        }
    }
    let unreachable = builder.plain(0);
    (all, root, unreachable)
}

#[test]
fn overflow_restart_converges() {
    // A starved mark stack: two chunks, no growth. The fanout graph forces
    // repeated overflows; every restart resumes from the bitmap and the
    // final marking must equal an unconstrained run's.
    let starved = MarkOptions {
        num_workers: 2,
        mark_stack_initial_chunks: 2,
        mark_stack_max_chunks: 2,
        local_queue_capacity: 128,
        ..Default::default()
    };
    let cm = engine(4 * 1024 * 1024, 4, starved);
    let mut builder = GraphBuilder::new(cm.heap());
    let (all, root, unreachable) = build_fanout_graph(&mut builder);

    run_cycle(&cm, &[root]);

    assert!(!cm.has_aborted());
    assert!(cm.overflow_episodes() >= 1, "graph did not overflow the stack");
    for &obj in &all {
        assert!(cm.is_marked_in_prev_bitmap(obj));
    }
    assert!(!cm.is_marked_in_prev_bitmap(unreachable));

    // Same graph, unconstrained stack: the marked set must be identical.
    let roomy = engine(4 * 1024 * 1024, 4, MarkOptions::default());
    let mut builder = GraphBuilder::new(roomy.heap());
    let (all2, root2, unreachable2) = build_fanout_graph(&mut builder);
    run_cycle(&roomy, &[root2]);

    assert_eq!(roomy.overflow_episodes(), 0);
    assert_eq!(marked_count(&cm), marked_count(&roomy));
    for &obj in &all2 {
        assert!(roomy.is_marked_in_prev_bitmap(obj));
    }
    assert!(!roomy.is_marked_in_prev_bitmap(unreachable2));
}

#[test]
fn work_stealing_spreads_the_load() {
    let cm = engine(
        64 * 1024 * 1024,
        8,
        MarkOptions {
            num_workers: 4,
            ..Default::default()
        },
    );
    let mut builder = GraphBuilder::new(cm.heap());

    // All roots point into one region: a single large array fanning out to
    // chains, so one worker starts with everything and the others can only
    // make progress by stealing.
    const FAN: usize = 100_000;
    let root = builder.array(FAN);
    for i in 0..FAN {
        let a = builder.plain(1);
        let b = builder.plain(1);
        let c = builder.plain(0);
        link(a, 0, b);
        link(b, 0, c);
        link(root, i, a);
    }

    run_cycle(&cm, &[root]);
    assert!(!cm.has_aborted());
    assert_eq!(marked_count(&cm), 1 + 3 * FAN);

    let mut refs_per_worker = [0usize; 4];
    for stats in cm.last_task_stats() {
        refs_per_worker[stats.worker_id] += stats.refs_reached;
    }
    for (worker, &refs) in refs_per_worker.iter().enumerate() {
        assert!(refs > 0, "worker {} never reached a reference", worker);
    }
}

#[test]
fn abort_mid_cycle_returns_promptly() {
    let cm = engine(
        128 * 1024 * 1024,
        8,
        MarkOptions {
            num_workers: 2,
            local_queue_capacity: 256,
            ..Default::default()
        },
    );
    let mut builder = GraphBuilder::new(cm.heap());

    // A three-million node binary tree keeps the gang busy well past the
    // abort point.
    const NODES: usize = 3_000_000;
    let mut nodes = Vec::with_capacity(NODES);
    for _ in 0..NODES {
        nodes.push(builder.plain(2));
    }
    for i in 0..NODES {
        if 2 * i + 1 < NODES {
            link(nodes[i], 0, nodes[2 * i + 1]);
        }
        if 2 * i + 2 < NODES {
            link(nodes[i], 1, nodes[2 * i + 2]);
        }
    }
    let root = nodes[0];

    let driver = {
        let cm = cm.clone();
        std::thread::spawn(move || run_cycle(&cm, &[root]))
    };

    std::thread::sleep(Duration::from_millis(40));
    cm.abort();
    let aborted_at = Instant::now();
    driver.join().unwrap();

    assert!(
        aborted_at.elapsed() < Duration::from_millis(1000),
        "workers took {:?} to unwind",
        aborted_at.elapsed()
    );
    assert!(cm.has_aborted());
    assert_eq!(cm.phase(), MarkPhase::Idle);
    assert!(cm.mark_stack_is_empty());
    assert!(cm.next_mark_bitmap_is_clear());

    // The next cycle starts from a clean slate.
    run_cycle(&cm, &[root]);
    assert!(!cm.has_aborted());
    assert_eq!(marked_count(&cm), NODES);
}

#[test]
fn huge_array_is_scanned_in_slices() {
    let cm = engine(64 * 1024 * 1024, 4, MarkOptions::default());
    let mut builder = GraphBuilder::new(cm.heap());

    const LEN: usize = 1_000_000;
    let root = builder.array(LEN);
    let mut leaves = Vec::with_capacity(LEN);
    for i in 0..LEN {
        let leaf = builder.plain(0);
        link(root, i, leaf);
        leaves.push(leaf);
    }

    run_cycle(&cm, &[root]);

    assert!(!cm.has_aborted());
    assert_eq!(marked_count(&cm), 1 + LEN);
    for leaf in leaves.iter().step_by(997) {
        assert!(cm.is_marked_in_prev_bitmap(*leaf));
    }

    let total_words = (LEN + 1) + LEN;
    let live: usize = cm.heap().regions().map(|r| r.marked_bytes()).sum();
    assert_eq!(live, total_words * WORD_SIZE);
}

#[test]
fn satb_buffers_keep_the_snapshot_alive() {
    let cm = engine(4 * 1024 * 1024, 4, MarkOptions::default());
    let mut builder = GraphBuilder::new(cm.heap());

    let root = builder.plain(0);
    // Unreachable from the root; only the barrier log keeps them in the
    // cycle-start snapshot.
    let overwritten_early = builder.plain(0);
    let overwritten_late = builder.plain(0);

    cm.checkpoint_roots_initial_pre();
    cm.mark_in_next_bitmap(root);
    cm.checkpoint_roots_initial_post();
    cm.scan_root_regions();

    // A mutator overwrote a reference during concurrent marking.
    cm.satb()
        .enqueue_completed_buffer(vec![overwritten_early].into_boxed_slice());
    cm.mark_from_roots();
    // And another one after concurrent marking wound down; remark picks
    // this one up.
    cm.satb()
        .enqueue_completed_buffer(vec![overwritten_late].into_boxed_slice());
    cm.checkpoint_roots_final(false);
    assert!(!cm.restart_for_overflow());
    cm.cleanup();
    cm.complete_cleanup();

    assert!(cm.is_marked_in_prev_bitmap(root));
    assert!(cm.is_marked_in_prev_bitmap(overwritten_early));
    assert!(cm.is_marked_in_prev_bitmap(overwritten_late));
    // Logging stopped with the cycle.
    assert!(!cm.satb().is_active());
}

#[test]
fn survivor_regions_are_scanned_as_roots() {
    let cm = engine(4 * 1024 * 1024, 4, MarkOptions::default());
    let heap = cm.heap();

    // An old object referenced only from a survivor region.
    let old = heap.alloc_plain(0, 0).unwrap();
    let survivor_obj = heap.alloc_plain(1, 1).unwrap();
    link(survivor_obj, 0, old);
    heap.region(1).set_survivor(true);

    run_cycle(&cm, &[]);

    assert!(!cm.has_aborted());
    // The survivor object itself is implicitly live (TAMS at bottom), the
    // old object had to be marked by the root region scan.
    assert!(cm.is_marked_in_prev_bitmap(old));
    assert!(!cm.is_marked_in_prev_bitmap(survivor_obj));
}

#[test]
fn region_claims_are_unique() {
    let cm = engine(8 * 1024 * 1024, 8, MarkOptions::default());
    let num_regions = cm.heap().num_regions();

    let claimed: Vec<u32> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let cm = &cm;
                scope.spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(index) = cm.claim_region(worker) {
                        mine.push(index);
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let mut sorted = claimed;
    sorted.sort_unstable();
    assert_eq!(sorted, (0..num_regions as u32).collect::<Vec<_>>());
    assert!(cm.out_of_regions());
}

#[test]
fn reference_processor_sees_final_liveness() {
    struct Recorder {
        dead_referent: ObjRef,
        live_referent: ObjRef,
        ran: AtomicBool,
    }
    impl ReferenceProcessor for Recorder {
        fn process_discovered_references(
            &self,
            clear_all_soft_refs: bool,
            ctx: &mut dyn RefProcContext,
        ) {
            assert!(!clear_all_soft_refs);
            assert!(ctx.is_alive(self.live_referent));
            assert!(!ctx.is_alive(self.dead_referent));
            // Policy decided to keep the dead referent: grey it now.
            ctx.keep_alive(self.dead_referent);
            ctx.complete_drain();
            self.ran.store(true, Ordering::Release);
        }
    }

    let heap = Arc::new(RegionedHeap::new(4 * 1024 * 1024, 4).unwrap());
    let root = heap.alloc_plain(0, 1).unwrap();
    let live = heap.alloc_plain(0, 0).unwrap();
    let dead = heap.alloc_plain(0, 0).unwrap();
    link(root, 0, live);

    let recorder = Arc::new(Recorder {
        dead_referent: dead,
        live_referent: live,
        ran: AtomicBool::new(false),
    });
    let mut cm = ConcurrentMark::new(heap, MarkOptions::default());
    cm.set_reference_processor(recorder.clone());
    let cm = Arc::new(cm);

    run_cycle(&cm, &[root]);

    assert!(recorder.ran.load(Ordering::Acquire));
    assert!(cm.is_marked_in_prev_bitmap(dead), "keep_alive was lost");
    assert!(cm.is_marked_in_prev_bitmap(live));
}

#[test]
fn back_to_back_cycles_swap_bitmaps() {
    let cm = engine(
        4 * 1024 * 1024,
        4,
        MarkOptions {
            verify: true,
            ..Default::default()
        },
    );
    let mut builder = GraphBuilder::new(cm.heap());

    let a = builder.plain(1);
    let b = builder.plain(0);
    link(a, 0, b);

    run_cycle(&cm, &[a]);
    assert_eq!(marked_count(&cm), 2);
    assert!(cm.next_mark_bitmap_is_clear());

    // Second cycle over the same heap; the swapped bitmaps must come out
    // clean and complete again.
    run_cycle(&cm, &[a]);
    assert_eq!(marked_count(&cm), 2);
    assert!(cm.is_marked_in_prev_bitmap(a));
    assert!(cm.is_marked_in_prev_bitmap(b));
}

#[test]
fn fully_dead_regions_are_reported_for_cleanup() {
    let cm = engine(4 * 1024 * 1024, 4, MarkOptions::default());
    let heap = cm.heap();

    // Region 0 holds live data, region 1 only garbage.
    let root = heap.alloc_plain(0, 0).unwrap();
    heap.alloc_plain(1, 4).unwrap();
    heap.alloc_plain(1, 4).unwrap();

    run_cycle(&cm, &[root]);

    assert_eq!(cm.take_cleanup_list(), vec![1]);
    assert_eq!(cm.heap().region(1).marked_bytes(), 0);
    assert!(cm.heap().region(0).marked_bytes() > 0);
}

#[test]
fn shutdown_aborts_a_running_cycle() {
    let cm = engine(4 * 1024 * 1024, 4, MarkOptions::default());
    let root = cm.heap().alloc_plain(0, 0).unwrap();

    cm.checkpoint_roots_initial_pre();
    cm.mark_in_next_bitmap(root);
    cm.checkpoint_roots_initial_post();

    cm.shutdown();
    assert_eq!(cm.phase(), MarkPhase::Idle);
    assert!(cm.has_aborted());

    // And a fresh cycle still works afterwards.
    run_cycle(&cm, &[root]);
    assert!(!cm.has_aborted());
    assert_eq!(marked_count(&cm), 1);
}
