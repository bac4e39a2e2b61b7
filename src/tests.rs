use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    heap::{
        heap::{GcCancellation, MarkHeap},
        mark::MarkTerminatorTerminator,
        reference_queue::DiscoveredReferences,
        satb_mark_queue::SATBMarkQueueSet,
        string_dedup::{StringDedup, StringDedupQueue},
        taskqueue::MarkTask,
        terminator::TaskTerminator,
    },
    object::{ObjectRef, ReferenceType},
    test_heap::{SimulatedHeap, SimulatedHeapBuilder},
    traits::ObjectModel,
    ConcurrentMark, Mark, MarkLoopOutcome, MarkOptions, MarkOutcome,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn options(threads: usize, max_queues: usize) -> MarkOptions {
    MarkOptions {
        parallel_gc_threads: threads,
        max_queues,
        mark_loop_stride: 16,
        obj_array_marking_stride: 8,
        task_queue_capacity: 64,
        satb_buffer_size: 8,
        satb_buffer_enqueue_threshold: 60,
        suspendible_workers: false,
        termination_wait_micros: 200,
    }
}

struct Marker {
    cm: ConcurrentMark<SimulatedHeap>,
    rp: Arc<DiscoveredReferences>,
    dedup: Arc<StringDedupQueue>,
}

impl Marker {
    fn new(heap: SimulatedHeap, opts: MarkOptions) -> Self {
        let ctx = Arc::new(heap.new_marking_context(opts.max_queues, opts.task_queue_capacity));
        let satb = Arc::new(SATBMarkQueueSet::new(opts.satb_buffer_size));
        let rp = Arc::new(DiscoveredReferences::new());
        let dedup = Arc::new(StringDedupQueue::new());

        let cm = ConcurrentMark::new(
            Arc::new(heap),
            ctx,
            satb,
            rp.clone(),
            Some(dedup.clone()),
            opts,
        );

        Self { cm, rp, dedup }
    }

    fn heap(&self) -> &SimulatedHeap {
        self.cm.heap()
    }

    fn cycle(&self, roots: &[ObjectRef]) -> MarkOutcome {
        self.cm.mark_roots(roots);
        let outcome = self.cm.concurrent_mark();
        assert!(!outcome.is_cancelled());
        let finish = self.cm.finish_mark();
        assert!(!finish.is_cancelled());
        assert!(self.cm.marking_context().is_complete());
        outcome
    }

    fn marked(&self) -> HashSet<ObjectRef> {
        self.cm.marking_context().marked_objects().collect()
    }

    fn live(&self) -> usize {
        self.cm.marking_context().total_live_data_bytes()
    }
}

/// `n` instances with `fanout` slots each, randomly linked. Some slots stay null.
fn random_graph(b: &mut SimulatedHeapBuilder, rng: &mut StdRng, n: usize, fanout: usize) -> Vec<ObjectRef> {
    let objects = (0..n).map(|_| b.instance(fanout)).collect::<Vec<_>>();
    for &obj in objects.iter() {
        for slot in 0..fanout {
            if rng.gen_bool(0.8) {
                let target = objects[rng.gen_range(0..n)];
                b.set_field(obj, slot, target);
            }
        }
    }
    objects
}

#[test]
fn test_single_worker_marks_children() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let a = b.instance(2);
    let bb = b.instance(0);
    let c = b.instance(0);
    b.set_field(a, 0, bb);
    b.set_field(a, 1, c);

    let marker = Marker::new(b.build(1), options(1, 1));
    let outcome = marker.cycle(&[a]);

    assert_eq!(outcome.tasks(), 3);
    assert_eq!(marker.marked(), [a, bb, c].into_iter().collect());
    assert_eq!(marker.live(), marker.heap().size_of_all([a, bb, c]));
    for obj in [a, bb, c] {
        assert_eq!(marker.heap().scan_count(obj), 1);
    }
}

#[test]
fn test_two_workers_mark_disjoint_roots_once() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let a = b.instance(0);
    let bb = b.instance(0);

    let marker = Marker::new(b.build(2), options(2, 2));
    let outcome = marker.cycle(&[a, bb]);

    assert_eq!(outcome.tasks(), 2);
    assert_eq!(marker.marked(), [a, bb].into_iter().collect());
    assert_eq!(marker.heap().scan_count(a), 1);
    assert_eq!(marker.heap().scan_count(bb), 1);
}

#[test]
fn test_cycle_terminates() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let a = b.instance(1);
    let bb = b.instance(1);
    b.set_field(a, 0, bb);
    b.set_field(bb, 0, a);

    let marker = Marker::new(b.build(1), options(1, 1));
    let outcome = marker.cycle(&[a]);

    assert_eq!(outcome.tasks(), 2);
    assert_eq!(marker.marked().len(), 2);
    assert_eq!(marker.heap().scan_count(a), 1);
    assert_eq!(marker.heap().scan_count(bb), 1);
}

#[test]
fn test_forwarded_objects_mark_their_copy() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let root = b.instance(1);
    let from = b.instance(1);
    let to = b.instance(1);
    let child = b.instance(0);
    b.set_field(root, 0, from);
    b.set_field(from, 0, child);
    b.set_field(to, 0, child);

    let heap = b.build(2);
    heap.forward(from, to);

    let marker = Marker::new(heap, options(2, 2));
    // The stale address is a root as well, it must land on the same mark.
    marker.cycle(&[root, from]);

    assert_eq!(marker.marked(), [root, to, child].into_iter().collect());
    assert_eq!(marker.heap().scan_count(from), 0);
    assert_eq!(marker.heap().scan_count(to), 1);
    assert_eq!(marker.heap().field(root, 0), to);
    assert_eq!(marker.live(), marker.heap().size_of_all([root, to, child]));
}

#[test]
fn test_random_graphs_mark_reachable_once() {
    init_logger();
    for (seed, workers) in [(1, 1), (2, 2), (3, 4), (4, 8)] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut b = SimulatedHeap::builder();
        let objects = random_graph(&mut b, &mut rng, 3000, 3);
        let roots = (0..10)
            .map(|_| objects[rng.gen_range(0..objects.len())])
            .collect::<Vec<_>>();

        let marker = Marker::new(b.build(workers), options(workers, workers));
        let outcome = marker.cycle(&roots);

        let expected = marker.heap().reachable(&roots);
        assert_eq!(marker.marked(), expected, "seed {} with {} workers", seed, workers);
        assert!(outcome.tasks() >= expected.len());
        for &obj in expected.iter() {
            assert_eq!(marker.heap().scan_count(obj), 1, "{:?} scanned more than once", obj);
        }
        for obj in marker.heap().objects().filter(|obj| !expected.contains(obj)) {
            assert_eq!(marker.heap().scan_count(obj), 0);
        }

        let heap = marker.heap();
        assert_eq!(marker.live(), heap.size_of_all(expected.iter().copied()));
        let ctx = marker.cm.marking_context();
        for region in 0..heap.num_regions() {
            let in_region = expected
                .iter()
                .filter(|&&obj| heap.region_index(obj) == region)
                .copied();
            assert_eq!(ctx.get_live_data_bytes(region), heap.size_of_all(in_region));
        }
    }
}

#[test]
fn test_large_arrays_visit_every_element_once() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let lengths = [0, 1, 16, 17, 1000, 10_000];
    let arrays = lengths.iter().map(|&len| b.obj_array(len)).collect::<Vec<_>>();
    let mut elements = Vec::new();
    for (&array, &len) in arrays.iter().zip(lengths.iter()) {
        for index in 0..len {
            let elem = b.instance(0);
            b.set_field(array, index, elem);
            elements.push(elem);
        }
    }
    let root = b.instance(arrays.len());
    for (index, &array) in arrays.iter().enumerate() {
        b.set_field(root, index, array);
    }

    let marker = Marker::new(b.build(4), options(4, 4));
    marker.cycle(&[root]);

    let heap = marker.heap();
    for (&array, &len) in arrays.iter().zip(lengths.iter()) {
        assert_eq!(heap.element_visits(array), len);
    }
    for &elem in elements.iter() {
        assert_eq!(heap.scan_count(elem), 1);
    }

    let expected = heap.reachable(&[root]);
    assert_eq!(marker.marked(), expected);
    assert_eq!(marker.live(), heap.size_of_all(expected.iter().copied()));
}

#[test]
fn test_array_sharing_elements() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let shared = b.instance(0);
    let array = b.obj_array(5000);
    for index in 0..5000 {
        b.set_field(array, index, shared);
    }

    let marker = Marker::new(b.build(4), options(4, 4));
    marker.cycle(&[array]);

    assert_eq!(marker.marked(), [array, shared].into_iter().collect());
    assert_eq!(marker.heap().scan_count(shared), 1);
    assert_eq!(marker.heap().element_visits(array), 5000);
}

#[test]
fn test_type_arrays_are_not_scanned() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let root = b.instance(1);
    let data = b.type_array(100);
    b.set_field(root, 0, data);

    let marker = Marker::new(b.build(1), options(1, 1));
    marker.cycle(&[root]);

    assert_eq!(marker.marked(), [root, data].into_iter().collect());
    assert_eq!(marker.heap().scan_count(data), 0);
    assert_eq!(marker.live(), marker.heap().size_of_all([root, data]));
}

#[test]
fn test_weak_referent_is_discovered_not_marked() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let weak = b.reference(ReferenceType::Weak, 0);
    let referent = b.instance(0);
    b.set_referent(weak, referent);

    let marker = Marker::new(b.build(1), options(1, 1));
    marker.cycle(&[weak]);

    assert_eq!(marker.marked(), [weak].into_iter().collect());
    let discovered = marker.rp.drain(ReferenceType::Weak);
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].reference, weak);
    assert_eq!(discovered[0].referent, referent);
    assert!(marker.rp.mark_closure(0).is_some());
}

#[test]
fn test_strongly_reachable_referent_is_not_discovered() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let holder = b.instance(1);
    let soft = b.reference(ReferenceType::Soft, 0);
    let referent = b.instance(0);
    b.set_field(holder, 0, referent);
    b.set_referent(soft, referent);

    let marker = Marker::new(b.build(1), options(1, 1));
    // The holder is popped first and marks the referent strongly.
    marker.cycle(&[soft, holder]);

    assert!(marker.cm.marking_context().is_marked_strong(referent));
    assert_eq!(marker.rp.discovered_count(ReferenceType::Soft), 0);
}

#[test]
fn test_final_referent_upgrade_counts_liveness_once() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let holder = b.instance(1);
    let fin = b.reference(ReferenceType::Final, 0);
    let referent = b.instance(1);
    let child = b.instance(0);
    b.set_referent(fin, referent);
    b.set_field(referent, 0, child);
    b.set_field(holder, 0, referent);

    let marker = Marker::new(b.build(1), options(1, 1));
    // The final reference is popped first, so the referent is marked weakly, then upgraded.
    marker.cycle(&[holder, fin]);

    let ctx = marker.cm.marking_context();
    assert!(ctx.is_marked_strong(referent));
    assert!(ctx.is_marked_strong(child));
    assert_eq!(marker.rp.discovered_count(ReferenceType::Final), 1);
    // Upgrading rescans the object to propagate the strong mark.
    assert_eq!(marker.heap().scan_count(referent), 2);
    assert_eq!(
        marker.live(),
        marker.heap().size_of_all([holder, fin, referent, child])
    );
}

#[test]
fn test_final_referent_only_weakly_reachable() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let fin = b.reference(ReferenceType::Final, 0);
    let referent = b.instance(1);
    let child = b.string();
    b.set_referent(fin, referent);
    b.set_field(referent, 0, child);

    let marker = Marker::new(b.build(1), options(1, 1));
    marker.cycle(&[fin]);

    let ctx = marker.cm.marking_context();
    assert!(ctx.is_marked_strong(fin));
    assert!(ctx.is_marked_weak(referent));
    assert!(ctx.is_marked_weak(child));
    assert!(!ctx.is_marked_strong(child));
    // Weakly reachable strings are not deduplicated.
    assert!(marker.dedup.is_empty());
    assert_eq!(
        marker.live(),
        marker.heap().size_of_all([fin, referent, child])
    );
}

#[test]
fn test_strings_are_deduplicated_once() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let strings = (0..50).map(|_| b.string()).collect::<Vec<_>>();
    let holders = (0..8).map(|_| b.instance(strings.len())).collect::<Vec<_>>();
    for &holder in holders.iter() {
        for (slot, &s) in strings.iter().enumerate() {
            b.set_field(holder, slot, s);
        }
    }

    let marker = Marker::new(b.build(4), options(4, 4));
    marker.cycle(&holders);

    let mut enqueued = Vec::new();
    while let Some(s) = marker.dedup.pop() {
        enqueued.push(s);
    }
    assert_eq!(enqueued.len(), strings.len());
    assert_eq!(
        enqueued.into_iter().collect::<HashSet<_>>(),
        strings.into_iter().collect::<HashSet<_>>()
    );
}

#[test]
fn test_class_holders_traced_when_unloading() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let klass = b.instance(0);
    let obj = b.instance(0);
    b.set_class_holder(obj, klass);

    let heap = b.build(1);
    let marker = Marker::new(heap, options(1, 1));

    marker.cycle(&[obj]);
    assert_eq!(marker.marked(), [obj].into_iter().collect());

    marker.heap().set_unload_classes(true);
    marker.cycle(&[obj]);
    assert_eq!(marker.marked(), [obj, klass].into_iter().collect());
}

#[test]
fn test_out_of_heap_references_are_ignored() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let root = b.instance(2);
    let child = b.instance(0);
    b.set_field(root, 0, child);

    let heap = b.build(2);
    let outside = ObjectRef::from_address(heap.start() + heap.capacity() + 64);
    heap.set_field(root, 1, outside);
    assert!(!heap.is_in(outside));

    let marker = Marker::new(heap, options(2, 2));
    marker.cycle(&[ObjectRef::NULL, outside, root]);

    assert_eq!(marker.marked(), [root, child].into_iter().collect());
}

#[test]
fn test_stale_references_are_traced() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let root = b.instance(1);
    let detached = b.instance(1);
    let grandchild = b.instance(0);
    let published = (0..8).map(|_| b.instance(0)).collect::<Vec<_>>();
    b.set_field(root, 0, detached);
    b.set_field(detached, 0, grandchild);

    let marker = Marker::new(b.build(2), options(2, 2));
    let satb = marker.cm.satb_mark_queue_set().clone();
    let mutator = satb.create_queue();

    marker.cm.mark_roots(&[root]);
    assert!(satb.is_active());

    // The mutator unlinks `detached` before the marker reaches it.
    satb.enqueue(&mut mutator.lock(), marker.heap().field(root, 0));
    marker.heap().set_field(root, 0, ObjectRef::NULL);

    // The buffer fills up with otherwise unreachable objects and is published right away. The
    // last entry starts a new buffer.
    for &obj in published.iter() {
        satb.enqueue(&mut mutator.lock(), obj);
    }
    assert_eq!(satb.completed_buffers_num(), 1);
    assert_eq!(mutator.lock().len(), 1);

    assert!(!marker.cm.concurrent_mark().is_cancelled());
    let ctx = marker.cm.marking_context();
    assert!(ctx.is_marked_strong(detached));
    assert!(ctx.is_marked_strong(grandchild));
    for &obj in published[..7].iter() {
        assert!(ctx.is_marked_strong(obj));
    }
    assert!(!ctx.is_marked(published[7]));

    assert!(!marker.cm.finish_mark().is_cancelled());
    assert!(!satb.is_active());
    assert!(ctx.is_marked_strong(published[7]));
    assert_eq!(satb.completed_buffers_num(), 0);
    assert!(mutator.lock().is_empty());
}

#[test]
fn test_cancelled_mark_drops_pending_work() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let nodes = (0..2000).map(|_| b.instance(1)).collect::<Vec<_>>();
    for pair in nodes.windows(2) {
        b.set_field(pair[0], 0, pair[1]);
    }

    let marker = Marker::new(b.build(2), options(2, 2));
    let satb = marker.cm.satb_mark_queue_set().clone();

    marker.cm.mark_roots(&[nodes[0]]);
    satb.enqueue_completed_buffer(vec![nodes[1000]]);
    marker.cm.cancel();

    assert_eq!(marker.cm.concurrent_mark(), MarkOutcome::Cancelled);
    let ctx = marker.cm.marking_context();
    assert!(ctx.task_queues().is_empty());
    for index in 0..ctx.task_queues().size() {
        assert!(ctx.task_queues().queue(index).is_empty());
    }
    assert_eq!(satb.completed_buffers_num(), 0);
    assert!(!ctx.is_complete());

    // Restarting the cycle marks everything.
    marker.cycle(&[nodes[0]]);
    assert_eq!(marker.marked().len(), nodes.len());
    assert_eq!(marker.live(), marker.heap().size_of_all(nodes.iter().copied()));
}

#[test]
fn test_cancel_while_marking() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(7);
    let mut b = SimulatedHeap::builder();
    let objects = random_graph(&mut b, &mut rng, 20_000, 2);
    let roots = objects[..16].to_vec();

    let marker = Marker::new(b.build(4), options(4, 4));
    let heap = marker.heap();
    marker.cm.mark_roots(&roots);

    let outcome = std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(1));
            heap.cancellation().cancel_gc();
        });
        marker.cm.concurrent_mark()
    });

    let ctx = marker.cm.marking_context();
    match outcome {
        MarkOutcome::Cancelled => {
            assert!(ctx.task_queues().is_empty());
            assert_eq!(marker.cm.satb_mark_queue_set().completed_buffers_num(), 0);
        }
        MarkOutcome::Completed { .. } => {
            assert_eq!(marker.marked(), marker.heap().reachable(&roots));
        }
    }
}

#[test]
fn test_finish_mark_ignores_cancellation() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let a = b.instance(1);
    let c = b.instance(0);
    b.set_field(a, 0, c);

    let marker = Marker::new(b.build(2), options(2, 2));
    marker.cm.mark_roots(&[a]);
    marker.cm.cancel();

    let outcome = marker.cm.finish_mark();
    assert!(!outcome.is_cancelled());
    assert_eq!(marker.marked(), [a, c].into_iter().collect());
}

#[test]
fn test_claimable_queues_are_drained() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(11);
    let mut b = SimulatedHeap::builder();
    let objects = random_graph(&mut b, &mut rng, 1000, 2);
    let roots = objects[..24].to_vec();

    let marker = Marker::new(b.build(2), options(2, 6));
    marker.cycle(&roots);
    assert_eq!(marker.marked(), marker.heap().reachable(&roots));

    // Fewer active workers than threads in the pool.
    marker.heap().set_active_workers(1);
    marker.heap().reset_counters();
    let outcome = marker.cycle(&roots);
    assert_eq!(outcome, MarkOutcome::Completed { tasks_per_worker: vec![outcome.tasks()] });
    assert_eq!(marker.marked(), marker.heap().reachable(&roots));
}

#[test]
fn test_queue_overflow_keeps_all_tasks() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let wide = b.instance(500);
    let leaves = (0..500).map(|_| b.instance(0)).collect::<Vec<_>>();
    for (slot, &leaf) in leaves.iter().enumerate() {
        b.set_field(wide, slot, leaf);
    }

    let mut opts = options(3, 3);
    opts.task_queue_capacity = 4;
    let marker = Marker::new(b.build(3), opts);
    marker.cycle(&[wide]);

    assert_eq!(marker.marked().len(), leaves.len() + 1);
}

#[test]
fn test_cycles_start_fresh() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let a = b.instance(1);
    let c = b.instance(0);
    b.set_field(a, 0, c);

    let marker = Marker::new(b.build(1), options(1, 1));
    marker.cycle(&[a]);
    assert_eq!(marker.cm.gc_id(), 1);
    assert_eq!(marker.marked().len(), 2);

    marker.heap().set_field(a, 0, ObjectRef::NULL);
    marker.cycle(&[a]);
    assert_eq!(marker.cm.gc_id(), 2);
    assert_eq!(marker.marked(), [a].into_iter().collect());
    assert_eq!(marker.live(), marker.heap().size(a));
}

#[test]
fn test_suspendible_workers() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(5);
    let mut b = SimulatedHeap::builder();
    let objects = random_graph(&mut b, &mut rng, 5000, 2);
    let roots = objects[..8].to_vec();

    let mut opts = options(2, 2);
    opts.suspendible_workers = true;
    let marker = Marker::new(b.build(2), opts);

    let sts = marker.heap().cancellation().suspendible_thread_set();
    marker.cm.mark_roots(&roots);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..10 {
                sts.synchronize();
                sts.desynchronize();
                std::thread::sleep(Duration::from_micros(100));
            }
        });
        assert!(!marker.cm.concurrent_mark().is_cancelled());
    });
    assert!(!marker.cm.finish_mark().is_cancelled());

    assert_eq!(marker.marked(), marker.heap().reachable(&roots));
}

#[test]
fn test_mark_loop_on_caller_threads() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let a = b.instance(2);
    let c = b.instance(0);
    let d = b.instance(0);
    b.set_field(a, 0, c);
    b.set_field(a, 1, d);

    let heap = b.build(2);
    let opts = options(2, 2);
    let ctx = heap.new_marking_context(2, 64);
    let satb = SATBMarkQueueSet::new(8);
    let rp = DiscoveredReferences::new();
    let queues = ctx.task_queues();
    queues.reserve(2);

    let terminator = TaskTerminator::new(2, queues);
    let mark = Mark::new(&heap, &ctx, &satb, &opts);

    let run = || {
        std::thread::scope(|scope| {
            let handles = (0..2)
                .map(|worker_id| {
                    let mark = &mark;
                    let terminator = &terminator;
                    let rp = &rp;
                    scope.spawn(move || mark.mark_loop(worker_id, terminator, rp, true, None))
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        })
    };

    // Only the second worker has work, the first one has to steal or wait.
    queues.queue(1).push(MarkTask::new(a, false, false));
    assert_eq!(run(), vec![MarkLoopOutcome::Terminated; 2]);
    assert_eq!(mark.processed_tasks(0) + mark.processed_tasks(1), 3);
    assert_eq!(
        ctx.marked_objects().collect::<HashSet<_>>(),
        [a, c, d].into_iter().collect()
    );
    assert_eq!(ctx.total_live_data_bytes(), heap.size_of_all([a, c, d]));

    // A cancelled loop leaves its work behind for `clear`.
    ctx.reset();
    queues.reserve(2);
    terminator.reset_for_reuse(2);
    queues.queue(0).push(MarkTask::new(a, false, false));
    heap.cancellation().cancel_gc();

    assert_eq!(run(), vec![MarkLoopOutcome::Cancelled; 2]);
    assert!(!queues.queue(0).is_empty());
    mark.clear();
    assert!(queues.queue(0).is_empty());
    assert_eq!(ctx.total_live_data_bytes(), 0);
    heap.cancellation().clear_cancelled_gc();
}

#[test]
fn test_stale_buffer_withdraws_termination_offer() {
    init_logger();
    let mut b = SimulatedHeap::builder();
    let obj = b.instance(0);
    let heap = b.build(2);
    let ctx = heap.new_marking_context(2, 64);
    let satb = SATBMarkQueueSet::new(8);
    let queues = ctx.task_queues();
    queues.reserve(2);

    let terminator = TaskTerminator::with_wait_time(2, queues, Duration::from_micros(200));
    let tt = MarkTerminatorTerminator::new(&heap, &satb, true);

    std::thread::scope(|scope| {
        // One of two workers offers and parks until the other shows up or work appears.
        let offering = scope.spawn(|| terminator.offer_termination(Some(&tt)));
        std::thread::sleep(Duration::from_millis(5));
        satb.enqueue_completed_buffer(vec![obj]);
        assert!(!offering.join().unwrap());
    });
    assert!(!terminator.is_terminated());

    // With the buffer pending, a fresh offer is turned down right away.
    terminator.reset_for_reuse(1);
    assert!(!terminator.offer_termination(Some(&tt)));
    assert!(satb.get_completed_buffer().is_some());
    assert!(terminator.offer_termination(Some(&tt)));
}

/// Cancels the cycle once `limit` strings went through deduplication.
struct CancelAfter<'a> {
    cancellation: &'a GcCancellation,
    seen: AtomicUsize,
    limit: usize,
}

impl StringDedup for CancelAfter<'_> {
    fn enqueue_candidate(&self, _obj: ObjectRef) {
        if self.seen.fetch_add(1, Ordering::Relaxed) + 1 == self.limit {
            self.cancellation.cancel_gc();
        }
    }
}

#[test]
fn test_cancellation_observed_within_one_stride() {
    init_logger();
    const LENGTH: usize = 10_000;
    const LIMIT: usize = 100;

    // A chain of strings: every task is exactly one deduplication candidate.
    let mut b = SimulatedHeap::builder();
    let chain = (0..LENGTH).map(|_| b.string()).collect::<Vec<_>>();
    for pair in chain.windows(2) {
        b.set_field(pair[0], 0, pair[1]);
    }

    let heap = b.build(2);
    let opts = options(2, 2);
    let ctx = heap.new_marking_context(2, 64);
    let satb = SATBMarkQueueSet::new(8);
    let rp = DiscoveredReferences::new();
    let queues = ctx.task_queues();
    queues.reserve(2);
    queues.queue(0).push(MarkTask::new(chain[0], false, false));

    let hook = CancelAfter {
        cancellation: heap.cancellation(),
        seen: AtomicUsize::new(0),
        limit: LIMIT,
    };
    let terminator = TaskTerminator::new(2, queues);
    let mark = Mark::new(&heap, &ctx, &satb, &opts);

    let outcomes = std::thread::scope(|scope| {
        let handles = (0..2)
            .map(|worker_id| {
                let mark = &mark;
                let terminator = &terminator;
                let rp = &rp;
                let hook: &dyn StringDedup = &hook;
                scope.spawn(move || mark.mark_loop(worker_id, terminator, rp, true, Some(hook)))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(outcomes, vec![MarkLoopOutcome::Cancelled; 2]);
    let stride = opts.mark_loop_stride;
    for worker_id in 0..2 {
        assert!(
            mark.processed_tasks(worker_id) <= LIMIT + stride,
            "worker {} ran {} tasks past the cancellation",
            worker_id,
            mark.processed_tasks(worker_id)
        );
    }
    let total = mark.processed_tasks(0) + mark.processed_tasks(1);
    assert!(total >= LIMIT && total <= LIMIT + 2 * stride);
    assert!(ctx.marked_objects().count() < LENGTH);

    mark.clear();
    assert!(queues.is_empty());
    heap.cancellation().clear_cancelled_gc();
}
