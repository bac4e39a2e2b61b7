use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    object::{ObjectKind, ObjectRef},
    sync::suspendible_thread_set::SuspendibleThreadSetLeaver,
    utils::log2i_graceful,
};

use super::{
    closures::{MarkFlags, MarkRefsClosure},
    heap::MarkHeap,
    liveness::LiveData,
    marking_context::MarkingContext,
    options::MarkOptions,
    reference_queue::ReferenceProcessor,
    satb_mark_queue::SatbFeed,
    string_dedup::StringDedup,
    taskqueue::MarkTask,
    terminator::{TaskTerminator, TerminatorTerminator},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkLoopOutcome {
    /// All workers agreed that there is no work left.
    Terminated,
    /// The cycle was cancelled. Queues may still hold tasks.
    Cancelled,
}

/// Sends an offering worker back to its loop when stale-reference buffers are waiting or the
/// cycle got cancelled.
pub struct MarkTerminatorTerminator<'a, H: MarkHeap + ?Sized> {
    heap: &'a H,
    satb: &'a dyn SatbFeed,
    cancellable: bool,
}

impl<'a, H: MarkHeap + ?Sized> MarkTerminatorTerminator<'a, H> {
    pub fn new(heap: &'a H, satb: &'a dyn SatbFeed, cancellable: bool) -> Self {
        Self {
            heap,
            satb,
            cancellable,
        }
    }
}

impl<H: MarkHeap + ?Sized> TerminatorTerminator for MarkTerminatorTerminator<'_, H> {
    fn should_exit_termination(&self) -> bool {
        self.satb.completed_buffers_num() > 0 || (self.cancellable && self.heap.cancelled_gc())
    }
}

/// Parallel marking over a [`MarkingContext`]. One [`Mark::mark_loop`] runs per worker.
pub struct Mark<'a, H: MarkHeap + ?Sized> {
    heap: &'a H,
    ctx: &'a MarkingContext,
    satb: &'a dyn SatbFeed,
    options: &'a MarkOptions,
    processed: Box<[AtomicUsize]>,
}

impl<'a, H: MarkHeap + ?Sized> Mark<'a, H> {
    pub fn new(heap: &'a H, ctx: &'a MarkingContext, satb: &'a dyn SatbFeed, options: &'a MarkOptions) -> Self {
        Self {
            heap,
            ctx,
            satb,
            options,
            processed: (0..ctx.task_queues().size())
                .map(|_| AtomicUsize::new(0))
                .collect(),
        }
    }

    pub fn heap(&self) -> &'a H {
        self.heap
    }

    pub fn marking_context(&self) -> &'a MarkingContext {
        self.ctx
    }

    /// Tasks processed by `worker_id` in its last loop.
    pub fn processed_tasks(&self, worker_id: usize) -> usize {
        self.processed[worker_id].load(Ordering::Relaxed)
    }

    /// Drops all pending marking work: queued tasks, stale-reference buffers and unflushed
    /// liveness. Must not run concurrently with a mark loop.
    pub fn clear(&self) {
        self.ctx.task_queues().clear();
        self.satb.abandon_partial_marking();
        self.ctx.clear_liveness_caches();
    }

    /// Marks until all workers terminate or, when `cancellable`, until the cycle is cancelled.
    pub fn mark_loop(
        &self,
        worker_id: usize,
        terminator: &TaskTerminator<'_>,
        rp: &dyn ReferenceProcessor,
        cancellable: bool,
        strdedup: Option<&dyn StringDedup>,
    ) -> MarkLoopOutcome {
        let flags = MarkFlags::select(self.heap, strdedup.is_some());
        rp.set_mark_closure(worker_id, flags);

        let queues = self.ctx.task_queues();
        assert_eq!(
            queues.get_reserved(),
            self.heap.active_workers(),
            "Need to reserve proper number of queues: reserved: {}, active: {}",
            queues.get_reserved(),
            self.heap.active_workers()
        );

        let mut q = queues.queue(worker_id);
        let mut live_data = self.ctx.liveness_cache(worker_id);
        let mut cl = MarkRefsClosure::new(&mut q, self.ctx, self.heap, rp, worker_id, flags);

        log::trace!(target: "gc-mark", "worker {} enters mark loop: {:?}, cancellable: {}", worker_id, flags, cancellable);

        let mut processed = 0;
        let outcome = self.mark_loop_work(
            &mut cl,
            &mut live_data,
            worker_id,
            terminator,
            cancellable,
            strdedup,
            &mut processed,
        );
        self.processed[worker_id].store(processed, Ordering::Relaxed);

        if outcome == MarkLoopOutcome::Terminated {
            self.ctx.flush_liveness_cache(&mut live_data);
        }

        log::debug!(target: "gc-mark", "worker {} leaves mark loop: {:?}, {} tasks", worker_id, outcome, processed);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn mark_loop_work(
        &self,
        cl: &mut MarkRefsClosure<'_, H>,
        live_data: &mut LiveData,
        worker_id: usize,
        terminator: &TaskTerminator<'_>,
        cancellable: bool,
        strdedup: Option<&dyn StringDedup>,
        processed: &mut usize,
    ) -> MarkLoopOutcome {
        let stride = self.options.mark_loop_stride;
        let sts_active = self.options.suspendible_workers;
        let queues = self.ctx.task_queues();
        let heap = self.heap;

        // Drain the queues nobody owns this phase before turning to our own.
        while let Some(mut claimed) = queues.claim_next() {
            log::trace!(target: "gc-mark", "worker {} drains queue {}", worker_id, claimed.id());
            loop {
                if cancellable && heap.check_cancelled_gc_and_yield(sts_active) {
                    return MarkLoopOutcome::Cancelled;
                }

                let mut work = 0;
                for _ in 0..stride {
                    match claimed.pop() {
                        Some(task) => {
                            self.do_task(cl, live_data, task, strdedup);
                            work += 1;
                        }
                        None => break,
                    }
                }
                *processed += work;

                if work < stride {
                    break;
                }
            }
        }

        let tt = MarkTerminatorTerminator::new(heap, self.satb, cancellable);

        loop {
            if cancellable && heap.check_cancelled_gc_and_yield(sts_active) {
                return MarkLoopOutcome::Cancelled;
            }

            {
                let mut drain = |buf: &[ObjectRef]| {
                    for &obj in buf {
                        cl.do_stale_ref(obj);
                    }
                };
                while self.satb.apply_closure_to_completed_buffer(&mut drain) {}
            }

            let mut work = 0;
            for _ in 0..stride {
                let task = match cl.queue().pop() {
                    Some(task) => Some(task),
                    None => queues.steal(worker_id, cl.queue()),
                };

                match task {
                    Some(task) => {
                        self.do_task(cl, live_data, task, strdedup);
                        work += 1;
                    }
                    None => break,
                }
            }
            *processed += work;

            if work == 0 {
                // No work encountered in current stride, try to terminate. Parked threads must
                // not hold up a synchronization of the suspendible thread set.
                let _stsl = SuspendibleThreadSetLeaver::new(
                    heap.cancellation().suspendible_thread_set(),
                    cancellable && sts_active,
                );
                if terminator.offer_termination(Some(&tt)) {
                    return MarkLoopOutcome::Terminated;
                }
            }
        }
    }

    /// Scans one task. Whole-object tasks are marked first and dropped if another worker won the
    /// mark. Chunk tasks belong to an array that is already marked.
    pub fn do_task(
        &self,
        cl: &mut MarkRefsClosure<'_, H>,
        live_data: &mut LiveData,
        task: MarkTask,
        strdedup: Option<&dyn StringDedup>,
    ) {
        let heap = self.heap;
        let mut obj = task.obj();
        if cl.flags().update_refs {
            obj = heap.resolve_forwarded(obj);
        }

        assert!(heap.is_in(obj), "task references {:?}, which is outside of the heap", obj);

        if !task.is_not_chunked() {
            cl.set_weak(task.is_weak());
            self.do_chunked_array(cl, obj, task.chunk(), task.pow());
            return;
        }

        let weak = task.is_weak();
        let mut was_upgraded = false;
        let marked = if weak {
            self.ctx.mark_weak(obj)
        } else {
            self.ctx.mark_strong(obj, &mut was_upgraded)
        };

        if !marked {
            return;
        }

        cl.set_weak(weak);

        match heap.kind(obj) {
            ObjectKind::Instance => {
                cl.do_class_holder(obj);
                heap.oop_iterate(obj, cl);
                if !weak {
                    if let Some(dedup) = strdedup {
                        if heap.is_string(obj) && dedup.is_candidate(obj) {
                            dedup.enqueue_candidate(obj);
                        }
                    }
                }
            }
            ObjectKind::Reference(rtype) => {
                cl.do_class_holder(obj);
                heap.oop_iterate(obj, cl);
                cl.do_referent(obj, rtype);
            }
            ObjectKind::ObjArray { length } => {
                cl.do_class_holder(obj);
                self.do_chunked_array_start(cl, obj, length);
            }
            ObjectKind::TypeArray => {
                // No references inside.
            }
        }

        if task.count_liveness() && !was_upgraded {
            live_data.add(heap.region_index(obj), heap.size(obj));
        }
    }

    fn do_chunked_array_start(&self, cl: &mut MarkRefsClosure<'_, H>, array: ObjectRef, len: usize) {
        assert!(len <= i32::MAX as usize, "array length {} is out of range", len);
        let stride = self.options.obj_array_marking_stride;
        let weak = cl.is_weak();

        if len <= stride * 2 {
            // A few slices only, process directly.
            self.heap.array_iterate(array, 0, len, cl);
            return;
        }

        let mut bits = log2i_graceful(len);
        // Compensate for non-power-of-two arrays, cover the array in excess.
        if len != (1 << bits) {
            bits += 1;
        }

        // Only full chunks go on the queue, so chunk tasks never check the array length. The
        // prefix is cut in full-sized chunks; the irregular tail is scanned right here.
        let mut last_idx = 0;
        let mut chunk = 1;
        let mut pow = bits;

        // Handle overflow
        if pow >= 31 {
            assert_eq!(pow, 31, "sanity");
            pow -= 1;
            chunk = 2;
            last_idx = 1 << pow;
            cl.push_task(MarkTask::new_chunked(array, true, weak, 1, pow));
        }

        // Split out tasks and record the last successful right boundary to figure out the
        // irregular tail.
        while (1 << pow) > stride && chunk * 2 < MarkTask::chunk_size() {
            pow -= 1;
            let left_chunk = chunk * 2 - 1;
            let right_chunk = chunk * 2;
            let left_chunk_end = left_chunk * (1 << pow);
            if left_chunk_end < len {
                cl.push_task(MarkTask::new_chunked(array, true, weak, left_chunk, pow));
                chunk = right_chunk;
                last_idx = left_chunk_end;
            } else {
                chunk = left_chunk;
            }
        }

        if last_idx < len {
            self.heap.array_iterate(array, last_idx, len, cl);
        }
    }

    fn do_chunked_array(&self, cl: &mut MarkRefsClosure<'_, H>, array: ObjectRef, mut chunk: usize, mut pow: usize) {
        let stride = self.options.obj_array_marking_stride;
        let weak = cl.is_weak();

        // Keep splitting until the chunk is small enough, avoiding tasks that start beyond the
        // array.
        while (1 << pow) > stride && chunk * 2 < MarkTask::chunk_size() {
            pow -= 1;
            chunk *= 2;
            cl.push_task(MarkTask::new_chunked(array, true, weak, chunk - 1, pow));
        }

        let chunk_size = 1 << pow;
        let from = (chunk - 1) * chunk_size;
        let to = chunk * chunk_size;
        self.heap.array_iterate(array, from, to, cl);
    }
}
