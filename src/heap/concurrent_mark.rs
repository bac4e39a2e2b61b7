use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use scoped_thread_pool::Pool;

use crate::{
    object::ObjectRef,
    sync::suspendible_thread_set::SuspendibleThreadSetJoiner,
    utils::formatted_size,
};

use super::{
    heap::MarkHeap,
    mark::{Mark, MarkLoopOutcome},
    marking_context::MarkingContext,
    options::MarkOptions,
    reference_queue::ReferenceProcessor,
    satb_mark_queue::SATBMarkQueueSet,
    string_dedup::StringDedup,
    taskqueue::MarkTask,
    terminator::TaskTerminator,
    ConcurrentPhase, PausePhase,
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MarkOutcome {
    Completed { tasks_per_worker: Vec<usize> },
    Cancelled,
}

impl MarkOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Tasks processed by all workers together.
    pub fn tasks(&self) -> usize {
        match self {
            Self::Completed { tasks_per_worker } => tasks_per_worker.iter().sum(),
            Self::Cancelled => 0,
        }
    }
}

/// Drives the marking phases of a cycle on a pool of worker threads.
///
/// A cycle is `mark_roots`, one or more `concurrent_mark` attempts and a `finish_mark`. A
/// cancelled `concurrent_mark` drops all pending work; the caller restarts from `mark_roots`.
pub struct ConcurrentMark<H: MarkHeap> {
    heap: Arc<H>,
    ctx: Arc<MarkingContext>,
    satb: Arc<SATBMarkQueueSet>,
    rp: Arc<dyn ReferenceProcessor>,
    dedup: Option<Arc<dyn StringDedup>>,
    options: MarkOptions,
    pool: Pool,
    gc_id: AtomicUsize,
}

impl<H: MarkHeap> ConcurrentMark<H> {
    pub fn new(
        heap: Arc<H>,
        ctx: Arc<MarkingContext>,
        satb: Arc<SATBMarkQueueSet>,
        rp: Arc<dyn ReferenceProcessor>,
        dedup: Option<Arc<dyn StringDedup>>,
        options: MarkOptions,
    ) -> Self {
        assert!(
            options.max_queues >= options.parallel_gc_threads,
            "need a queue per worker: {} queues for {} workers",
            options.max_queues,
            options.parallel_gc_threads
        );

        satb.set_buffer_enqueue_threshold_percentage(options.satb_buffer_enqueue_threshold);
        if !satb.set_marking_context(ctx.clone()) {
            log::debug!(target: "gc", "SATB queue set is already bound to a marking context");
        }

        log::debug!(target: "gc", "{}", options);

        Self {
            pool: Pool::new(options.parallel_gc_threads),
            heap,
            ctx,
            satb,
            rp,
            dedup,
            options,
            gc_id: AtomicUsize::new(0),
        }
    }

    pub fn heap(&self) -> &Arc<H> {
        &self.heap
    }

    pub fn marking_context(&self) -> &Arc<MarkingContext> {
        &self.ctx
    }

    pub fn satb_mark_queue_set(&self) -> &Arc<SATBMarkQueueSet> {
        &self.satb
    }

    pub fn options(&self) -> &MarkOptions {
        &self.options
    }

    pub fn gc_id(&self) -> usize {
        self.gc_id.load(Ordering::Relaxed)
    }

    /// Starts a new cycle: resets the marking state, activates the SATB barrier and seeds the
    /// queues with `roots`. Roots are dealt round-robin over all queues, so queues beyond the
    /// active worker count end up being claimed.
    pub fn mark_roots(&self, roots: &[ObjectRef]) {
        let gc_id = self.gc_id.fetch_add(1, Ordering::Relaxed) + 1;
        let _phase = PausePhase::new(gc_id, "Init Mark");

        self.heap.cancellation().clear_cancelled_gc();
        self.ctx.reset();

        let queues = self.ctx.task_queues();
        queues.reserve(self.heap.active_workers());

        if !self.satb.is_active() {
            self.satb.set_active_all_threads(true, false);
        }

        let has_forwarded = self.heap.has_forwarded_objects();
        let mut seeded = 0;
        for &root in roots {
            if root.is_null() {
                continue;
            }
            let root = if has_forwarded {
                self.heap.resolve_forwarded(root)
            } else {
                root
            };
            if !self.heap.is_in(root) {
                continue;
            }

            queues
                .queue(seeded % queues.size())
                .push(MarkTask::new(root, false, false));
            seeded += 1;
        }

        log::debug!(target: "gc", "GC({}) {} roots over {} queues", gc_id, seeded, queues.size());
    }

    /// Marks concurrently with the mutators until done or cancelled.
    pub fn concurrent_mark(&self) -> MarkOutcome {
        let _phase = ConcurrentPhase::new(self.gc_id(), "Mark");
        self.run_mark_loops(true)
    }

    /// Final, non-cancellable marking pass: publishes all mutator SATB buffers, drains them and
    /// whatever is left in the queues, then declares marking complete.
    pub fn finish_mark(&self) -> MarkOutcome {
        let _phase = PausePhase::new(self.gc_id(), "Final Mark");

        self.satb.flush_all_queues();
        let outcome = self.run_mark_loops(false);

        if self.satb.is_active() {
            self.satb.set_active_all_threads(false, true);
        }
        self.ctx.mark_complete();

        log::info!(
            target: "gc",
            "GC({}) Live data: {}",
            self.gc_id(),
            formatted_size(self.ctx.total_live_data_bytes())
        );
        outcome
    }

    /// Requests cancellation of the running cycle.
    pub fn cancel(&self) {
        self.heap.cancellation().cancel_gc();
    }

    fn run_mark_loops(&self, cancellable: bool) -> MarkOutcome {
        let heap = &*self.heap;
        let nworkers = heap.active_workers();
        assert!(
            nworkers > 0 && nworkers <= self.pool.workers(),
            "active workers out of range: {} of {}",
            nworkers,
            self.pool.workers()
        );

        let queues = self.ctx.task_queues();
        queues.reserve(nworkers);

        let terminator = TaskTerminator::with_wait_time(
            nworkers,
            queues,
            Duration::from_micros(self.options.termination_wait_micros as u64),
        );
        let mark = Mark::new(heap, &self.ctx, &*self.satb, &self.options);
        let cancelled = AtomicUsize::new(0);
        let join_sts = cancellable && self.options.suspendible_workers;

        // blocking call, waits for all mark loops to return.
        self.pool.scoped(|scope| {
            for worker_id in 0..nworkers {
                let mark = &mark;
                let terminator = &terminator;
                let cancelled = &cancelled;
                let rp = &*self.rp;
                let dedup = self.dedup.as_deref();
                let sts = heap.cancellation().suspendible_thread_set();

                scope.execute(move || {
                    let _stsj = SuspendibleThreadSetJoiner::new(sts, join_sts);
                    if mark.mark_loop(worker_id, terminator, rp, cancellable, dedup) == MarkLoopOutcome::Cancelled {
                        cancelled.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        if cancelled.load(Ordering::Relaxed) > 0 {
            log::info!(target: "gc", "GC({}) Marking cancelled", self.gc_id());
            mark.clear();
            return MarkOutcome::Cancelled;
        }

        let tasks_per_worker = (0..nworkers)
            .map(|worker_id| mark.processed_tasks(worker_id))
            .collect::<Vec<_>>();
        log::debug!(target: "gc", "GC({}) Marked with {} workers, tasks: {:?}", self.gc_id(), nworkers, tasks_per_worker);

        MarkOutcome::Completed { tasks_per_worker }
    }
}

impl<H: MarkHeap> Drop for ConcurrentMark<H> {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}
