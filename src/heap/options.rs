use std::fmt;

use once_cell::sync::Lazy;

use crate::env::{read_bool_from_env, read_uint_from_env};

use super::worker_policy::WorkerPolicy;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub const TASKQUEUE_SIZE: usize = 1 << 17;
    } else {
        pub const TASKQUEUE_SIZE: usize = 1 << 14;
    }
}

/// Tuning knobs of the marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkOptions {
    /// Worker threads in the marking pool.
    pub parallel_gc_threads: usize,
    /// Task queues in the queue set. Queues beyond the active worker count are claimable.
    pub max_queues: usize,
    /// Tasks processed between two cancellation checks.
    pub mark_loop_stride: usize,
    /// Elements of an object array scanned by a single task.
    pub obj_array_marking_stride: usize,
    /// Tasks a worker deque holds before spilling into the shared overflow.
    pub task_queue_capacity: usize,
    pub satb_buffer_size: usize,
    /// Percentage of a full SATB buffer that must survive filtering for it to be published.
    pub satb_buffer_enqueue_threshold: usize,
    /// Workers join the suspendible thread set and yield to synchronizations.
    pub suspendible_workers: bool,
    /// Upper bound of a single wait inside a termination offer.
    pub termination_wait_micros: usize,
}

impl Default for MarkOptions {
    fn default() -> Self {
        let parallel_gc_threads = WorkerPolicy::parallel_worker_threads(0);
        Self {
            parallel_gc_threads,
            max_queues: parallel_gc_threads,
            mark_loop_stride: 1000,
            obj_array_marking_stride: 2048,
            task_queue_capacity: TASKQUEUE_SIZE,
            satb_buffer_size: 1024,
            satb_buffer_enqueue_threshold: 60,
            suspendible_workers: false,
            termination_wait_micros: 1000,
        }
    }
}

static GLOBAL_OPTIONS: Lazy<MarkOptions> = Lazy::new(MarkOptions::from_env);

impl MarkOptions {
    /// Options read from the environment on first use.
    pub fn global() -> &'static MarkOptions {
        &GLOBAL_OPTIONS
    }

    pub fn from_env() -> Self {
        let mut opts = Self::default();

        opts.parallel_gc_threads = match read_uint_from_env("CONCMARK_PARALLEL_GC_THREADS") {
            Some(n) => WorkerPolicy::parallel_worker_threads(n),
            None => opts.parallel_gc_threads,
        };

        opts.max_queues = match read_uint_from_env("CONCMARK_MAX_QUEUES") {
            Some(n) if n >= opts.parallel_gc_threads => n,
            _ => opts.parallel_gc_threads,
        };

        if let Some(stride) = read_uint_from_env("CONCMARK_MARK_LOOP_STRIDE") {
            opts.mark_loop_stride = stride.max(1);
        }

        if let Some(stride) = read_uint_from_env("CONCMARK_OBJ_ARRAY_MARKING_STRIDE") {
            opts.obj_array_marking_stride = stride.max(1);
        }

        if let Some(capacity) = read_uint_from_env("CONCMARK_TASK_QUEUE_CAPACITY") {
            opts.task_queue_capacity = capacity.max(1);
        }

        if let Some(size) = read_uint_from_env("CONCMARK_SATB_BUFFER_SIZE") {
            opts.satb_buffer_size = size.max(1);
        }

        opts.satb_buffer_enqueue_threshold = match read_uint_from_env("CONCMARK_SATB_ENQUEUE_THRESHOLD") {
            Some(pct) if pct <= 100 => pct,
            _ => opts.satb_buffer_enqueue_threshold,
        };

        opts.suspendible_workers = read_bool_from_env("CONCMARK_SUSPENDIBLE_WORKERS")
            .unwrap_or(opts.suspendible_workers);

        if let Some(micros) = read_uint_from_env("CONCMARK_TERMINATION_WAIT_MICROS") {
            opts.termination_wait_micros = micros.max(1);
        }

        opts
    }
}

impl fmt::Display for MarkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Marking options:")?;
        writeln!(f, "  parallel_gc_threads: {}", self.parallel_gc_threads)?;
        writeln!(f, "  max_queues: {}", self.max_queues)?;
        writeln!(f, "  mark_loop_stride: {}", self.mark_loop_stride)?;
        writeln!(f, "  obj_array_marking_stride: {}", self.obj_array_marking_stride)?;
        writeln!(f, "  task_queue_capacity: {}", self.task_queue_capacity)?;
        writeln!(f, "  satb_buffer_size: {}", self.satb_buffer_size)?;
        writeln!(f, "  satb_buffer_enqueue_threshold: {}%", self.satb_buffer_enqueue_threshold)?;
        writeln!(f, "  suspendible_workers: {}", self.suspendible_workers)?;
        write!(f, "  termination_wait_micros: {}", self.termination_wait_micros)
    }
}
