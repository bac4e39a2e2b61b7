use std::time::Instant;

pub mod closures;
pub mod concurrent_mark;
pub mod heap;
pub mod liveness;
pub mod mark;
pub mod mark_bitmap;
pub mod marking_context;
pub mod options;
pub mod reference_queue;
pub mod satb_mark_queue;
pub mod shared_vars;
pub mod string_dedup;
pub mod taskqueue;
pub mod terminator;
pub mod worker_policy;

/// Logs the duration of a concurrent phase when dropped.
pub struct ConcurrentPhase {
    gc_id: usize,
    name: &'static str,
    start: Instant,
}

/// Logs the duration of a pause when dropped.
pub struct PausePhase {
    gc_id: usize,
    name: &'static str,
    start: Instant,
}

impl ConcurrentPhase {
    pub fn new(gc_id: usize, name: &'static str) -> Self {
        Self {
            gc_id,
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for ConcurrentPhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Concurrent {} {}ms", self.gc_id, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}

impl PausePhase {
    pub fn new(gc_id: usize, name: &'static str) -> Self {
        Self {
            gc_id,
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for PausePhase {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        log::info!(target: "gc", "GC({}) Pause {} {}ms", self.gc_id, self.name, elapsed.as_micros() as f64 / 1000.0);
    }
}
