//! Distributed termination for the parallel marker.
//!
//! Workers that run out of work offer termination. The offer is withdrawn as soon as tasks show up
//! in the queue set again or the terminator-terminator asks the worker to go back to the loop.
//! The phase is over once every worker has an outstanding offer at the same time.

use std::time::Duration;

use crate::sync::monitor::Monitor;

use super::taskqueue::ObjToScanQueueSet;

/// Lets the owner of a loop cut a termination attempt short, e.g. because stale-reference
/// buffers need processing or the cycle got cancelled.
pub trait TerminatorTerminator {
    fn should_exit_termination(&self) -> bool;
}

struct TerminationState {
    n_threads: usize,
    offered: usize,
    terminated: bool,
}

pub struct TaskTerminator<'a> {
    queue_set: &'a ObjToScanQueueSet,
    state: Monitor<TerminationState>,
    wait_time: Duration,
}

impl<'a> TaskTerminator<'a> {
    pub fn new(n_threads: usize, queue_set: &'a ObjToScanQueueSet) -> Self {
        Self::with_wait_time(n_threads, queue_set, Duration::from_millis(1))
    }

    pub fn with_wait_time(n_threads: usize, queue_set: &'a ObjToScanQueueSet, wait_time: Duration) -> Self {
        assert!(n_threads > 0, "terminator needs at least one thread");
        Self {
            queue_set,
            state: Monitor::new(TerminationState {
                n_threads,
                offered: 0,
                terminated: false,
            }),
            wait_time,
        }
    }

    pub fn n_threads(&self) -> usize {
        self.state.lock().n_threads
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    fn should_exit(&self, tt: Option<&dyn TerminatorTerminator>) -> bool {
        self.queue_set.tasks() > 0 || tt.map_or(false, |tt| tt.should_exit_termination())
    }

    /// Offers termination on behalf of the calling worker. Returns true once all workers agreed to
    /// terminate, false if the caller has to go back to work.
    pub fn offer_termination(&self, tt: Option<&dyn TerminatorTerminator>) -> bool {
        let mut ml = self.state.lock();

        if ml.terminated {
            return true;
        }

        if self.should_exit(tt) {
            return false;
        }

        ml.offered += 1;
        assert!(ml.offered <= ml.n_threads, "more offers than threads");

        if ml.offered == ml.n_threads {
            ml.terminated = true;
            ml.notify_all();
            log::trace!(target: "gc-mark", "termination reached with {} threads", ml.n_threads);
            return true;
        }

        loop {
            ml.wait_for(self.wait_time);

            if ml.terminated {
                return true;
            }

            if self.should_exit(tt) {
                ml.offered -= 1;
                return false;
            }
        }
    }

    /// Prepares the terminator for another phase.
    pub fn reset_for_reuse(&self, n_threads: usize) {
        assert!(n_threads > 0, "terminator needs at least one thread");
        let mut ml = self.state.lock();
        assert!(
            ml.offered == 0 || ml.terminated,
            "reset while {} threads are still offering",
            ml.offered
        );
        ml.n_threads = n_threads;
        ml.offered = 0;
        ml.terminated = false;
    }
}
