//! Set of GC threads that can be suspended as a group.
//!
//! Concurrent GC workers join the set while they touch heap state. A thread that wants all of
//! them parked (e.g. to run a pause) calls [`SuspendibleThreadSet::synchronize`], which returns
//! once every joined thread has either yielded or left the set.

use std::sync::atomic::{AtomicBool, Ordering};

use super::monitor::Monitor;

struct State {
    nthreads: usize,
    nthreads_stopped: usize,
    suspend_all: bool,
}

impl State {
    fn is_synchronized(&self) -> bool {
        self.nthreads_stopped == self.nthreads
    }
}

pub struct SuspendibleThreadSet {
    suspend_all: AtomicBool,
    state: Monitor<State>,
}

impl SuspendibleThreadSet {
    pub const fn new() -> Self {
        Self {
            suspend_all: AtomicBool::new(false),
            state: Monitor::new(State {
                nthreads: 0,
                nthreads_stopped: 0,
                suspend_all: false,
            }),
        }
    }

    /// Adds the current thread to the set. Blocks while a synchronization is in progress.
    pub fn join(&self) {
        let mut ml = self.state.lock();
        while ml.suspend_all {
            ml.wait();
        }
        ml.nthreads += 1;
    }

    pub fn leave(&self) {
        let mut ml = self.state.lock();
        assert!(ml.nthreads > 0, "invalid");
        ml.nthreads -= 1;
        if ml.suspend_all && ml.is_synchronized() {
            ml.notify_all();
        }
    }

    #[inline]
    pub fn should_yield(&self) -> bool {
        self.suspend_all.load(Ordering::Acquire)
    }

    /// Parks the current thread until the pending synchronization is over.
    pub fn yield_now(&self) {
        let mut ml = self.state.lock();
        if !ml.suspend_all {
            return;
        }

        ml.nthreads_stopped += 1;
        if ml.is_synchronized() {
            ml.notify_all();
        }
        while ml.suspend_all {
            ml.wait();
        }
        assert!(ml.nthreads_stopped > 0, "invalid");
        ml.nthreads_stopped -= 1;
    }

    pub fn synchronize(&self) {
        let mut ml = self.state.lock();
        assert!(!ml.suspend_all, "Only one thread can do this.");
        ml.suspend_all = true;
        self.suspend_all.store(true, Ordering::Release);
        log::trace!(target: "gc", "STS synchronize: {} threads", ml.nthreads);
        while !ml.is_synchronized() {
            ml.wait();
        }
    }

    pub fn desynchronize(&self) {
        let mut ml = self.state.lock();
        assert!(ml.suspend_all, "STS not synchronizing");
        ml.suspend_all = false;
        self.suspend_all.store(false, Ordering::Release);
        ml.notify_all();
    }

    pub fn nthreads(&self) -> usize {
        self.state.lock().nthreads
    }
}

impl Default for SuspendibleThreadSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Joins the set for the lifetime of the guard when `active`.
pub struct SuspendibleThreadSetJoiner<'a> {
    sts: &'a SuspendibleThreadSet,
    active: bool,
}

impl<'a> SuspendibleThreadSetJoiner<'a> {
    pub fn new(sts: &'a SuspendibleThreadSet, active: bool) -> Self {
        if active {
            sts.join();
        }
        Self { sts, active }
    }

    pub fn should_yield(&self) -> bool {
        self.active && self.sts.should_yield()
    }

    pub fn yield_now(&self) {
        assert!(self.active, "Thread has not joined the suspendible thread set");
        self.sts.yield_now();
    }
}

impl Drop for SuspendibleThreadSetJoiner<'_> {
    fn drop(&mut self) {
        if self.active {
            self.sts.leave();
        }
    }
}

/// Leaves the set for the lifetime of the guard when `active`, rejoining on drop.
pub struct SuspendibleThreadSetLeaver<'a> {
    sts: &'a SuspendibleThreadSet,
    active: bool,
}

impl<'a> SuspendibleThreadSetLeaver<'a> {
    pub fn new(sts: &'a SuspendibleThreadSet, active: bool) -> Self {
        if active {
            sts.leave();
        }
        Self { sts, active }
    }
}

impl Drop for SuspendibleThreadSetLeaver<'_> {
    fn drop(&mut self) {
        if self.active {
            self.sts.join();
        }
    }
}
