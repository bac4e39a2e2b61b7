use crate::{object::ObjectRef, sync::suspendible_thread_set::SuspendibleThreadSet, traits::ObjectModel};

use super::shared_vars::SharedEnumFlag;

pub const GC_CANCELLABLE: u8 = 0;
pub const GC_CANCELLED: u8 = 1;
pub const GC_NOT_CANCELLED: u8 = 2;

/// Cancellation state of the running GC cycle.
///
/// `GC_NOT_CANCELLED` is a transient state held by a worker while it yields to a pending
/// synchronization, so that a concurrent `try_cancel_gc` spins instead of cancelling a
/// half-suspended cycle.
pub struct GcCancellation {
    cancelled_gc: SharedEnumFlag,
    sts: SuspendibleThreadSet,
}

impl GcCancellation {
    pub const fn new() -> Self {
        Self {
            cancelled_gc: SharedEnumFlag::new(GC_CANCELLABLE),
            sts: SuspendibleThreadSet::new(),
        }
    }

    pub fn suspendible_thread_set(&self) -> &SuspendibleThreadSet {
        &self.sts
    }

    /// Returns true if this call moved the state to cancelled.
    pub fn try_cancel_gc(&self) -> bool {
        loop {
            let prev = self.cancelled_gc.cmpxchg(GC_CANCELLABLE, GC_CANCELLED);
            if prev == GC_CANCELLABLE {
                return true;
            } else if prev == GC_CANCELLED {
                return false;
            }

            // A worker is yielding right now, wait for it to restore the state.
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    pub fn cancel_gc(&self) {
        if self.try_cancel_gc() {
            log::debug!(target: "gc", "Cancelling GC");
        }
    }

    pub fn cancelled_gc(&self) -> bool {
        self.cancelled_gc.get() == GC_CANCELLED
    }

    /// Checks for cancellation and, when `sts_active`, yields to a pending synchronization of
    /// the suspendible thread set.
    pub fn check_cancelled_gc_and_yield(&self, sts_active: bool) -> bool {
        if !sts_active {
            return self.cancelled_gc();
        }

        let prev = self.cancelled_gc.cmpxchg(GC_CANCELLABLE, GC_NOT_CANCELLED);

        if prev == GC_CANCELLABLE || prev == GC_NOT_CANCELLED {
            if self.sts.should_yield() {
                self.sts.yield_now();
            }

            if prev == GC_CANCELLABLE {
                self.cancelled_gc.set(GC_CANCELLABLE);
            }
            return false;
        }
        true
    }

    pub fn clear_cancelled_gc(&self) {
        self.cancelled_gc.set(GC_CANCELLABLE);
    }
}

impl Default for GcCancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// The heap as seen by the marker.
pub trait MarkHeap: ObjectModel {
    fn is_in(&self, obj: ObjectRef) -> bool;

    fn num_regions(&self) -> usize;

    fn region_index(&self, obj: ObjectRef) -> usize;

    /// Number of workers taking part in the current phase.
    fn active_workers(&self) -> usize;

    fn unload_classes(&self) -> bool;

    fn has_forwarded_objects(&self) -> bool;

    /// Returns the new location of `obj`, or `obj` itself when it has not moved.
    fn resolve_forwarded(&self, obj: ObjectRef) -> ObjectRef;

    fn cancellation(&self) -> &GcCancellation;

    fn cancelled_gc(&self) -> bool {
        self.cancellation().cancelled_gc()
    }

    fn check_cancelled_gc_and_yield(&self, sts_active: bool) -> bool {
        self.cancellation().check_cancelled_gc_and_yield(sts_active)
    }
}
