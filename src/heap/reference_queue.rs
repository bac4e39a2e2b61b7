use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;

use crate::object::{ObjectRef, ReferenceType};

use super::{closures::MarkFlags, marking_context::MarkingContext};

/// Reference processing as seen by the marker.
pub trait ReferenceProcessor: Send + Sync {
    /// Called once per worker and phase with the tracing variant that worker uses.
    fn set_mark_closure(&self, worker_id: usize, flags: MarkFlags);

    /// Offers a reference object whose referent has not been traced yet. Returns true if the
    /// reference was discovered; the marker then leaves the referent alone, except for final
    /// references whose referent is traced weakly.
    fn discover_reference(
        &self,
        worker_id: usize,
        reference: ObjectRef,
        referent: ObjectRef,
        rtype: ReferenceType,
        ctx: &MarkingContext,
    ) -> bool;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DiscoveredReference {
    pub reference: ObjectRef,
    pub referent: ObjectRef,
    pub worker_id: usize,
}

/// Collects discovered references into one list per reference type. A reference is discovered
/// while its referent is not strongly marked.
pub struct DiscoveredReferences {
    lists: [Injector<DiscoveredReference>; 4],
    mark_closures: Mutex<Vec<Option<MarkFlags>>>,
}

impl DiscoveredReferences {
    pub fn new() -> Self {
        Self {
            lists: [Injector::new(), Injector::new(), Injector::new(), Injector::new()],
            mark_closures: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_closure(&self, worker_id: usize) -> Option<MarkFlags> {
        self.mark_closures.lock().get(worker_id).copied().flatten()
    }

    pub fn discovered_count(&self, rtype: ReferenceType) -> usize {
        self.lists[rtype.index()].len()
    }

    /// Removes and returns every reference of type `rtype` discovered so far.
    pub fn drain(&self, rtype: ReferenceType) -> Vec<DiscoveredReference> {
        let mut result = Vec::new();
        loop {
            match self.lists[rtype.index()].steal() {
                Steal::Success(reference) => result.push(reference),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        result
    }

    pub fn clear(&self) {
        for rtype in ReferenceType::ALL {
            self.drain(rtype);
        }
        self.mark_closures.lock().clear();
    }
}

impl Default for DiscoveredReferences {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceProcessor for DiscoveredReferences {
    fn set_mark_closure(&self, worker_id: usize, flags: MarkFlags) {
        let mut closures = self.mark_closures.lock();
        if closures.len() <= worker_id {
            closures.resize(worker_id + 1, None);
        }
        closures[worker_id] = Some(flags);
    }

    fn discover_reference(
        &self,
        worker_id: usize,
        reference: ObjectRef,
        referent: ObjectRef,
        rtype: ReferenceType,
        ctx: &MarkingContext,
    ) -> bool {
        if referent.is_null() || !ctx.covers(referent) || ctx.is_marked_strong(referent) {
            return false;
        }

        log::trace!(target: "gc-mark", "discovered {:?} reference {:?} -> {:?}", rtype, reference, referent);
        self.lists[rtype.index()].push(DiscoveredReference {
            reference,
            referent,
            worker_id,
        });
        true
    }
}
