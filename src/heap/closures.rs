use std::sync::atomic::Ordering;

use crate::{
    object::{ObjectRef, ReferenceType},
    traits::{Slot, Visitor},
};

use super::{
    heap::MarkHeap, marking_context::MarkingContext, reference_queue::ReferenceProcessor,
    taskqueue::{MarkTask, ObjToScanQueue},
};

/// Tracing variant of a worker, picked once per phase.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MarkFlags {
    /// Class metadata is traced as well so unreachable classes can be unloaded.
    pub unload_classes: bool,
    /// Some objects have moved; references are resolved and stale slots updated.
    pub update_refs: bool,
    /// String instances are offered for deduplication.
    pub string_dedup: bool,
}

impl MarkFlags {
    pub const fn new(unload_classes: bool, update_refs: bool, string_dedup: bool) -> Self {
        Self {
            unload_classes,
            update_refs,
            string_dedup,
        }
    }

    pub fn select<H: MarkHeap + ?Sized>(heap: &H, strdedup: bool) -> Self {
        Self::new(heap.unload_classes(), heap.has_forwarded_objects(), strdedup)
    }
}

/// Pushes the unmarked references it is shown onto the owning worker's queue.
pub struct MarkRefsClosure<'a, H: MarkHeap + ?Sized> {
    queue: &'a mut ObjToScanQueue,
    ctx: &'a MarkingContext,
    heap: &'a H,
    rp: &'a dyn ReferenceProcessor,
    worker_id: usize,
    flags: MarkFlags,
    weak: bool,
}

impl<'a, H: MarkHeap + ?Sized> MarkRefsClosure<'a, H> {
    pub fn new(
        queue: &'a mut ObjToScanQueue,
        ctx: &'a MarkingContext,
        heap: &'a H,
        rp: &'a dyn ReferenceProcessor,
        worker_id: usize,
        flags: MarkFlags,
    ) -> Self {
        Self {
            queue,
            ctx,
            heap,
            rp,
            worker_id,
            flags,
            weak: false,
        }
    }

    pub fn flags(&self) -> MarkFlags {
        self.flags
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// Children found from now on are traced weakly (finalizable) or strongly.
    pub fn set_weak(&mut self, weak: bool) {
        self.weak = weak;
    }

    pub fn queue(&mut self) -> &mut ObjToScanQueue {
        &mut *self.queue
    }

    pub fn push_task(&mut self, task: MarkTask) {
        self.queue.push(task);
    }

    /// Loads `slot`, updating it to the forwardee when objects may have moved.
    #[inline]
    fn load_slot(&self, slot: &Slot) -> ObjectRef {
        let raw = slot.load(Ordering::Acquire);
        let obj = ObjectRef::from_address(raw);
        if obj.is_null() || !self.flags.update_refs {
            return obj;
        }

        let fwd = self.heap.resolve_forwarded(obj);
        if fwd != obj {
            // Losing the race is fine, the winner stored the same forwardee or a newer value.
            let _ = slot.compare_exchange(raw, fwd.to_address(), Ordering::AcqRel, Ordering::Relaxed);
        }
        fwd
    }

    #[inline]
    fn resolve(&self, obj: ObjectRef) -> ObjectRef {
        if self.flags.update_refs && !obj.is_null() {
            self.heap.resolve_forwarded(obj)
        } else {
            obj
        }
    }

    #[inline]
    fn mark_through_ref(&mut self, obj: ObjectRef, weak: bool) {
        if obj.is_null() || !self.heap.is_in(obj) {
            return;
        }

        let marked = if weak {
            self.ctx.is_marked(obj)
        } else {
            self.ctx.is_marked_strong(obj)
        };

        if !marked {
            self.queue.push(MarkTask::new(obj, false, weak));
        }
    }

    #[inline]
    pub fn do_oop(&mut self, slot: &Slot) {
        let obj = self.load_slot(slot);
        self.mark_through_ref(obj, self.weak);
    }

    /// Keeps the class of `obj` alive when classes are being unloaded.
    pub fn do_class_holder(&mut self, obj: ObjectRef) {
        if !self.flags.unload_classes {
            return;
        }

        let holder = self.resolve(self.heap.class_holder(obj));
        self.mark_through_ref(holder, false);
    }

    /// Hands the referent of `reference` to the reference processor. Referents it does not take
    /// are traced like an ordinary field.
    pub fn do_referent(&mut self, reference: ObjectRef, rtype: ReferenceType) {
        let referent = self.load_slot(self.heap.referent_slot(reference));
        if referent.is_null() || !self.heap.is_in(referent) {
            return;
        }

        if self
            .rp
            .discover_reference(self.worker_id, reference, referent, rtype, self.ctx)
        {
            if rtype == ReferenceType::Final {
                self.mark_through_ref(referent, true);
            }
        } else {
            self.mark_through_ref(referent, self.weak);
        }
    }

    /// Entry of a stale-reference buffer. Always traced strongly, the slot it came from is gone.
    pub fn do_stale_ref(&mut self, obj: ObjectRef) {
        let obj = self.resolve(obj);
        self.mark_through_ref(obj, false);
    }
}

impl<H: MarkHeap + ?Sized> Visitor for MarkRefsClosure<'_, H> {
    fn visit(&mut self, slot: &Slot) {
        self.do_oop(slot);
    }
}
