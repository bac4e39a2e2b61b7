use std::sync::atomic::AtomicUsize;

use crate::object::{ObjectKind, ObjectRef};

/// A reference field inside a heap object. Holds the address of the referenced object or zero.
pub type Slot = AtomicUsize;

pub trait Visitor {
    fn visit(&mut self, slot: &Slot);
}

impl<F: FnMut(&Slot)> Visitor for F {
    fn visit(&mut self, slot: &Slot) {
        self(slot)
    }
}

/// Object layout as seen by the marker.
pub trait ObjectModel: Send + Sync {
    /// Size of the object in bytes.
    fn size(&self, obj: ObjectRef) -> usize;

    fn kind(&self, obj: ObjectRef) -> ObjectKind;

    /// Visits every reference slot of an instance or a reference object. For reference objects
    /// the referent slot is skipped.
    fn oop_iterate(&self, obj: ObjectRef, visitor: &mut dyn Visitor);

    /// Visits the elements `[from, to)` of an object array.
    fn array_iterate(&self, obj: ObjectRef, from: usize, to: usize, visitor: &mut dyn Visitor);

    fn referent_slot(&self, obj: ObjectRef) -> &Slot;

    /// Object keeping the class metadata of `obj` alive, or null when there is none.
    fn class_holder(&self, obj: ObjectRef) -> ObjectRef {
        let _ = obj;
        ObjectRef::NULL
    }

    fn is_string(&self, obj: ObjectRef) -> bool {
        let _ = obj;
        false
    }
}
