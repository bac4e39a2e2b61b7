//! In-memory heap model for tests and benchmarks.
//!
//! Objects get fake, properly aligned addresses; their reference slots live in side tables. Every
//! object counts how often it was scanned, which makes double marking visible.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    heap::{
        heap::{GcCancellation, MarkHeap},
        marking_context::MarkingContext,
    },
    object::{ObjectKind, ObjectRef, ReferenceType, MIN_OBJECT_ALIGNMENT},
    traits::{ObjectModel, Slot, Visitor},
};

pub const HEAP_BASE: usize = 0x1000_0000;
pub const REGION_SIZE: usize = 4096;
pub const HEADER_SIZE: usize = 16;

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

struct SimObject {
    size: usize,
    kind: ObjectKind,
    slots: Box<[Slot]>,
    referent: Slot,
    class_holder: ObjectRef,
    is_string: bool,
    forwardee: AtomicUsize,
    scans: AtomicUsize,
    element_visits: AtomicUsize,
}

impl SimObject {
    fn new(size: usize, kind: ObjectKind, nslots: usize) -> Self {
        Self {
            size,
            kind,
            slots: (0..nslots).map(|_| Slot::new(0)).collect(),
            referent: Slot::new(0),
            class_holder: ObjectRef::NULL,
            is_string: false,
            forwardee: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
            element_visits: AtomicUsize::new(0),
        }
    }
}

/// Lays out the objects of a [`SimulatedHeap`].
pub struct SimulatedHeapBuilder {
    top: usize,
    objects: HashMap<usize, SimObject>,
    reserve: usize,
}

impl SimulatedHeapBuilder {
    fn alloc(&mut self, size: usize, kind: ObjectKind, nslots: usize) -> ObjectRef {
        let size = align_up(size.max(HEADER_SIZE), MIN_OBJECT_ALIGNMENT);
        let addr = self.top;
        self.top += size;
        self.objects.insert(addr, SimObject::new(size, kind, nslots));
        ObjectRef::from_address(addr)
    }

    fn object(&mut self, obj: ObjectRef) -> &mut SimObject {
        match self.objects.get_mut(&obj.to_address()) {
            Some(object) => object,
            None => panic!("{:?} is not an object", obj),
        }
    }

    pub fn instance(&mut self, nslots: usize) -> ObjectRef {
        self.alloc(HEADER_SIZE + nslots * 8, ObjectKind::Instance, nslots)
    }

    /// Instance with an explicit size in bytes.
    pub fn sized_instance(&mut self, size: usize, nslots: usize) -> ObjectRef {
        assert!(size >= HEADER_SIZE + nslots * 8, "object too small for its slots");
        self.alloc(size, ObjectKind::Instance, nslots)
    }

    pub fn string(&mut self) -> ObjectRef {
        let obj = self.instance(1);
        self.object(obj).is_string = true;
        obj
    }

    /// Reference object with `nslots` ordinary fields besides the referent.
    pub fn reference(&mut self, rtype: ReferenceType, nslots: usize) -> ObjectRef {
        self.alloc(HEADER_SIZE + (nslots + 1) * 8, ObjectKind::Reference(rtype), nslots)
    }

    pub fn obj_array(&mut self, length: usize) -> ObjectRef {
        self.alloc(HEADER_SIZE + length * 8, ObjectKind::ObjArray { length }, length)
    }

    pub fn type_array(&mut self, bytes: usize) -> ObjectRef {
        self.alloc(HEADER_SIZE + bytes, ObjectKind::TypeArray, 0)
    }

    pub fn set_field(&mut self, obj: ObjectRef, index: usize, value: ObjectRef) {
        self.object(obj).slots[index].store(value.to_address(), Ordering::Relaxed);
    }

    pub fn set_referent(&mut self, obj: ObjectRef, value: ObjectRef) {
        self.object(obj)
            .referent
            .store(value.to_address(), Ordering::Relaxed);
    }

    pub fn set_class_holder(&mut self, obj: ObjectRef, holder: ObjectRef) {
        self.object(obj).class_holder = holder;
    }

    /// Leaves `bytes` of unused space after the last object.
    pub fn reserve(&mut self, bytes: usize) -> &mut Self {
        self.reserve = bytes;
        self
    }

    pub fn build(self, active_workers: usize) -> SimulatedHeap {
        let used = self.top - HEAP_BASE + self.reserve;
        let capacity = align_up(used.max(1), REGION_SIZE);

        SimulatedHeap {
            base: HEAP_BASE,
            end: HEAP_BASE + capacity,
            objects: self.objects,
            active_workers: AtomicUsize::new(active_workers),
            unload_classes: AtomicBool::new(false),
            has_forwarded_objects: AtomicBool::new(false),
            cancellation: GcCancellation::new(),
        }
    }
}

pub struct SimulatedHeap {
    base: usize,
    end: usize,
    objects: HashMap<usize, SimObject>,
    active_workers: AtomicUsize,
    unload_classes: AtomicBool,
    has_forwarded_objects: AtomicBool,
    cancellation: GcCancellation,
}

impl SimulatedHeap {
    pub fn builder() -> SimulatedHeapBuilder {
        SimulatedHeapBuilder {
            top: HEAP_BASE,
            objects: HashMap::new(),
            reserve: 0,
        }
    }

    fn object(&self, obj: ObjectRef) -> &SimObject {
        match self.objects.get(&obj.to_address()) {
            Some(object) => object,
            None => panic!("{:?} is not an object", obj),
        }
    }

    pub fn start(&self) -> usize {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.end - self.base
    }

    /// A marking context covering this heap.
    pub fn new_marking_context(&self, max_queues: usize, queue_capacity: usize) -> MarkingContext {
        MarkingContext::with_queue_capacity(
            self.base,
            self.capacity(),
            self.num_regions(),
            max_queues,
            queue_capacity,
        )
    }

    pub fn objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.objects.keys().map(|&addr| ObjectRef::from_address(addr))
    }

    pub fn set_active_workers(&self, n: usize) {
        self.active_workers.store(n, Ordering::Relaxed);
    }

    pub fn set_unload_classes(&self, value: bool) {
        self.unload_classes.store(value, Ordering::Relaxed);
    }

    pub fn set_field(&self, obj: ObjectRef, index: usize, value: ObjectRef) {
        self.object(obj).slots[index].store(value.to_address(), Ordering::Release);
    }

    pub fn field(&self, obj: ObjectRef, index: usize) -> ObjectRef {
        ObjectRef::from_address(self.object(obj).slots[index].load(Ordering::Acquire))
    }

    /// Records that `from` has been copied to `to`.
    pub fn forward(&self, from: ObjectRef, to: ObjectRef) {
        self.object(from)
            .forwardee
            .store(to.to_address(), Ordering::Release);
        self.has_forwarded_objects.store(true, Ordering::Release);
    }

    /// How often the fields of `obj` were iterated.
    pub fn scan_count(&self, obj: ObjectRef) -> usize {
        self.object(obj).scans.load(Ordering::Relaxed)
    }

    /// Array elements visited so far, summed over all chunks.
    pub fn element_visits(&self, obj: ObjectRef) -> usize {
        self.object(obj).element_visits.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        for object in self.objects.values() {
            object.scans.store(0, Ordering::Relaxed);
            object.element_visits.store(0, Ordering::Relaxed);
        }
    }

    /// Objects strongly reachable from `roots`, following every slot, referent and class holder.
    pub fn reachable(&self, roots: &[ObjectRef]) -> HashSet<ObjectRef> {
        let mut seen = HashSet::new();
        let mut queue = roots
            .iter()
            .copied()
            .filter(|r| !r.is_null())
            .collect::<VecDeque<_>>();

        while let Some(obj) = queue.pop_front() {
            let obj = self.resolve_forwarded(obj);
            if !self.is_in(obj) || !seen.insert(obj) {
                continue;
            }
            let object = self.object(obj);
            let referent = object.referent.load(Ordering::Relaxed);
            object
                .slots
                .iter()
                .map(|slot| slot.load(Ordering::Relaxed))
                .chain(std::iter::once(referent))
                .chain(std::iter::once(object.class_holder.to_address()))
                .filter(|&addr| addr != 0)
                .for_each(|addr| queue.push_back(ObjectRef::from_address(addr)));
        }

        seen
    }

    pub fn size_of_all(&self, objects: impl IntoIterator<Item = ObjectRef>) -> usize {
        objects.into_iter().map(|obj| self.size(obj)).sum()
    }
}

impl ObjectModel for SimulatedHeap {
    fn size(&self, obj: ObjectRef) -> usize {
        self.object(obj).size
    }

    fn kind(&self, obj: ObjectRef) -> ObjectKind {
        self.object(obj).kind
    }

    fn oop_iterate(&self, obj: ObjectRef, visitor: &mut dyn Visitor) {
        let object = self.object(obj);
        object.scans.fetch_add(1, Ordering::Relaxed);
        for slot in object.slots.iter() {
            visitor.visit(slot);
        }
    }

    fn array_iterate(&self, obj: ObjectRef, from: usize, to: usize, visitor: &mut dyn Visitor) {
        let object = self.object(obj);
        let to = to.min(object.slots.len());
        if from >= to {
            return;
        }
        object.element_visits.fetch_add(to - from, Ordering::Relaxed);
        for slot in object.slots[from..to].iter() {
            visitor.visit(slot);
        }
    }

    fn referent_slot(&self, obj: ObjectRef) -> &Slot {
        &self.object(obj).referent
    }

    fn class_holder(&self, obj: ObjectRef) -> ObjectRef {
        self.object(obj).class_holder
    }

    fn is_string(&self, obj: ObjectRef) -> bool {
        self.object(obj).is_string
    }
}

impl MarkHeap for SimulatedHeap {
    fn is_in(&self, obj: ObjectRef) -> bool {
        let addr = obj.to_address();
        addr >= self.base && addr < self.end
    }

    fn num_regions(&self) -> usize {
        (self.end - self.base) / REGION_SIZE
    }

    fn region_index(&self, obj: ObjectRef) -> usize {
        (obj.to_address() - self.base) / REGION_SIZE
    }

    fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    fn unload_classes(&self) -> bool {
        self.unload_classes.load(Ordering::Relaxed)
    }

    fn has_forwarded_objects(&self) -> bool {
        self.has_forwarded_objects.load(Ordering::Acquire)
    }

    fn resolve_forwarded(&self, obj: ObjectRef) -> ObjectRef {
        match self.objects.get(&obj.to_address()) {
            Some(object) => match object.forwardee.load(Ordering::Acquire) {
                0 => obj,
                fwd => ObjectRef::from_address(fwd),
            },
            None => obj,
        }
    }

    fn cancellation(&self) -> &GcCancellation {
        &self.cancellation
    }
}
