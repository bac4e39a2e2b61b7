use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::object::ObjectRef;

use super::{
    liveness::LiveData, mark_bitmap::MarkBitmap, options::TASKQUEUE_SIZE, shared_vars::SharedFlag,
    taskqueue::{MarkTask, ObjToScanQueueSet},
};

/// Heap-wide marking state: mark bits, task queues and live data.
pub struct MarkingContext {
    mark_bit_map: MarkBitmap,
    is_complete: SharedFlag,
    task_queues: ObjToScanQueueSet,
    liveness_caches: Box<[Mutex<LiveData>]>,
    live_data: Box<[AtomicUsize]>,
}

impl MarkingContext {
    pub fn new(heap_start: usize, heap_size: usize, num_regions: usize, max_queues: usize) -> Self {
        Self::with_queue_capacity(heap_start, heap_size, num_regions, max_queues, TASKQUEUE_SIZE)
    }

    pub fn with_queue_capacity(
        heap_start: usize,
        heap_size: usize,
        num_regions: usize,
        max_queues: usize,
        queue_capacity: usize,
    ) -> Self {
        // Tasks keep only the low address bits, the whole heap has to fit in them.
        assert!(
            heap_start <= MarkTask::max_addressable()
                && heap_size <= MarkTask::max_addressable() - heap_start,
            "heap [{:#x}, +{:#x}) exceeds the task address limit {:#x}",
            heap_start,
            heap_size,
            MarkTask::max_addressable()
        );

        Self {
            mark_bit_map: MarkBitmap::new(heap_start, heap_size),
            is_complete: SharedFlag::new(),
            task_queues: ObjToScanQueueSet::new(max_queues, queue_capacity),
            liveness_caches: (0..max_queues)
                .map(|_| Mutex::new(LiveData::new(num_regions)))
                .collect(),
            live_data: (0..num_regions).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn task_queues(&self) -> &ObjToScanQueueSet {
        &self.task_queues
    }

    pub fn mark_bitmap(&self) -> &MarkBitmap {
        &self.mark_bit_map
    }

    pub fn covers(&self, obj: ObjectRef) -> bool {
        self.mark_bit_map.covers(obj)
    }

    #[inline]
    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        self.mark_bit_map.is_marked(obj)
    }

    #[inline]
    pub fn is_marked_strong(&self, obj: ObjectRef) -> bool {
        self.mark_bit_map.is_marked_strong(obj)
    }

    #[inline]
    pub fn is_marked_weak(&self, obj: ObjectRef) -> bool {
        self.mark_bit_map.is_marked_weak(obj)
    }

    /// Marks the object strongly. Returns true if this thread won the mark; `was_upgraded` tells
    /// whether the object had been marked weakly before.
    #[inline]
    pub fn mark_strong(&self, obj: ObjectRef, was_upgraded: &mut bool) -> bool {
        self.mark_bit_map.mark_strong(obj, was_upgraded)
    }

    #[inline]
    pub fn mark_weak(&self, obj: ObjectRef) -> bool {
        self.mark_bit_map.mark_weak(obj)
    }

    pub fn clear_bitmap(&self) {
        self.mark_bit_map.clear();
    }

    pub fn marked_objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.mark_bit_map.marked_objects()
    }

    /// Takes the liveness cache of `worker_id` for the duration of a phase.
    pub fn liveness_cache(&self, worker_id: usize) -> MutexGuard<'_, LiveData> {
        match self.liveness_caches[worker_id].try_lock() {
            Some(cache) => cache,
            None => panic!("liveness cache {} is already in use", worker_id),
        }
    }

    pub fn flush_liveness_cache(&self, cache: &mut LiveData) {
        cache.flush(&self.live_data);
    }

    pub fn clear_liveness_caches(&self) {
        for cache in self.liveness_caches.iter() {
            cache.lock().clear();
        }
    }

    pub fn get_live_data_bytes(&self, region: usize) -> usize {
        self.live_data[region].load(Ordering::Relaxed)
    }

    pub fn total_live_data_bytes(&self) -> usize {
        self.live_data.iter().map(|x| x.load(Ordering::Relaxed)).sum()
    }

    pub fn clear_live_data(&self) {
        for live in self.live_data.iter() {
            live.store(0, Ordering::Relaxed);
        }
    }

    /// Resets everything for a fresh cycle.
    pub fn reset(&self) {
        self.task_queues.clear();
        self.clear_liveness_caches();
        self.clear_live_data();
        self.clear_bitmap();
        self.mark_incomplete();
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete.is_set()
    }

    pub fn mark_complete(&self) {
        self.is_complete.set();
    }

    pub fn mark_incomplete(&self) {
        self.is_complete.unset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MIN_OBJECT_ALIGNMENT;

    #[test]
    fn test_liveness_flush_into_regions() {
        let ctx = MarkingContext::new(0x10000, 4096, 4, 2);
        {
            let mut cache = ctx.liveness_cache(1);
            cache.add(2, 48);
            ctx.flush_liveness_cache(&mut cache);
            ctx.flush_liveness_cache(&mut cache);
        }
        assert_eq!(ctx.get_live_data_bytes(2), 48);
        assert_eq!(ctx.total_live_data_bytes(), 48);

        let obj = ObjectRef::from_address(0x10000 + 5 * MIN_OBJECT_ALIGNMENT);
        let mut upgraded = false;
        assert!(ctx.mark_strong(obj, &mut upgraded));
        ctx.mark_complete();

        ctx.reset();
        assert!(!ctx.is_marked(obj));
        assert!(!ctx.is_complete());
        assert_eq!(ctx.total_live_data_bytes(), 0);
    }

    #[test]
    #[should_panic]
    fn test_liveness_cache_is_exclusive() {
        let ctx = MarkingContext::new(0x10000, 4096, 1, 1);
        let _first = ctx.liveness_cache(0);
        let _second = ctx.liveness_cache(0);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_heap_up_to_task_address_limit() {
        let limit = MarkTask::max_addressable();
        let ctx = MarkingContext::new(limit - 4096, 4096, 1, 1);
        let last = ObjectRef::from_address(limit - MIN_OBJECT_ALIGNMENT);
        assert!(ctx.covers(last));
        assert_eq!(MarkTask::new(last, false, false).obj(), last);
    }

    #[test]
    #[should_panic(expected = "task address limit")]
    #[cfg(target_pointer_width = "64")]
    fn test_heap_above_task_address_limit() {
        MarkingContext::new(1 << 50, 4096, 1, 1);
    }

    #[test]
    #[should_panic(expected = "task address limit")]
    #[cfg(target_pointer_width = "64")]
    fn test_heap_crossing_task_address_limit() {
        MarkingContext::new(MarkTask::max_addressable() - 4096, 8192, 1, 1);
    }
}
