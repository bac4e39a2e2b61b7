//! Snapshot-at-the-beginning buffers.
//!
//! Mutators record the previous value of every reference field they overwrite while marking is
//! active. Full buffers are filtered, then published as completed buffers that the marking loop
//! drains and treats as roots.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_queue::SegQueue;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::object::ObjectRef;

use super::marking_context::MarkingContext;

/// Source of completed stale-reference buffers for the marking loop.
pub trait SatbFeed: Send + Sync {
    /// Racy number of buffers ready for processing.
    fn completed_buffers_num(&self) -> usize;

    /// Hands the entries of one completed buffer to `cl` and retires the buffer. Returns false
    /// if there was no buffer.
    fn apply_closure_to_completed_buffer(&self, cl: &mut dyn FnMut(&[ObjectRef])) -> bool;

    /// Drops all recorded values. Used when marking is abandoned.
    fn abandon_partial_marking(&self);
}

/// Per-mutator buffer.
pub struct SATBMarkQueue {
    buf: Vec<ObjectRef>,
    is_active: bool,
}

impl SATBMarkQueue {
    pub const fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn set_active(&mut self, value: bool) {
        self.is_active = value;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

pub struct SATBMarkQueueSet {
    buffer_size: usize,
    list: SegQueue<Vec<ObjectRef>>,
    count_and_process_flag: AtomicUsize,
    process_completed_buffers_threshold: AtomicUsize,
    buffer_enqueue_threshold: AtomicUsize,
    all_active: AtomicBool,
    queues: Mutex<Vec<Arc<Mutex<SATBMarkQueue>>>>,
    marking_context: OnceCell<Arc<MarkingContext>>,
}

impl SATBMarkQueueSet {
    pub fn new(buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "SATB buffers must hold at least one entry");
        Self {
            buffer_size,
            list: SegQueue::new(),
            count_and_process_flag: AtomicUsize::new(0),
            process_completed_buffers_threshold: AtomicUsize::new(usize::MAX),
            buffer_enqueue_threshold: AtomicUsize::new(1),
            all_active: AtomicBool::new(false),
            queues: Mutex::new(Vec::new()),
            marking_context: OnceCell::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Installs the context used to drop already marked entries from full buffers. Returns false
    /// if a context was installed before.
    pub fn set_marking_context(&self, ctx: Arc<MarkingContext>) -> bool {
        self.marking_context.set(ctx).is_ok()
    }

    /// Creates a buffer for a new mutator thread.
    pub fn create_queue(&self) -> Arc<Mutex<SATBMarkQueue>> {
        let queue = Arc::new(Mutex::new(SATBMarkQueue {
            buf: Vec::with_capacity(self.buffer_size),
            is_active: self.is_active(),
        }));
        self.queues.lock().push(queue.clone());
        queue
    }

    /// Forgets the buffer of an exiting thread, publishing whatever it still holds.
    pub fn remove_queue(&self, queue: &Arc<Mutex<SATBMarkQueue>>) {
        self.flush_queue(&mut queue.lock());
        self.queues.lock().retain(|q| !Arc::ptr_eq(q, queue));
    }

    pub fn buffer_enqueue_threshold(&self) -> usize {
        self.buffer_enqueue_threshold.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.all_active.load(Ordering::Acquire)
    }

    pub fn set_active_all_threads(&self, active: bool, expected_active: bool) {
        assert_eq!(
            self.is_active(),
            expected_active,
            "SATB queue set activity does not match the expected state"
        );
        self.all_active.store(active, Ordering::Release);

        for queue in self.queues.lock().iter() {
            let mut queue = queue.lock();
            assert!(
                !active || queue.buf.is_empty(),
                "queues should be empty when activated"
            );
            queue.set_active(active);
        }
    }

    /// Records `obj` as the value overwritten by a mutator.
    #[inline]
    pub fn enqueue(&self, queue: &mut SATBMarkQueue, obj: ObjectRef) {
        if !queue.is_active || obj.is_null() {
            return;
        }

        queue.buf.push(obj);
        if queue.buf.len() >= self.buffer_size {
            self.handle_full_buffer(queue);
        }
    }

    #[cold]
    #[inline(never)]
    fn handle_full_buffer(&self, queue: &mut SATBMarkQueue) {
        self.filter_marked(queue);
        if self.should_enqueue_buffer(queue) {
            let buf = std::mem::replace(&mut queue.buf, Vec::with_capacity(self.buffer_size));
            self.enqueue_completed_buffer(buf);
        }
    }

    fn should_enqueue_buffer(&self, queue: &SATBMarkQueue) -> bool {
        self.buffer_size - queue.buf.len() < self.buffer_enqueue_threshold()
    }

    /// Drops entries for which `filter_out` returns true.
    pub fn filter(&self, filter_out: impl Fn(ObjectRef) -> bool, queue: &mut SATBMarkQueue) {
        queue.buf.retain(|&obj| !filter_out(obj));
    }

    pub fn filter_marked(&self, queue: &mut SATBMarkQueue) {
        if let Some(ctx) = self.marking_context.get() {
            self.filter(|obj| ctx.covers(obj) && ctx.is_marked_strong(obj), queue);
        }
    }

    /// Publishes the partial buffer of `queue`.
    pub fn flush_queue(&self, queue: &mut SATBMarkQueue) {
        // Filter now to possibly save work later.
        self.filter_marked(queue);

        if !queue.buf.is_empty() {
            let buf = std::mem::replace(&mut queue.buf, Vec::with_capacity(self.buffer_size));
            self.enqueue_completed_buffer(buf);
        }
    }

    pub fn flush_all_queues(&self) {
        for queue in self.queues.lock().iter() {
            self.flush_queue(&mut queue.lock());
        }
    }

    pub fn enqueue_completed_buffer(&self, buf: Vec<ObjectRef>) {
        // Count first so a consumer never observes a buffer it cannot account for.
        increment_count(
            &self.count_and_process_flag,
            self.process_completed_buffers_threshold
                .load(Ordering::Relaxed),
        );
        self.list.push(buf);
    }

    pub fn get_completed_buffer(&self) -> Option<Vec<ObjectRef>> {
        let buf = self.list.pop()?;
        decrement_count(&self.count_and_process_flag);
        Some(buf)
    }

    /// The number of buffers in the list. Racy and not updated atomically with the set of
    /// completed buffers.
    pub fn completed_buffers_num(&self) -> usize {
        self.count_and_process_flag.load(Ordering::Acquire) >> 1
    }

    /// Return true if completed buffers should be processed.
    pub fn process_completed_buffers(&self) -> bool {
        (self.count_and_process_flag.load(Ordering::Acquire) & 1) != 0
    }

    pub fn set_process_completed_buffers_threshold(&self, value: usize) {
        let mut scaled_value = value.wrapping_shl(1);
        if scaled_value.wrapping_shr(1) != value {
            scaled_value = usize::MAX;
        }

        self.process_completed_buffers_threshold
            .store(scaled_value | 1, Ordering::Relaxed);
    }

    /// A full buffer is published only if more than `value` percent of it survives filtering.
    pub fn set_buffer_enqueue_threshold_percentage(&self, value: usize) {
        let size = self.buffer_size;
        let enqueue_qty = (size * value.min(100)) / 100;
        self.buffer_enqueue_threshold
            .store((size - enqueue_qty).max(1), Ordering::Relaxed);
    }

    pub fn abandon_completed_buffers(&self) {
        while self.get_completed_buffer().is_some() {}
    }

    pub fn abandon_partial_marking(&self) {
        self.abandon_completed_buffers();

        for queue in self.queues.lock().iter() {
            queue.lock().buf.clear();
        }
    }
}

impl SatbFeed for SATBMarkQueueSet {
    fn completed_buffers_num(&self) -> usize {
        SATBMarkQueueSet::completed_buffers_num(self)
    }

    fn apply_closure_to_completed_buffer(&self, cl: &mut dyn FnMut(&[ObjectRef])) -> bool {
        match self.get_completed_buffer() {
            Some(buf) => {
                cl(&buf);
                true
            }
            None => false,
        }
    }

    fn abandon_partial_marking(&self) {
        SATBMarkQueueSet::abandon_partial_marking(self)
    }
}

fn increment_count(cf: &AtomicUsize, threshold: usize) {
    let mut value = cf.load(Ordering::Relaxed);
    loop {
        let old = value;
        let mut new_value = old + 2;
        assert!(new_value > old, "overflow");
        if new_value > threshold {
            new_value |= 1;
        }

        match cf.compare_exchange_weak(old, new_value, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break,
            Err(current) => value = current,
        }
    }
}

fn decrement_count(cf: &AtomicUsize) {
    let mut value = cf.load(Ordering::Relaxed);
    loop {
        assert!((value >> 1) != 0, "underflow: {}", value);
        let old = value;
        let mut new_value = old - 2;
        if new_value <= 1 {
            new_value = 0;
        }

        match cf.compare_exchange_weak(old, new_value, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break,
            Err(current) => value = current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MIN_OBJECT_ALIGNMENT;

    fn obj(i: usize) -> ObjectRef {
        ObjectRef::from_address(0x10000 + i * MIN_OBJECT_ALIGNMENT)
    }

    #[test]
    fn test_inactive_queue_records_nothing() {
        let qset = SATBMarkQueueSet::new(4);
        let queue = qset.create_queue();
        qset.enqueue(&mut queue.lock(), obj(1));
        assert!(queue.lock().is_empty());
    }

    #[test]
    fn test_full_buffer_is_published() {
        let qset = SATBMarkQueueSet::new(4);
        qset.set_buffer_enqueue_threshold_percentage(60);
        let queue = qset.create_queue();
        qset.set_active_all_threads(true, false);

        for i in 0..4 {
            qset.enqueue(&mut queue.lock(), obj(i));
        }
        qset.enqueue(&mut queue.lock(), ObjectRef::NULL);

        assert_eq!(qset.completed_buffers_num(), 1);
        assert!(queue.lock().is_empty());

        let mut seen = Vec::new();
        assert!(qset.apply_closure_to_completed_buffer(&mut |buf: &[ObjectRef]| {
            seen.extend_from_slice(buf)
        }));
        assert_eq!(seen, (0..4).map(obj).collect::<Vec<_>>());
        assert_eq!(qset.completed_buffers_num(), 0);
        assert!(!qset.apply_closure_to_completed_buffer(&mut |_: &[ObjectRef]| {}));
    }

    #[test]
    fn test_filtered_buffer_is_reused() {
        let ctx = Arc::new(MarkingContext::new(0x10000, 4096, 1, 1));
        let qset = SATBMarkQueueSet::new(4);
        qset.set_buffer_enqueue_threshold_percentage(60);
        assert!(qset.set_marking_context(ctx.clone()));
        let queue = qset.create_queue();
        qset.set_active_all_threads(true, false);

        let mut upgraded = false;
        for i in 0..3 {
            ctx.mark_strong(obj(i), &mut upgraded);
        }
        for i in 0..4 {
            qset.enqueue(&mut queue.lock(), obj(i));
        }

        // Only one of four entries survived, not enough to publish.
        assert_eq!(qset.completed_buffers_num(), 0);
        assert_eq!(queue.lock().len(), 1);

        qset.flush_all_queues();
        assert_eq!(qset.completed_buffers_num(), 1);
    }

    #[test]
    fn test_process_flag_follows_threshold() {
        let qset = SATBMarkQueueSet::new(2);
        qset.set_process_completed_buffers_threshold(1);

        qset.enqueue_completed_buffer(vec![obj(0)]);
        assert!(!qset.process_completed_buffers());
        qset.enqueue_completed_buffer(vec![obj(1)]);
        assert!(qset.process_completed_buffers());
        assert_eq!(qset.completed_buffers_num(), 2);

        qset.abandon_completed_buffers();
        assert_eq!(qset.completed_buffers_num(), 0);
        assert!(!qset.process_completed_buffers());
    }

    #[test]
    fn test_abandon_partial_marking() {
        let qset = SATBMarkQueueSet::new(8);
        let queue = qset.create_queue();
        qset.set_active_all_threads(true, false);
        qset.enqueue(&mut queue.lock(), obj(1));
        qset.enqueue_completed_buffer(vec![obj(2)]);

        SatbFeed::abandon_partial_marking(&qset);
        assert_eq!(qset.completed_buffers_num(), 0);
        assert!(queue.lock().is_empty());

        qset.set_active_all_threads(false, true);
        assert!(!queue.lock().is_active());
    }
}
