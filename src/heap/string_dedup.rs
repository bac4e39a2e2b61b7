use crossbeam_queue::SegQueue;

use crate::object::ObjectRef;

/// String deduplication hook.
pub trait StringDedup: Send + Sync {
    fn is_candidate(&self, obj: ObjectRef) -> bool {
        let _ = obj;
        true
    }

    fn enqueue_candidate(&self, obj: ObjectRef);
}

/// Candidate queue drained by a deduplication thread after marking.
pub struct StringDedupQueue {
    candidates: SegQueue<ObjectRef>,
}

impl StringDedupQueue {
    pub fn new() -> Self {
        Self {
            candidates: SegQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn pop(&self) -> Option<ObjectRef> {
        self.candidates.pop()
    }
}

impl Default for StringDedupQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl StringDedup for StringDedupQueue {
    fn enqueue_candidate(&self, obj: ObjectRef) {
        self.candidates.push(obj);
    }
}
