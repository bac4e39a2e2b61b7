use std::{
    mem::size_of,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Mutex, MutexGuard};
use rand::{
    distributions::{Distribution, Uniform},
    thread_rng,
};

use crate::{
    object::ObjectRef,
    utils::{nth_bit, right_nth_bit},
};

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Unit of marking work: either a whole object or a chunk of an object array.
        ///
        /// The array block is encoded as (chunk * 2^pow), assuming the block is 2^pow elements
        /// long. Everything is stolen from the upper bits of the object address:
        ///
        ///    |xx-------obj---------|-pow-|--chunk---|
        ///    0                    49     54        64
        ///
        /// chunk == 0 means "no chunk", chunking starts from 1.
        ///
        /// The two low bits of obj hold the "skip_live" and "weak" flags, which are always free
        /// because objects are aligned. Both default to zero, which matches the common case of a
        /// strong, live-counted reference. A plain object task therefore is just the address
        /// padded with zeroes, and testing for chunkedness is a single mask test.
        ///
        /// Chunk <C, P> covers [ (C-1)*2^P; C*2^P ) and splits into <2*C - 1, P-1> and
        /// <2*C, P-1>, whose union is the original interval.
        ///
        /// Limits of this layout:
        ///    10 bits for chunk: max 1024 blocks per array
        ///     5 bits for power: max 2^32 array
        ///    49 bits for   obj: max 512 TB of addressable space
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct MarkTask {
            obj: usize,
        }

        impl MarkTask {
            pub const CHUNK_BITS: usize = 10;
            pub const POW_BITS: usize = 5;
            pub const OOP_BITS: usize = size_of::<usize>() * 8 - Self::CHUNK_BITS - Self::POW_BITS;

            pub const POW_SHIFT: usize = Self::OOP_BITS;
            pub const CHUNK_SHIFT: usize = Self::OOP_BITS + Self::POW_BITS;

            pub const OOP_EXTRACT_MASK: usize = right_nth_bit(Self::OOP_BITS) - 3;
            pub const SKIP_LIVE_EXTRACT_MASK: usize = 1 << 0;
            pub const WEAK_EXTRACT_MASK: usize = 1 << 1;
            pub const CHUNK_POW_EXTRACT_MASK: usize = !right_nth_bit(Self::OOP_BITS);

            pub const CHUNK_RANGE_MASK: usize = right_nth_bit(Self::CHUNK_BITS);
            pub const POW_RANGE_MASK: usize = right_nth_bit(Self::POW_BITS);

            #[inline]
            fn encode_oop(obj: ObjectRef, skip_live: bool, weak: bool) -> usize {
                let mut encoded = obj.to_address();
                assert!(
                    encoded & !Self::OOP_EXTRACT_MASK == 0,
                    "{:?} cannot be encoded in a task",
                    obj
                );
                if skip_live {
                    encoded |= Self::SKIP_LIVE_EXTRACT_MASK;
                }

                if weak {
                    encoded |= Self::WEAK_EXTRACT_MASK;
                }

                encoded
            }

            #[inline]
            pub fn new(obj: ObjectRef, skip_live: bool, weak: bool) -> Self {
                Self {
                    obj: Self::encode_oop(obj, skip_live, weak),
                }
            }

            #[inline]
            pub fn new_chunked(obj: ObjectRef, skip_live: bool, weak: bool, chunk: usize, pow: usize) -> Self {
                assert!(chunk < Self::chunk_size(), "chunk is in range: {}", chunk);
                assert!(pow < nth_bit(Self::POW_BITS), "pow is in range: {}", pow);

                Self {
                    obj: Self::encode_oop(obj, skip_live, weak)
                        | (chunk << Self::CHUNK_SHIFT)
                        | (pow << Self::POW_SHIFT),
                }
            }

            #[inline]
            pub fn obj(self) -> ObjectRef {
                ObjectRef::from_address(self.obj & Self::OOP_EXTRACT_MASK)
            }

            #[inline]
            pub fn chunk(self) -> usize {
                (self.obj >> Self::CHUNK_SHIFT) & Self::CHUNK_RANGE_MASK
            }

            #[inline]
            pub fn pow(self) -> usize {
                (self.obj >> Self::POW_SHIFT) & Self::POW_RANGE_MASK
            }

            #[inline]
            pub fn is_not_chunked(self) -> bool {
                (self.obj & Self::CHUNK_POW_EXTRACT_MASK) == 0
            }

            #[inline]
            pub fn is_weak(self) -> bool {
                (self.obj & Self::WEAK_EXTRACT_MASK) != 0
            }

            #[inline]
            pub fn count_liveness(self) -> bool {
                (self.obj & Self::SKIP_LIVE_EXTRACT_MASK) == 0
            }

            #[inline]
            pub fn max_addressable() -> usize {
                nth_bit(Self::OOP_BITS)
            }
        }
    } else {
        /// Unit of marking work: either a whole object or a chunk of an object array.
        ///
        /// Plain-field layout for targets whose pointers leave no spare upper bits. Chunk <C, P>
        /// covers [ (C-1)*2^P; C*2^P ); chunk == 0 means "no chunk".
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct MarkTask {
            obj: ObjectRef,
            skip_live: bool,
            weak: bool,
            chunk: u16,
            pow: u8,
        }

        impl MarkTask {
            pub const CHUNK_BITS: usize = 10;
            pub const POW_BITS: usize = 5;

            #[inline]
            pub fn new(obj: ObjectRef, skip_live: bool, weak: bool) -> Self {
                Self {
                    obj,
                    skip_live,
                    weak,
                    chunk: 0,
                    pow: 0,
                }
            }

            #[inline]
            pub fn new_chunked(obj: ObjectRef, skip_live: bool, weak: bool, chunk: usize, pow: usize) -> Self {
                assert!(chunk < Self::chunk_size(), "chunk is in range: {}", chunk);
                assert!(pow < nth_bit(Self::POW_BITS), "pow is in range: {}", pow);

                Self {
                    obj,
                    skip_live,
                    weak,
                    chunk: chunk as u16,
                    pow: pow as u8,
                }
            }

            #[inline]
            pub fn obj(self) -> ObjectRef {
                self.obj
            }

            #[inline]
            pub fn chunk(self) -> usize {
                self.chunk as usize
            }

            #[inline]
            pub fn pow(self) -> usize {
                self.pow as usize
            }

            #[inline]
            pub fn is_not_chunked(self) -> bool {
                self.chunk == 0
            }

            #[inline]
            pub fn is_weak(self) -> bool {
                self.weak
            }

            #[inline]
            pub fn count_liveness(self) -> bool {
                !self.skip_live
            }

            #[inline]
            pub fn max_addressable() -> usize {
                usize::MAX
            }
        }
    }
}

impl MarkTask {
    #[inline]
    pub fn chunk_size() -> usize {
        nth_bit(Self::CHUNK_BITS)
    }
}

impl std::fmt::Debug for MarkTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkTask")
            .field("obj", &self.obj())
            .field("skip_live", &!self.count_liveness())
            .field("weak", &self.is_weak())
            .field("chunk", &self.chunk())
            .field("pow", &self.pow())
            .finish()
    }
}

/// Per-worker queue of marking tasks.
///
/// The most recently pushed task sits in a one-element buffer, so a push immediately followed by
/// a pop never touches the deque. Older tasks live in a Chase-Lev deque whose far end is
/// stealable. Once the deque holds `capacity` tasks further pushes go to the shared overflow.
pub struct ObjToScanQueue {
    id: usize,
    elem: Option<MarkTask>,
    deque: Worker<MarkTask>,
    overflow: Arc<Injector<MarkTask>>,
    capacity: usize,
    last_stolen_queue_id: Option<usize>,
}

impl ObjToScanQueue {
    fn new(id: usize, capacity: usize, overflow: Arc<Injector<MarkTask>>) -> Self {
        Self {
            id,
            elem: None,
            deque: Worker::new_lifo(),
            overflow,
            capacity,
            last_stolen_queue_id: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn push(&mut self, task: MarkTask) {
        if let Some(prev) = self.elem.replace(task) {
            if self.deque.len() >= self.capacity {
                self.overflow.push(prev);
            } else {
                self.deque.push(prev);
            }
        }
    }

    #[inline]
    pub fn pop(&mut self) -> Option<MarkTask> {
        self.elem.take().or_else(|| self.deque.pop())
    }

    pub fn is_empty(&self) -> bool {
        self.elem.is_none() && self.deque.is_empty()
    }

    pub fn size(&self) -> usize {
        self.deque.len() + self.elem.is_some() as usize
    }

    pub fn clear(&mut self) {
        self.elem = None;
        while self.deque.pop().is_some() {}
        self.last_stolen_queue_id = None;
    }

    pub fn last_stolen_queue_id(&self) -> Option<usize> {
        self.last_stolen_queue_id
    }
}

/// All task queues of the marker.
///
/// Queues `0..reserved` belong to the active workers. The rest are claimable: any worker may
/// take one through [`ObjToScanQueueSet::claim_next`] and drain it. A queue sits behind a mutex
/// that its current owner holds for the whole phase; thieves only ever go through the stealers.
pub struct ObjToScanQueueSet {
    queues: Box<[Mutex<ObjToScanQueue>]>,
    stealers: Box<[Stealer<MarkTask>]>,
    overflow: Arc<Injector<MarkTask>>,
    reserved: AtomicUsize,
    claimed_index: AtomicUsize,
}

impl ObjToScanQueueSet {
    pub fn new(n: usize, capacity: usize) -> Self {
        assert!(n > 0, "need at least one queue");
        let overflow = Arc::new(Injector::new());
        let queues = (0..n)
            .map(|id| ObjToScanQueue::new(id, capacity.max(1), overflow.clone()))
            .collect::<Vec<_>>();
        let stealers = queues.iter().map(|q| q.deque.stealer()).collect();

        Self {
            queues: queues.into_iter().map(Mutex::new).collect(),
            stealers,
            overflow,
            reserved: AtomicUsize::new(n),
            claimed_index: AtomicUsize::new(n),
        }
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    /// Hands queues `0..n` to the `n` active workers and makes the rest claimable.
    pub fn reserve(&self, n: usize) {
        assert!(
            n > 0 && n <= self.size(),
            "reserved queues out of range: {} of {}",
            n,
            self.size()
        );
        self.reserved.store(n, Ordering::Relaxed);
        self.claimed_index.store(n, Ordering::Release);
    }

    pub fn get_reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Takes ownership of queue `index`.
    pub fn queue(&self, index: usize) -> MutexGuard<'_, ObjToScanQueue> {
        match self.queues[index].try_lock() {
            Some(guard) => guard,
            None => panic!("queue {} is already owned", index),
        }
    }

    /// Claims the next unclaimed queue beyond the reserved ones. Each queue is handed out at
    /// most once per phase.
    pub fn claim_next(&self) -> Option<MutexGuard<'_, ObjToScanQueue>> {
        let size = self.size();

        if self.claimed_index.load(Ordering::Relaxed) >= size {
            return None;
        }

        let index = self.claimed_index.fetch_add(1, Ordering::AcqRel);

        if index < size {
            Some(self.queue(index))
        } else {
            None
        }
    }

    pub fn clear_claimed(&self) {
        self.claimed_index
            .store(self.get_reserved(), Ordering::Release);
    }

    fn steal_overflow(&self, local: &ObjToScanQueue) -> Option<MarkTask> {
        loop {
            match self.overflow.steal_batch_and_pop(&local.deque) {
                Steal::Empty => return None,
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
            }
        }
    }

    fn steal_from(&self, victim: usize, local: &ObjToScanQueue) -> Steal<MarkTask> {
        self.stealers[victim].steal_batch_and_pop(&local.deque)
    }

    /// Steals from the larger of two randomly picked peers, starting from the peer that
    /// served the last successful steal.
    fn steal_best_of_2(&self, queue_num: usize, local: &mut ObjToScanQueue) -> Steal<MarkTask> {
        let n = self.size();

        if n > 2 {
            let mut rng = thread_rng();
            let range = Uniform::new(0, n);

            let k1 = match local.last_stolen_queue_id {
                Some(k) if k != queue_num => k,
                _ => loop {
                    let k = range.sample(&mut rng);
                    if k != queue_num {
                        break k;
                    }
                },
            };

            let k2 = loop {
                let k = range.sample(&mut rng);
                if k != queue_num && k != k1 {
                    break k;
                }
            };

            let sel_k = if self.stealers[k2].len() > self.stealers[k1].len() {
                k2
            } else {
                k1
            };

            let suc = self.steal_from(sel_k, local);
            if suc.is_success() {
                local.last_stolen_queue_id = Some(sel_k);
            } else {
                local.last_stolen_queue_id = None;
            }
            suc
        } else if n == 2 {
            self.steal_from((queue_num + 1) % 2, local)
        } else {
            Steal::Empty
        }
    }

    /// Steals a task for the owner of `local`. The shared overflow is tried first, then up to
    /// `2 * n` peer steals. Batches land in the thief's own deque.
    pub fn steal(&self, queue_num: usize, local: &mut ObjToScanQueue) -> Option<MarkTask> {
        if let Some(task) = self.steal_overflow(local) {
            return Some(task);
        }

        for _ in 0..2 * self.size() {
            if let Steal::Success(task) = self.steal_best_of_2(queue_num, local) {
                return Some(task);
            }
        }

        None
    }

    /// Pushes a task on the shared overflow. Used to seed work while no worker owns a queue.
    pub fn push_overflow(&self, task: MarkTask) {
        self.overflow.push(task);
    }

    /// Racy count of the tasks visible to thieves.
    pub fn tasks(&self) -> usize {
        self.stealers.iter().map(|s| s.len()).sum::<usize>() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overflow.is_empty() && self.stealers.iter().all(|s| s.is_empty())
    }

    /// Drops every task. Only valid while no worker owns a queue.
    pub fn clear(&self) {
        for index in 0..self.size() {
            self.queue(index).clear();
        }

        while !self.overflow.steal().is_empty() {}

        self.clear_claimed();
    }
}
