use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-worker live bytes, indexed by region. Only the owning worker writes to it until it is
/// flushed into the shared region totals.
pub struct LiveData {
    data: Box<[usize]>,
}

impl LiveData {
    pub fn new(num_regions: usize) -> Self {
        Self {
            data: vec![0; num_regions].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn add(&mut self, region: usize, bytes: usize) {
        self.data[region] += bytes;
    }

    pub fn get(&self, region: usize) -> usize {
        self.data[region]
    }

    pub fn total(&self) -> usize {
        self.data.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&x| x == 0)
    }

    /// Adds the cached values to `totals` and zeroes the cache.
    pub fn flush(&mut self, totals: &[AtomicUsize]) {
        assert_eq!(totals.len(), self.data.len(), "region count mismatch");
        for (live, total) in self.data.iter_mut().zip(totals) {
            if *live != 0 {
                total.fetch_add(*live, Ordering::Relaxed);
                *live = 0;
            }
        }
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|x| *x = 0);
    }
}
