pub struct WorkerPolicy;

impl WorkerPolicy {
    fn nof_parallel_worker_threads(num: usize, den: usize, switch_pt: usize, ncpus: usize) -> usize {
        // For very large machines, there are diminishing returns for large numbers of worker
        // threads. Use a fraction of the workers for every processor after the first 8. For
        // example, on a 72 cpu machine and a chosen fraction of 5/8 use
        // 8 + (72 - 8) * (5/8) == 48 worker threads.
        #[allow(unused_mut)]
        let mut threads = if ncpus <= switch_pt {
            ncpus
        } else {
            switch_pt + ((ncpus - switch_pt) * num) / den
        };

        #[cfg(target_pointer_width = "32")]
        {
            // Address space is scarce on 32-bit targets, don't spend it on thread stacks.
            threads = threads.min(2 * switch_pt);
        }

        threads.max(1)
    }

    /// Number of parallel GC threads for a machine with `ncpus` processors.
    pub fn calc_parallel_worker_threads(ncpus: usize) -> usize {
        Self::nof_parallel_worker_threads(5, 8, 8, ncpus)
    }

    /// Returns `requested` when it is non-zero, otherwise the default for this machine.
    pub fn parallel_worker_threads(requested: usize) -> usize {
        if requested != 0 {
            requested
        } else {
            Self::calc_parallel_worker_threads(num_cpus::get())
        }
    }
}
