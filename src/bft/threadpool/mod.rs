//! The commitment worker pool (spec §5): a small, fixed set of threads
//! that verify signatures and run consensus state-machine transitions
//! off the ingress dispatcher thread.

use threadpool_crossbeam_channel::ThreadPool;

/// A thin wrapper over [`ThreadPool`], kept as its own module so callers
/// depend on "the commitment worker pool" rather than the crate backing
/// it.
pub struct WorkerPool {
    inner: ThreadPool,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            inner: ThreadPool::new(workers),
            workers,
        }
    }

    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(job);
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Blocks until every queued job has run. Used by tests and by clean
    /// shutdown to make sure nothing is left mid-flight.
    pub fn join(&self) {
        self.inner.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn executes_queued_jobs() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
