//! A thin wrapper around a crossbeam-channel backed thread pool, used
//! by the execution layer to run user `Service` code off the
//! dispatcher thread.

use threadpool_crossbeam_channel::{Builder as InnerBuilder, ThreadPool as InnerPool};

/// A handle to a pool of worker threads.
#[derive(Clone)]
pub struct ThreadPool {
    inner: InnerPool,
}

impl ThreadPool {
    /// Executes `job` on one of the pool's worker threads.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(job);
    }

    /// Blocks until all currently queued jobs have finished executing.
    pub fn join(&self) {
        self.inner.join();
    }
}

/// Builds a new `ThreadPool`.
pub struct Builder {
    inner: InnerBuilder,
}

impl Builder {
    /// Creates a new `Builder`, with default configuration.
    pub fn new() -> Self {
        Self {
            inner: InnerBuilder::new(),
        }
    }

    /// Sets the number of worker threads in the pool.
    pub fn num_threads(mut self, n: usize) -> Self {
        self.inner = self.inner.num_threads(n);
        self
    }

    /// Builds the `ThreadPool`.
    pub fn build(self) -> ThreadPool {
        ThreadPool {
            inner: self.inner.build(),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
