//! Worker threads used by the propagations.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{BnError, Result};

/// Process-wide default, 0 standing for the number of logical CPUs.
static DEFAULT_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Sets the number of threads used by engines configured with 0 threads.
/// It is read at each inference, so it affects existing engines too.
pub fn set_default_number_of_threads(threads: usize) {
    DEFAULT_THREADS.store(threads, Ordering::Relaxed);
}

pub fn default_number_of_threads() -> usize {
    match DEFAULT_THREADS.load(Ordering::Relaxed) {
        0 => num_cpus::get(),
        n => n,
    }
}

/// Actual number of threads for an engine setting.
pub fn resolve(threads: usize) -> usize {
    if threads == 0 {
        default_number_of_threads()
    } else {
        threads
    }
}

/// Owns the thread pool of one engine, rebuilt when the resolved thread
/// count changes.
#[derive(Debug, Default)]
pub struct Scheduler {
    pool: Option<(usize, Arc<rayon::ThreadPool>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&mut self, threads: usize) -> Result<Arc<rayon::ThreadPool>> {
        let n = resolve(threads);
        if let Some((size, pool)) = &self.pool {
            if *size == n {
                return Ok(pool.clone());
            }
        }
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .thread_name(|i| format!("bnexact-{}", i))
                .build()
                .map_err(|e| BnError::ThreadPool(e.to_string()))?,
        );
        tracing::debug!(threads = n, "thread pool created");
        self.pool = Some((n, pool.clone()));
        Ok(pool)
    }
}
