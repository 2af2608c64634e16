//! Worker-pool dispatcher for the parallel frame phases.
//!
//! With `worker_threads == 0` everything runs inline on the audio thread;
//! otherwise work fans out to a dedicated rayon pool. Every call joins before
//! it returns, so phases never overlap.

use rayon::prelude::*;

use crate::error::MixError;

/// Runs per-node work inline or on a rayon pool.
pub enum Dispatcher {
    /// Run on the calling thread.
    Inline,
    /// Run on a dedicated pool.
    Pool(rayon::ThreadPool),
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Inline => f.write_str("Dispatcher::Inline"),
            Self::Pool(pool) => {
                write!(f, "Dispatcher::Pool({} threads)", pool.current_num_threads())
            }
        }
    }
}

impl Dispatcher {
    /// Creates a dispatcher with `worker_threads` workers (0 = inline).
    pub fn new(worker_threads: usize) -> Result<Self, MixError> {
        if worker_threads == 0 {
            return Ok(Self::Inline);
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(|i| format!("mezcla-worker-{i}"))
            .build()
            .map(Self::Pool)
            .map_err(|e| MixError::Config(format!("cannot start worker pool: {e}")))
    }

    /// Returns true if work runs on a pool.
    pub fn is_parallel(&self) -> bool {
        matches!(self, Self::Pool(_))
    }

    /// Returns the number of threads work runs on.
    pub fn threads(&self) -> usize {
        match self {
            Self::Inline => 1,
            Self::Pool(pool) => pool.current_num_threads(),
        }
    }

    /// Applies `f` to every item, in chunks of `batch` per work item.
    ///
    /// Items must be independent: `f` only gets `&mut` to one of them.
    pub fn for_each_mut<T, F>(&self, items: &mut [T], batch: usize, f: F)
    where
        T: Send,
        F: Fn(&mut T) + Send + Sync,
    {
        match self {
            Self::Inline => items.iter_mut().for_each(f),
            Self::Pool(pool) => pool.install(|| {
                items
                    .par_chunks_mut(batch.max(1))
                    .for_each(|chunk| chunk.iter_mut().for_each(&f));
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_visits_every_item() {
        let d = Dispatcher::new(0).unwrap();
        assert!(!d.is_parallel());
        let mut items = vec![1, 2, 3];
        d.for_each_mut(&mut items, 2, |x| *x *= 10);
        assert_eq!(items, vec![10, 20, 30]);
    }

    #[test]
    fn pool_visits_every_item() {
        let d = Dispatcher::new(2).unwrap();
        assert!(d.is_parallel());
        assert_eq!(d.threads(), 2);
        let mut items: Vec<u32> = (0..100).collect();
        d.for_each_mut(&mut items, 7, |x| *x += 1);
        assert_eq!(items, (1..101).collect::<Vec<_>>());
    }
}
