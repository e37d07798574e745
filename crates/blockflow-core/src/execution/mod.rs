//! Execution engines
//!
//! The task scheduler runs inside an engine's thread pool, host update
//! targets fan tiles out through it, and the panel factorization gets a
//! subordinate engine with its own bounded pool. Each run owns its pools, so
//! a rank blocked in a receive never occupies threads of another rank sharing
//! the process.

mod hierarchical;

pub use hierarchical::{HierarchicalExecution, ParallelismBudget, Subordinate};

#[cfg(feature = "parallel")]
pub use hierarchical::budgeted_engines;

#[cfg(feature = "parallel")]
use crate::Result;

/// Execution strategy for batch operations
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExecutionStrategy {
    /// Process items sequentially
    Sequential,
    /// Process items in parallel
    Parallel,
}

/// Marker trait for execution engine mode properties
pub trait ExecutionMode {
    /// Whether this engine executes tasks sequentially
    const IS_SEQUENTIAL: bool;

    /// Optimal chunk size for this execution mode
    fn chunk_size(n_items: usize, n_threads: usize) -> usize;
}

/// Trait for execution engines that control how computations are performed
pub trait ExecutionEngine: Clone + Send + Sync + ExecutionMode {
    /// Execute a function in the engine's execution context
    fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send;

    /// Mutate disjoint chunks of data; `f` receives the chunk index
    fn for_each_chunk_mut<U, F>(&self, data: &mut [U], chunk_size: usize, f: F)
    where
        U: Send,
        F: Fn(usize, &mut [U]) + Sync + Send;

    /// Execute operations on multiple items
    fn execute_batch<F, R>(&self, count: usize, f: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync + Send,
        R: Send;

    /// Get the execution strategy
    fn strategy(&self) -> ExecutionStrategy;

    /// Check if parallel execution is available
    fn is_parallel(&self) -> bool {
        self.strategy() == ExecutionStrategy::Parallel
    }

    /// Get the number of threads available
    fn num_threads(&self) -> usize;
}

/// Sequential execution engine
///
/// Executes all operations sequentially in the current thread.
#[derive(Clone, Debug, Default)]
pub struct SequentialEngine;

impl SequentialEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionMode for SequentialEngine {
    const IS_SEQUENTIAL: bool = true;

    fn chunk_size(n_items: usize, _n_threads: usize) -> usize {
        // Process all items in one "chunk" for sequential
        n_items.max(1)
    }
}

impl ExecutionEngine for SequentialEngine {
    fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        f()
    }

    fn for_each_chunk_mut<U, F>(&self, data: &mut [U], chunk_size: usize, f: F)
    where
        U: Send,
        F: Fn(usize, &mut [U]) + Sync + Send,
    {
        data.chunks_mut(chunk_size.max(1))
            .enumerate()
            .for_each(|(idx, chunk)| f(idx, chunk));
    }

    fn execute_batch<F, R>(&self, count: usize, f: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync + Send,
        R: Send,
    {
        (0..count).map(f).collect()
    }

    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Sequential
    }

    fn num_threads(&self) -> usize {
        1
    }
}

/// Parallel execution engine using Rayon
///
/// Executes operations in parallel, on a dedicated pool when one is given and
/// on Rayon's global pool otherwise.
#[cfg(feature = "parallel")]
#[derive(Clone, Debug, Default)]
pub struct ParallelEngine {
    thread_pool: Option<std::sync::Arc<rayon::ThreadPool>>,
}

#[cfg(feature = "parallel")]
impl ParallelEngine {
    /// Create with a dedicated pool of `num_threads` named threads
    pub fn with_num_threads(num_threads: usize, name: &str) -> Result<Self> {
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| crate::Error::Execution(format!("Failed to create thread pool: {e}")))?;

        Ok(Self {
            thread_pool: Some(std::sync::Arc::new(pool)),
        })
    }
}

#[cfg(feature = "parallel")]
impl ExecutionMode for ParallelEngine {
    const IS_SEQUENTIAL: bool = false;

    fn chunk_size(n_items: usize, n_threads: usize) -> usize {
        let target_chunks = (n_threads * 4).max(1);
        let chunk_size = n_items.div_ceil(target_chunks);
        chunk_size.max(1)
    }
}

#[cfg(feature = "parallel")]
impl ExecutionEngine for ParallelEngine {
    fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        if let Some(pool) = &self.thread_pool {
            pool.install(f)
        } else {
            f()
        }
    }

    fn for_each_chunk_mut<U, F>(&self, data: &mut [U], chunk_size: usize, f: F)
    where
        U: Send,
        F: Fn(usize, &mut [U]) + Sync + Send,
    {
        use rayon::prelude::*;

        let chunk_size = chunk_size.max(1);
        let mut run = move || {
            data.par_chunks_mut(chunk_size)
                .enumerate()
                .for_each(|(idx, chunk)| f(idx, chunk))
        };
        if let Some(pool) = &self.thread_pool {
            pool.install(run)
        } else {
            run()
        }
    }

    fn execute_batch<F, R>(&self, count: usize, f: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync + Send,
        R: Send,
    {
        use rayon::prelude::*;

        if let Some(pool) = &self.thread_pool {
            pool.install(|| (0..count).into_par_iter().map(f).collect())
        } else {
            (0..count).into_par_iter().map(f).collect()
        }
    }

    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Parallel
    }

    fn num_threads(&self) -> usize {
        if let Some(pool) = &self.thread_pool {
            pool.current_num_threads()
        } else {
            rayon::current_num_threads()
        }
    }
}
