//! Hierarchical execution control for nested parallel operations
//!
//! The pipeline scheduler is the outer level; the panel factorization is the
//! inner level. A [`ParallelismBudget`] splits threads between them so nested
//! parallel loops do not oversubscribe the machine.

use super::{ExecutionEngine, ExecutionMode, ExecutionStrategy, SequentialEngine};
#[cfg(feature = "parallel")]
use super::ParallelEngine;

/// Extension trait for hierarchical execution control
pub trait HierarchicalExecution: ExecutionEngine {
    /// Create a subordinate engine for nested operations
    ///
    /// The subordinate engine runs sequentially so nested loops do not create
    /// additional threads.
    fn subordinate(&self) -> Subordinate;

    /// Create a subordinate engine with at most `max_threads` threads
    fn subordinate_with_threads(&self, max_threads: usize) -> Subordinate;
}

/// Threads for the pipeline workers and for one panel factorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelismBudget {
    /// Total threads available
    pub total_threads: usize,
    /// Threads for the outer level (pipeline workers)
    pub outer_threads: usize,
    /// Threads for the inner level (panel row updates)
    pub inner_threads: usize,
}

impl ParallelismBudget {
    fn available() -> usize {
        #[cfg(feature = "parallel")]
        let total = rayon::current_num_threads();
        #[cfg(not(feature = "parallel"))]
        let total = 1;
        total.max(1)
    }

    /// Every available thread for workers, at most `max_panel_threads` for a panel
    ///
    /// The panel runs while most workers wait on it, so the two levels share
    /// the machine rather than splitting it.
    pub fn for_panel(max_panel_threads: usize) -> Self {
        let total = Self::available();
        Self {
            total_threads: total,
            outer_threads: total,
            inner_threads: max_panel_threads.clamp(1, total),
        }
    }

    /// Create a custom budget
    pub fn custom(outer_threads: usize, inner_threads: usize) -> Self {
        Self {
            total_threads: outer_threads + inner_threads,
            outer_threads,
            inner_threads,
        }
    }
}

/// Subordinate engine handed to nested operations
#[derive(Clone, Debug)]
pub enum Subordinate {
    Sequential(SequentialEngine),
    #[cfg(feature = "parallel")]
    Pooled(ParallelEngine),
}

impl ExecutionMode for Subordinate {
    const IS_SEQUENTIAL: bool = false; // Dynamic

    fn chunk_size(n_items: usize, n_threads: usize) -> usize {
        let target_chunks = (n_threads * 4).max(1);
        n_items.div_ceil(target_chunks).max(1)
    }
}

impl ExecutionEngine for Subordinate {
    fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match self {
            Subordinate::Sequential(e) => e.execute(f),
            #[cfg(feature = "parallel")]
            Subordinate::Pooled(e) => e.execute(f),
        }
    }

    fn for_each_chunk_mut<U, F>(&self, data: &mut [U], chunk_size: usize, f: F)
    where
        U: Send,
        F: Fn(usize, &mut [U]) + Sync + Send,
    {
        match self {
            Subordinate::Sequential(e) => e.for_each_chunk_mut(data, chunk_size, f),
            #[cfg(feature = "parallel")]
            Subordinate::Pooled(e) => e.for_each_chunk_mut(data, chunk_size, f),
        }
    }

    fn execute_batch<F, R>(&self, count: usize, f: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync + Send,
        R: Send,
    {
        match self {
            Subordinate::Sequential(e) => e.execute_batch(count, f),
            #[cfg(feature = "parallel")]
            Subordinate::Pooled(e) => e.execute_batch(count, f),
        }
    }

    fn strategy(&self) -> ExecutionStrategy {
        match self {
            Subordinate::Sequential(e) => e.strategy(),
            #[cfg(feature = "parallel")]
            Subordinate::Pooled(e) => e.strategy(),
        }
    }

    fn num_threads(&self) -> usize {
        match self {
            Subordinate::Sequential(e) => e.num_threads(),
            #[cfg(feature = "parallel")]
            Subordinate::Pooled(e) => e.num_threads(),
        }
    }
}

impl HierarchicalExecution for SequentialEngine {
    fn subordinate(&self) -> Subordinate {
        // Sequential engine always creates sequential subordinates
        Subordinate::Sequential(SequentialEngine)
    }

    fn subordinate_with_threads(&self, _max_threads: usize) -> Subordinate {
        Subordinate::Sequential(SequentialEngine)
    }
}

#[cfg(feature = "parallel")]
impl HierarchicalExecution for ParallelEngine {
    fn subordinate(&self) -> Subordinate {
        Subordinate::Sequential(SequentialEngine)
    }

    fn subordinate_with_threads(&self, max_threads: usize) -> Subordinate {
        let threads = max_threads.min(self.num_threads());
        if threads <= 1 {
            return Subordinate::Sequential(SequentialEngine);
        }
        match ParallelEngine::with_num_threads(threads, "blockflow-panel") {
            Ok(engine) => Subordinate::Pooled(engine),
            Err(err) => {
                log::warn!("panel pool unavailable, running panels sequentially: {err}");
                Subordinate::Sequential(SequentialEngine)
            }
        }
    }
}

/// Build the worker engine and the panel engine for one run
#[cfg(feature = "parallel")]
pub fn budgeted_engines(budget: ParallelismBudget) -> crate::Result<(ParallelEngine, Subordinate)> {
    let workers = ParallelEngine::with_num_threads(budget.outer_threads, "blockflow-worker")?;
    let panel = workers.subordinate_with_threads(budget.inner_threads);
    Ok((workers, panel))
}
