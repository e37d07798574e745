//! Results returned by the pipelines

use crate::pivot::Pivots;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Summary of one pipeline run on one rank
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub trace_id: Uuid,
    pub routine: &'static str,
    pub rank: usize,
    /// Panel steps taken
    pub steps: usize,
    pub tasks_executed: usize,
    pub elapsed: Duration,
    /// Accumulated time per task kind
    pub stage_timings: HashMap<String, Duration>,
}

impl RunReport {
    /// Report of a run with nothing to do
    pub fn empty(routine: &'static str, rank: usize) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            routine,
            rank,
            steps: 0,
            tasks_executed: 0,
            elapsed: Duration::ZERO,
            stage_timings: HashMap::new(),
        }
    }

    /// Fold a sub-run into this report
    pub fn absorb(&mut self, other: &RunReport) {
        self.steps += other.steps;
        self.tasks_executed += other.tasks_executed;
        self.elapsed += other.elapsed;
        for (stage, duration) in &other.stage_timings {
            *self.stage_timings.entry(stage.clone()).or_default() += *duration;
        }
    }
}

/// Numerical status of an LU factorization
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LuInfo {
    /// Global row of the first exactly-zero pivot
    pub first_zero_pivot: Option<usize>,
}

impl LuInfo {
    pub fn is_singular(&self) -> bool {
        self.first_zero_pivot.is_some()
    }
}

/// Output of `getrf` besides the factors stored in place
#[derive(Debug, Clone)]
pub struct LuFactors {
    pub pivots: Pivots,
    pub info: LuInfo,
    pub report: RunReport,
}
