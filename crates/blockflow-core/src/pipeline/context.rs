//! Run context
//!
//! A [`PipelineContext`] follows one pipeline run on one rank: the trace id
//! stamped on every event, what the run is (routine, target, lookahead depth)
//! and the time spent per task kind.

use crate::config::{Options, Target};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub trace_id: Uuid,
    /// Run this one was started from, e.g. `getrs` for its two solves
    pub parent: Option<Uuid>,
    pub started: Instant,
    pub routine: Option<&'static str>,
    pub target: Option<Target>,
    pub lookahead: Option<usize>,
    stage_timings: HashMap<String, Duration>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::with_trace_id(Uuid::new_v4())
    }

    pub fn with_trace_id(trace_id: Uuid) -> Self {
        Self {
            trace_id,
            parent: None,
            started: Instant::now(),
            routine: None,
            target: None,
            lookahead: None,
            stage_timings: HashMap::new(),
        }
    }

    /// Child context for a routine run as part of this one
    ///
    /// The child gets a fresh trace id and clock and keeps the execution
    /// settings; the routine is left for the child run to fill in.
    pub fn fork(&self) -> Self {
        Self {
            parent: Some(self.trace_id),
            target: self.target,
            lookahead: self.lookahead,
            ..Self::new()
        }
    }

    /// Label the run with its routine and execution settings
    pub fn describe(&mut self, routine: &'static str, options: &Options) {
        self.routine = Some(routine);
        self.target = Some(options.target);
        self.lookahead = Some(options.lookahead);
    }

    /// Add `duration` to the total of `stage`
    pub fn record_stage_timing(&mut self, stage: impl Into<String>, duration: Duration) {
        *self.stage_timings.entry(stage.into()).or_default() += duration;
    }

    pub fn time_stage<R>(&mut self, stage: impl Into<String>, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.record_stage_timing(stage, start.elapsed());
        result
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stage_timings(&self) -> &HashMap<String, Duration> {
        &self.stage_timings
    }

    /// Stage that took the longest so far
    pub fn slowest_stage(&self) -> Option<(&str, Duration)> {
        self.stage_timings
            .iter()
            .max_by_key(|(_, duration)| **duration)
            .map(|(stage, duration)| (stage.as_str(), *duration))
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

/// `getrf/host_task/la2`, with `?` for unset parts
impl fmt::Display for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/",
            self.routine.unwrap_or("?"),
            self.target.map(|t| t.name()).unwrap_or("?")
        )?;
        match self.lookahead {
            Some(la) => write!(f, "la{la}"),
            None => write!(f, "la?"),
        }
    }
}
