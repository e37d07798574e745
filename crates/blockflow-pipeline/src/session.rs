//! Shared state of one pipeline run on one rank

use crate::broadcast::BroadcastDirector;
use crate::graph::TaskGraph;
use crate::report::RunReport;
use crate::residency::ResidencyManager;
use blockflow_core::{
    budgeted_engines, Error, EventBus, Options, ParallelEngine, ParallelismBudget,
    PipelineContext, PipelineEvent, Result, Scalar, Subordinate, Transport,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub(crate) struct Session<'t, T: Scalar> {
    pub routine: &'static str,
    pub transport: &'t dyn Transport,
    pub options: Options,
    pub workers: ParallelEngine,
    pub panel_engine: Subordinate,
    pub director: BroadcastDirector,
    pub residency: ResidencyManager<T>,
    context: Mutex<PipelineContext>,
    events: EventBus,
    failed: AtomicBool,
}

impl<'t, T: Scalar> Session<'t, T> {
    pub fn new(
        routine: &'static str,
        transport: &'t dyn Transport,
        options: &Options,
        events: &EventBus,
        mut context: PipelineContext,
        residency: ResidencyManager<T>,
    ) -> Result<Self> {
        let (workers, panel_engine) =
            budgeted_engines(ParallelismBudget::for_panel(options.max_panel_threads))?;
        context.describe(routine, options);
        let session = Self {
            routine,
            transport,
            options: options.clone(),
            workers,
            panel_engine,
            director: BroadcastDirector::new(transport.rank()),
            residency,
            context: Mutex::new(context),
            events: events.clone(),
            failed: AtomicBool::new(false),
        };
        session.emit(PipelineEvent::RunStarted {
            trace_id: session.trace_id(),
            routine,
            rank: transport.rank(),
            timestamp: Instant::now(),
        });
        Ok(session)
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn trace_id(&self) -> uuid::Uuid {
        self.context.lock().trace_id
    }

    pub fn emit(&self, event: PipelineEvent) {
        let context = self.context.lock().clone();
        self.events.emit(event, &context);
    }

    /// Run `f` and add its duration to `stage`
    pub fn timed<R>(&self, stage: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let start = Instant::now();
        let result = f();
        self.context.lock().record_stage_timing(stage, start.elapsed());
        result
    }

    /// Abort the transport once so peers blocked on this rank fail too
    pub fn fail(&self, err: &Error) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::error!(routine = self.routine, rank = self.rank(), error = %err, "pipeline failed");
        self.transport.abort(&format!("rank {} failed: {err}", self.rank()));
        self.emit(PipelineEvent::RunFailed {
            trace_id: self.trace_id(),
            routine: self.routine,
            rank: self.rank(),
            error: err.to_string(),
        });
    }

    pub fn run_graph(&self, graph: TaskGraph<'_>) -> Result<usize> {
        graph.execute(&self.workers, &|err| self.fail(err))
    }

    /// Close the run: release accelerators, report success or abort peers
    pub fn finish(&self, outcome: Result<(usize, usize)>) -> Result<RunReport> {
        let released = self.residency.finish();
        let outcome = outcome.and_then(|counts| released.map(|_| counts));
        match outcome {
            Ok((steps, tasks)) => {
                let context = self.context.lock().clone();
                let report = RunReport {
                    trace_id: context.trace_id,
                    routine: self.routine,
                    rank: self.rank(),
                    steps,
                    tasks_executed: tasks,
                    elapsed: context.elapsed(),
                    stage_timings: context.stage_timings().clone(),
                };
                self.emit(PipelineEvent::RunCompleted {
                    trace_id: report.trace_id,
                    routine: self.routine,
                    rank: report.rank,
                    duration: report.elapsed,
                    tasks,
                });
                Ok(report)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }
}
