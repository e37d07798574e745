//! Lookahead-pipelined triangular solve
//!
//! `op(A) X = alpha B` (left) or `X op(A) = alpha B` (right), overwriting `B`
//! with `X`. A right-side solve is turned into a left-side one by viewing
//! both operands transposed. The sweep then visits the block-rows of `B` top
//! to bottom for a lower triangular `op(A)` and bottom to top for an upper
//! one; per step:
//!
//! 1. **panel** - broadcast `A(k, k)`, solve block-row `k` of `B`, broadcast
//!    column `k` of `A` and the solved row to the ranks that update with them
//! 2. **lookahead** - update each block-row of the window, high priority
//! 3. **trailing** - update every remaining block-row in one batched call
//! 4. **cleanup** - retire the step's broadcasts and device holds

use crate::broadcast::{Directive, TileRange};
use crate::graph::{Plan, Priority, TaskGraph, TaskKind, TaskSpec, Token};
use crate::lookahead::{lookahead_update, Sweep};
use crate::panel::solve_block_row;
use crate::report::RunReport;
use crate::residency::ResidencyManager;
use crate::session::Session;
use crate::trailing::{trailing_update, Contribution};
use blockflow_core::{
    Channel, Diag, Error, EventBus, Layout, MatrixView, Options, PipelineContext, PipelineEvent,
    Result, Scalar, Side, Transport,
};

pub(crate) const ROUTINE: &str = "trsm";

/// Task declarations of a triangular solve, with the sweep step of each
pub(crate) fn schedule(sweep: &Sweep) -> Vec<(usize, TaskSpec)> {
    let mut specs = Vec::new();
    for s in 0..sweep.len() {
        let k = sweep.index(s);
        specs.push((
            s,
            TaskSpec::new(TaskKind::Panel, k, Priority::High)
                .writes(Token::Block(k))
                .writes(Token::Diag(k))
                .writes(Token::Comm),
        ));
        for &i in sweep.window(s) {
            specs.push((
                s,
                TaskSpec::new(TaskKind::Lookahead, k, Priority::High)
                    .at(i)
                    .reads(Token::Block(k))
                    .writes(Token::Block(i)),
            ));
        }
        let trailing = sweep.trailing(s);
        if let (Some(&first), Some(&last)) = (trailing.first(), trailing.last()) {
            specs.push((
                s,
                TaskSpec::new(TaskKind::Trailing, k, Priority::Low)
                    .reads(Token::Block(k))
                    .writes(Token::Block(first))
                    .writes(Token::Block(last)),
            ));
        }
        specs.push((
            s,
            TaskSpec::new(TaskKind::Cleanup, k, Priority::Normal)
                .writes(Token::Block(k))
                .writes(Token::Diag(k)),
        ));
    }
    specs
}

/// Dependency graph of a solve with `mt` block-rows, without running it
pub fn plan_trsm(mt: usize, uplo: blockflow_core::Uplo, lookahead: usize) -> Plan {
    let sweep = Sweep::for_uplo(uplo, mt, lookahead);
    Plan::from_specs(schedule(&sweep).into_iter().map(|(_, spec)| spec))
}

/// Bring a right-side solve to the left by transposing both operands
fn to_left<T: Scalar>(
    side: Side,
    alpha: T,
    a: &MatrixView<T>,
    b: &MatrixView<T>,
) -> Result<(MatrixView<T>, MatrixView<T>, T)> {
    match side {
        Side::Left => Ok((a.clone(), b.clone(), alpha)),
        Side::Right if a.op().conjugates() || b.op().conjugates() => {
            Ok((a.conj_transpose()?, b.conj_transpose()?, alpha.conj()))
        }
        Side::Right => Ok((a.transpose(), b.transpose(), alpha)),
    }
}

pub(crate) fn check_ranks<T: Scalar>(
    transport: &dyn Transport,
    views: &[&MatrixView<T>],
) -> Result<()> {
    for view in views {
        if view.num_ranks() != transport.size() {
            return Err(Error::size_mismatch(
                transport.size(),
                view.num_ranks(),
                "process grid size",
            ));
        }
        if view.rank() != transport.rank() {
            return Err(Error::InvalidParameter(format!(
                "matrix bound to rank {} used on rank {}",
                view.rank(),
                transport.rank()
            )));
        }
    }
    Ok(())
}

fn validate<T: Scalar>(
    a: &MatrixView<T>,
    b: &MatrixView<T>,
    transport: &dyn Transport,
) -> Result<()> {
    if a.uplo().is_none() {
        return Err(Error::InvalidParameter(
            "triangular operand must declare upper or lower".to_string(),
        ));
    }
    if a.mt() != a.nt() {
        return Err(Error::size_mismatch(a.mt(), a.nt(), "triangular operand block-columns"));
    }
    if a.mt() != b.mt() {
        return Err(Error::size_mismatch(a.mt(), b.mt(), "right-hand side block-rows"));
    }
    for i in 0..a.mt() {
        if a.tile_rows(i) != a.tile_cols(i) {
            return Err(Error::size_mismatch(a.tile_rows(i), a.tile_cols(i), "diagonal tile"));
        }
        if a.tile_cols(i) != b.tile_rows(i) {
            return Err(Error::size_mismatch(a.tile_cols(i), b.tile_rows(i), "right-hand side tile rows"));
        }
    }
    if a.matrix().same_storage(b.matrix()) {
        return Err(Error::InvalidParameter(
            "triangular operand and right-hand side share storage".to_string(),
        ));
    }
    check_ranks(transport, &[a, b])
}

/// Triangular solve with the default event bus
#[tracing::instrument(skip_all, fields(rank = transport.rank(), ?side, ?diag))]
pub fn trsm<T: Scalar>(
    side: Side,
    diag: Diag,
    alpha: T,
    a: &MatrixView<T>,
    b: &MatrixView<T>,
    transport: &dyn Transport,
    options: &Options,
) -> Result<RunReport> {
    run(side, diag, alpha, a, b, transport, options, &crate::default_events(), PipelineContext::new())
}

/// Triangular solve reporting to `events`
#[allow(clippy::too_many_arguments)]
pub fn trsm_with_events<T: Scalar>(
    side: Side,
    diag: Diag,
    alpha: T,
    a: &MatrixView<T>,
    b: &MatrixView<T>,
    transport: &dyn Transport,
    options: &Options,
    events: &EventBus,
) -> Result<RunReport> {
    run(side, diag, alpha, a, b, transport, options, events, PipelineContext::new())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn run<T: Scalar>(
    side: Side,
    diag: Diag,
    alpha: T,
    a: &MatrixView<T>,
    b: &MatrixView<T>,
    transport: &dyn Transport,
    options: &Options,
    events: &EventBus,
    context: PipelineContext,
) -> Result<RunReport> {
    options.validate()?;
    let (a, b, alpha) = to_left(side, alpha, a, b)?;
    validate(&a, &b, transport)?;
    if a.mt() == 0 || b.nt() == 0 {
        return Ok(RunReport::empty(ROUTINE, transport.rank()));
    }
    let uplo = a
        .uplo()
        .ok_or_else(|| Error::InvalidParameter("triangular operand has no uplo".to_string()))?;

    let residency = ResidencyManager::prepare(options.target, &[&a, &b], options.lookahead)?;
    let session = Session::new(ROUTINE, transport, options, events, context, residency)?;
    let sweep = Sweep::for_uplo(uplo, a.mt(), options.lookahead);
    tracing::debug!(mt = a.mt(), nt = b.nt(), ?uplo, lookahead = options.lookahead, "trsm start");

    let outcome = execute(&session, &sweep, diag, alpha, &a, &b);
    session.finish(outcome)
}

fn execute<T: Scalar>(
    session: &Session<'_, T>,
    sweep: &Sweep,
    diag: Diag,
    alpha: T,
    a: &MatrixView<T>,
    b: &MatrixView<T>,
) -> Result<(usize, usize)> {
    let pipeline = Pipeline {
        session,
        sweep,
        diag,
        alpha,
        a,
        b,
    };
    let pipeline = &pipeline;
    let mut graph = TaskGraph::new();
    for (s, spec) in schedule(sweep) {
        let label = spec.kind.name();
        let task = spec.clone();
        graph.add(spec, move || {
            pipeline.session.timed(label, || pipeline.run_task(s, &task))
        });
    }
    let tasks = session.run_graph(graph)?;
    Ok((sweep.len(), tasks))
}

struct Pipeline<'p, 't, T: Scalar> {
    session: &'p Session<'t, T>,
    sweep: &'p Sweep,
    diag: Diag,
    alpha: T,
    a: &'p MatrixView<T>,
    b: &'p MatrixView<T>,
}

impl<'p, 't, T: Scalar> Pipeline<'p, 't, T> {
    fn layout(&self) -> Layout {
        if self.session.options.target.is_device() {
            Layout::RowMajor
        } else {
            Layout::ColMajor
        }
    }

    fn run_task(&self, s: usize, spec: &TaskSpec) -> Result<()> {
        let k = spec.step;
        match (spec.kind, spec.index) {
            (TaskKind::Panel, _) => self.panel(s, k),
            (TaskKind::Lookahead, Some(i)) => {
                let contribution = self.contribution(s, k, vec![i]);
                lookahead_update(&contribution, self.session.options.target, &self.session.workers)
                    .map(drop)
            }
            (TaskKind::Trailing, _) => {
                let contribution = self.contribution(s, k, self.sweep.trailing(s).to_vec());
                trailing_update(&contribution, self.session.options.target, &self.session.workers)
                    .map(drop)
            }
            (TaskKind::Cleanup, _) => {
                self.session.director.retire(k);
                let released = self.session.residency.release(k);
                self.session.emit(PipelineEvent::DeviceCleanup {
                    trace_id: self.session.trace_id(),
                    step: k,
                    released,
                });
                Ok(())
            }
            (kind, index) => Err(Error::Execution(format!(
                "trsm has no task {}[{k}] at {index:?}",
                kind.name()
            ))),
        }
    }

    fn contribution(&self, s: usize, k: usize, rows: Vec<usize>) -> Contribution<'p, T> {
        Contribution {
            dest: self.b,
            left: self.a,
            right: self.b,
            k,
            rows,
            cols: (0..self.b.nt()).collect(),
            beta: self.sweep.multiplier(s, self.alpha),
        }
    }

    fn send(&self, directive: Option<Directive>, view: &MatrixView<T>, tiles: &mut usize, bytes: &mut usize) -> Result<()> {
        if let Some(directive) = directive {
            let sent = self
                .session
                .director
                .execute(&directive, view, self.session.transport)?;
            if sent > 0 {
                *tiles += 1;
                *bytes += sent;
            }
        }
        Ok(())
    }

    /// Solve block-row `k` and push everything the step's updates read
    fn panel(&self, s: usize, k: usize) -> Result<()> {
        let (a, b) = (self.a, self.b);
        let director = &self.session.director;
        let layout = self.layout();
        let nt = b.nt();
        let window = self.sweep.window(s);
        let trailing = self.sweep.trailing_range(s);
        let (mut tiles, mut bytes) = (0, 0);

        let diag = director.directive(
            k,
            Channel::Tile,
            0,
            a,
            (k, k),
            b,
            &[TileRange::row(k, 0..nt)],
            layout,
        )?;
        self.send(diag, a, &mut tiles, &mut bytes)?;
        let multiplier = self.sweep.multiplier(s, self.alpha);
        solve_block_row(a, b, k, self.diag, multiplier)?;

        for &i in self.sweep.rest(s) {
            let column = director.directive(
                k,
                Channel::Tile,
                0,
                a,
                (i, k),
                b,
                &[TileRange::row(i, 0..nt)],
                layout,
            )?;
            self.send(column, a, &mut tiles, &mut bytes)?;
        }
        for j in 0..nt {
            let mut groups: Vec<TileRange> = window.iter().map(|&i| TileRange::tile(i, j)).collect();
            groups.push(TileRange::col(trailing.clone(), j));
            let row = director.directive(k, Channel::Tile, 1, b, (k, j), b, &groups, layout)?;
            self.send(row, b, &mut tiles, &mut bytes)?;
        }

        let residency = &self.session.residency;
        if residency.is_enabled() {
            let column = std::iter::once(k)
                .chain(self.sweep.rest(s).iter().copied())
                .map(|i| (i, k));
            residency.hold(k, a, column)?;
        }
        self.session.emit(PipelineEvent::TilesBroadcast {
            trace_id: self.session.trace_id(),
            step: k,
            tiles,
            bytes,
        });
        Ok(())
    }
}
