//! Lookahead-pipelined LU factorization with partial pivoting
//!
//! `A = P L U` in place, sweeping the block-columns left to right. Per step `k`:
//!
//! 1. **panel** - gather column `k` on the diagonal owner, factor it there,
//!    publish the pivots and swap the rows of column `k`
//! 2. **broadcast** - send `A(k, k)` and the `L` tiles of column `k` to the
//!    ranks that update with them
//! 3. **lookahead** - per window column: swap rows, solve `A(k, j)`, send it
//!    down the column, then update the column
//! 4. **trailing** - the same for every remaining column, as one batched update
//! 5. **cleanup** - retire the step's broadcasts and device holds
//!
//! Interchanges of columns left of the panel are applied once the pipeline
//! has drained, see [`apply_deferred`].

use crate::broadcast::{Directive, TileRange};
use crate::graph::{Plan, Priority, TaskGraph, TaskKind, TaskSpec, Token};
use crate::lookahead::{lookahead_update, Sweep};
use crate::panel::{gather_panel, solve_below_diagonal, solve_right_of_diagonal, PanelSolver};
use crate::pivot::{exchange_pivots, permute_rows, Pivot, Pivots, SwapPass};
use crate::report::{LuFactors, LuInfo};
use crate::residency::ResidencyManager;
use crate::session::Session;
use crate::trailing::{trailing_update, Contribution};
use crate::trsm::check_ranks;
use blockflow_core::{
    Channel, Error, EventBus, Layout, MatrixView, Op, Options, PipelineContext, PipelineEvent,
    Placement, Result, Scalar, Shape, Transport, WorkspacePool,
};
use parking_lot::Mutex;

pub(crate) const ROUTINE: &str = "getrf";

/// Panel workspaces kept for reuse between steps
const PANEL_BUFFERS: usize = 2;

fn schedule(sweep: &Sweep, steps: usize) -> Vec<TaskSpec> {
    let mut specs = Vec::new();
    for k in 0..steps {
        specs.push(
            TaskSpec::new(TaskKind::Panel, k, Priority::High)
                .writes(Token::Block(k))
                .writes(Token::Diag(k))
                .writes(Token::Comm),
        );
        specs.push(
            TaskSpec::new(TaskKind::Broadcast, k, Priority::High)
                .reads(Token::Diag(k))
                .writes(Token::Block(k))
                .writes(Token::Comm),
        );
        for &j in sweep.window(k) {
            specs.push(
                TaskSpec::new(TaskKind::LookaheadComm, k, Priority::High)
                    .at(j)
                    .reads(Token::Block(k))
                    .writes(Token::Block(j))
                    .writes(Token::Comm),
            );
            specs.push(
                TaskSpec::new(TaskKind::Lookahead, k, Priority::High)
                    .at(j)
                    .reads(Token::Block(k))
                    .writes(Token::Block(j)),
            );
        }
        let trailing = sweep.trailing(k);
        if let (Some(&first), Some(&last)) = (trailing.first(), trailing.last()) {
            specs.push(
                TaskSpec::new(TaskKind::TrailingComm, k, Priority::Normal)
                    .reads(Token::Block(k))
                    .writes(Token::Block(first))
                    .writes(Token::Block(last))
                    .writes(Token::Comm),
            );
            specs.push(
                TaskSpec::new(TaskKind::Trailing, k, Priority::Low)
                    .reads(Token::Block(k))
                    .writes(Token::Block(first))
                    .writes(Token::Block(last)),
            );
        }
        specs.push(
            TaskSpec::new(TaskKind::Cleanup, k, Priority::Normal)
                .writes(Token::Block(k))
                .writes(Token::Diag(k)),
        );
    }
    specs
}

/// Dependency graph of an `mt x nt` tile factorization, without running it
pub fn plan_getrf(mt: usize, nt: usize, lookahead: usize) -> Plan {
    let sweep = Sweep::forward(nt, lookahead);
    Plan::from_specs(schedule(&sweep, mt.min(nt)))
}

/// LU needs room for fill-in and row-permuted `L` that band storage lacks
pub(crate) fn reject_band<T: Scalar>(a: &MatrixView<T>) -> Result<()> {
    match a.matrix().shape() {
        Shape::General => Ok(()),
        Shape::Band { kl, ku } => Err(Error::InvalidParameter(format!(
            "LU needs general storage, got a band matrix (kl = {kl}, ku = {ku})"
        ))),
    }
}

fn validate<T: Scalar>(a: &MatrixView<T>, transport: &dyn Transport) -> Result<()> {
    reject_band(a)?;
    if a.op() != Op::NoTrans {
        return Err(Error::InvalidParameter(
            "LU factors the matrix as stored; transposed views are not accepted".to_string(),
        ));
    }
    let steps = a.mt().min(a.nt());
    for k in 0..steps.saturating_sub(1) {
        if a.tile_rows(k) != a.tile_cols(k) {
            return Err(Error::size_mismatch(a.tile_rows(k), a.tile_cols(k), "diagonal tile"));
        }
    }
    check_ranks(transport, &[a])
}

/// LU factorization with the default event bus
#[tracing::instrument(skip_all, fields(rank = transport.rank()))]
pub fn getrf<T: Scalar>(
    a: &MatrixView<T>,
    transport: &dyn Transport,
    options: &Options,
) -> Result<LuFactors> {
    run(a, transport, options, &crate::default_events(), PipelineContext::new())
}

/// LU factorization reporting to `events`
pub fn getrf_with_events<T: Scalar>(
    a: &MatrixView<T>,
    transport: &dyn Transport,
    options: &Options,
    events: &EventBus,
) -> Result<LuFactors> {
    run(a, transport, options, events, PipelineContext::new())
}

pub(crate) fn run<T: Scalar>(
    a: &MatrixView<T>,
    transport: &dyn Transport,
    options: &Options,
    events: &EventBus,
    context: PipelineContext,
) -> Result<LuFactors> {
    options.validate()?;
    validate(a, transport)?;
    let tile_rows: Vec<usize> = (0..a.mt()).map(|i| a.tile_rows(i)).collect();
    let steps = a.mt().min(a.nt());
    if steps == 0 {
        return Ok(LuFactors {
            pivots: Pivots::new(Vec::new(), &tile_rows),
            info: LuInfo::default(),
            report: crate::report::RunReport::empty(ROUTINE, transport.rank()),
        });
    }

    let residency = ResidencyManager::prepare(options.target, &[a], options.lookahead)?;
    let session = Session::new(ROUTINE, transport, options, events, context, residency)?;
    let sweep = Sweep::forward(a.nt(), options.lookahead);
    let solver = PanelSolver::new(
        options.inner_blocking,
        session.panel_engine.clone(),
        WorkspacePool::new(PANEL_BUFFERS),
    );
    tracing::debug!(mt = a.mt(), nt = a.nt(), lookahead = options.lookahead, "getrf start");

    let pipeline = Pipeline {
        session: &session,
        sweep: &sweep,
        a,
        solver,
        pivots: Mutex::new(vec![Vec::new(); steps]),
        zero_pivot: Mutex::new(None),
    };
    let outcome = pipeline.execute(steps);
    let report = session.finish(outcome)?;
    let Pipeline {
        pivots, zero_pivot, ..
    } = pipeline;
    Ok(LuFactors {
        pivots: Pivots::new(pivots.into_inner(), &tile_rows),
        info: LuInfo {
            first_zero_pivot: zero_pivot.into_inner(),
        },
        report,
    })
}

/// Apply the interchanges of every step to the columns left of its panel
///
/// Every rank calls this with the same pivots. Returns the rows this rank
/// rewrote.
pub fn apply_deferred<T: Scalar>(
    a: &MatrixView<T>,
    pivots: &Pivots,
    transport: &dyn Transport,
) -> Result<usize> {
    let mut rows = 0;
    for (k, step) in pivots.steps().iter().enumerate().skip(1) {
        for j in 0..k.min(a.nt()) {
            rows += permute_rows(
                a,
                k,
                step,
                j,
                SwapPass::new(k, Channel::DeferredSwap, 0),
                transport,
            )?;
        }
    }
    Ok(rows)
}

struct Pipeline<'p, 't, T: Scalar> {
    session: &'p Session<'t, T>,
    sweep: &'p Sweep,
    a: &'p MatrixView<T>,
    solver: PanelSolver<T>,
    pivots: Mutex<Vec<Vec<Pivot>>>,
    zero_pivot: Mutex<Option<usize>>,
}

impl<'p, 't, T: Scalar> Pipeline<'p, 't, T> {
    fn execute(&self, steps: usize) -> Result<(usize, usize)> {
        let mut graph = TaskGraph::new();
        for spec in schedule(self.sweep, steps) {
            let label = spec.kind.name();
            let task = spec.clone();
            graph.add(spec, move || self.session.timed(label, || self.run_task(&task)));
        }
        let tasks = self.session.run_graph(graph)?;

        let pivots = Pivots::new(self.pivots.lock().clone(), &[]);
        let rows = self
            .session
            .timed("deferred_swaps", || apply_deferred(self.a, &pivots, self.session.transport))?;
        self.session.emit(PipelineEvent::RowsSwapped {
            trace_id: self.session.trace_id(),
            step: steps - 1,
            rows,
            deferred: true,
        });
        Ok((steps, tasks))
    }

    fn layout(&self) -> Layout {
        if self.session.options.target.is_device() {
            Layout::RowMajor
        } else {
            Layout::ColMajor
        }
    }

    fn run_task(&self, spec: &TaskSpec) -> Result<()> {
        let k = spec.step;
        match (spec.kind, spec.index) {
            (TaskKind::Panel, _) => self.panel(k),
            (TaskKind::Broadcast, _) => self.broadcast(k),
            (TaskKind::LookaheadComm, Some(j)) => self.prepare_columns(k, &[j], j - k + 1),
            (TaskKind::Lookahead, Some(j)) => {
                let contribution = self.contribution(k, vec![j]);
                lookahead_update(&contribution, self.session.options.target, &self.session.workers)
                    .map(drop)
            }
            (TaskKind::TrailingComm, _) => self.prepare_columns(k, self.sweep.trailing(k), 1),
            (TaskKind::Trailing, _) => {
                let contribution = self.contribution(k, self.sweep.trailing(k).to_vec());
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
                "getrf has no task {}[{k}] at {index:?}",
                kind.name()
            ))),
        }
    }

    fn contribution(&self, k: usize, cols: Vec<usize>) -> Contribution<'p, T> {
        Contribution {
            dest: self.a,
            left: self.a,
            right: self.a,
            k,
            rows: (k + 1..self.a.mt()).collect(),
            cols,
            beta: T::one(),
        }
    }

    fn step_pivots(&self, k: usize) -> Vec<Pivot> {
        self.pivots.lock()[k].clone()
    }

    fn send(&self, directive: Option<Directive>, tiles: &mut usize, bytes: &mut usize) -> Result<()> {
        if let Some(directive) = directive {
            let sent = self
                .session
                .director
                .execute(&directive, self.a, self.session.transport)?;
            if sent > 0 {
                *tiles += 1;
                *bytes += sent;
            }
        }
        Ok(())
    }

    /// Factor column `k` and swap its rows
    fn panel(&self, k: usize) -> Result<()> {
        let a = self.a;
        let transport = self.session.transport;
        let root = a.tile_rank(k, k);

        let factored = match gather_panel(a, k, transport)? {
            Some(tiles) => {
                let row_base: usize = (0..k).map(|i| a.tile_rows(i)).sum();
                Some(self.solver.factor(&tiles, row_base)?)
            }
            None => None,
        };
        if let Some(factored) = &factored {
            self.session.emit(PipelineEvent::PanelFactored {
                trace_id: self.session.trace_id(),
                step: k,
                zero_pivot: factored.pivots.zero_pivot,
            });
        }

        let panel = exchange_pivots(transport, root, k, factored.as_ref().map(|f| &f.pivots))?;
        self.session.emit(PipelineEvent::PivotsBroadcast {
            trace_id: self.session.trace_id(),
            step: k,
            count: panel.pivots.len(),
        });
        if let Some(row) = panel.zero_pivot {
            let mut first = self.zero_pivot.lock();
            if first.is_none() {
                tracing::warn!(step = k, row, "exactly zero pivot");
                *first = Some(row);
            }
        }
        self.pivots.lock()[k] = panel.pivots.clone();

        let rows = permute_rows(
            a,
            k,
            &panel.pivots,
            k,
            SwapPass::new(k, Channel::RowSwap, 0),
            transport,
        )?;
        if let Some(factored) = factored {
            let diag = factored.diag;
            a.update(k, k, Placement::InPlace, |akk| {
                for c in 0..diag.cols() {
                    for r in 0..diag.rows() {
                        akk.set(r, c, diag.get(r, c));
                    }
                }
            })?;
        }
        self.session.emit(PipelineEvent::RowsSwapped {
            trace_id: self.session.trace_id(),
            step: k,
            rows,
            deferred: false,
        });
        Ok(())
    }

    /// Send the factored diagonal tile, form and send the `L` tiles of column `k`
    fn broadcast(&self, k: usize) -> Result<()> {
        let a = self.a;
        let director = &self.session.director;
        let layout = self.layout();
        let mt = a.mt();
        let window = self.sweep.window(k);
        let trailing = self.sweep.trailing_range(k);
        let (mut tiles, mut bytes) = (0, 0);

        let mut groups = vec![TileRange::col(k + 1..mt, k)];
        groups.extend(window.iter().map(|&j| TileRange::tile(k, j)));
        groups.push(TileRange::row(k, trailing.clone()));
        let diag = director.directive(k, Channel::Tile, 0, a, (k, k), a, &groups, layout)?;
        self.send(diag, &mut tiles, &mut bytes)?;

        solve_below_diagonal(a, k)?;
        for i in k + 1..mt {
            let mut groups: Vec<TileRange> = window.iter().map(|&j| TileRange::tile(i, j)).collect();
            groups.push(TileRange::row(i, trailing.clone()));
            let column = director.directive(k, Channel::Tile, 0, a, (i, k), a, &groups, layout)?;
            self.send(column, &mut tiles, &mut bytes)?;
        }

        self.session
            .residency
            .hold(k, a, (k..mt).map(|i| (i, k)))?;
        self.session.emit(PipelineEvent::TilesBroadcast {
            trace_id: self.session.trace_id(),
            step: k,
            tiles,
            bytes,
        });
        Ok(())
    }

    /// Swap rows of `cols`, solve their block-row `k` and send it down
    fn prepare_columns(&self, k: usize, cols: &[usize], offset: usize) -> Result<()> {
        let a = self.a;
        let transport = self.session.transport;
        let pivots = self.step_pivots(k);
        let pass = SwapPass::new(k, Channel::RowSwap, offset);
        let mut rows = 0;
        for &j in cols {
            rows += permute_rows(a, k, &pivots, j, pass, transport)?;
        }

        let mut solved = 0;
        for &j in cols.iter().filter(|&&j| a.is_local_existing(k, j)) {
            solve_right_of_diagonal(a, k, j)?;
            solved += 1;
        }
        if solved > 0 {
            a.tick(k, k)?;
        }

        let layout = self.layout();
        let (mut tiles, mut bytes) = (0, 0);
        for &j in cols {
            let groups = [TileRange::col(k + 1..a.mt(), j)];
            let row = self
                .session
                .director
                .directive(k, Channel::Tile, 0, a, (k, j), a, &groups, layout)?;
            self.send(row, &mut tiles, &mut bytes)?;
        }
        tracing::trace!(step = k, ?cols, rows, solved, tiles, "columns prepared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_shape() {
        let plan = plan_getrf(4, 4, 1);
        assert_eq!(plan.count(TaskKind::Panel), 4);
        assert_eq!(plan.count(TaskKind::Lookahead), 3);
        assert_eq!(plan.count(TaskKind::Trailing), 2);

        let panel0 = plan.find(TaskKind::Panel, 0, None).unwrap();
        let panel1 = plan.find(TaskKind::Panel, 1, None).unwrap();
        let look = plan.find(TaskKind::Lookahead, 0, Some(1)).unwrap();
        let trail0 = plan.find(TaskKind::Trailing, 0, None).unwrap();
        assert!(plan.precedes(panel0, panel1));
        assert!(plan.depends_on(panel1, look));
        assert!(!plan.precedes(trail0, panel1));
    }

    #[test]
    fn test_wide_matrix_updates_columns_past_last_panel() {
        let plan = plan_getrf(2, 5, 1);
        assert_eq!(plan.count(TaskKind::Panel), 2);
        assert!(plan.find(TaskKind::Lookahead, 1, Some(2)).is_some());
        assert!(plan.find(TaskKind::Trailing, 1, None).is_some());
    }

    #[test]
    fn test_communicating_tasks_are_ordered() {
        let plan = plan_getrf(5, 5, 2);
        let comm: Vec<usize> = plan
            .tasks()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.communicates())
            .map(|(id, _)| id)
            .collect();
        for pair in comm.windows(2) {
            assert!(plan.precedes(pair[0], pair[1]));
        }
    }
}
