//! Solve `A X = B` with the factors of [`getrf`](crate::getrf())

use crate::pivot::{permute_rows, SwapPass};
use crate::report::{LuFactors, RunReport};
use crate::trsm::check_ranks;
use blockflow_core::{
    Channel, Diag, Error, EventBus, MatrixView, Options, PipelineContext, PipelineEvent, Result,
    Scalar, Side, Transport, Uplo,
};
use std::time::Instant;

pub(crate) const ROUTINE: &str = "getrs";

fn validate<T: Scalar>(
    a: &MatrixView<T>,
    factors: &LuFactors,
    b: &MatrixView<T>,
    transport: &dyn Transport,
) -> Result<()> {
    crate::getrf::reject_band(a)?;
    if let Some(index) = factors.info.first_zero_pivot {
        return Err(Error::SingularMatrix { index });
    }
    if a.mt() != a.nt() {
        return Err(Error::size_mismatch(a.mt(), a.nt(), "factored matrix block-columns"));
    }
    if factors.pivots.len() != a.mt() {
        return Err(Error::size_mismatch(a.mt(), factors.pivots.len(), "pivot steps"));
    }
    if a.mt() != b.mt() {
        return Err(Error::size_mismatch(a.mt(), b.mt(), "right-hand side block-rows"));
    }
    for i in 0..a.mt() {
        if a.tile_rows(i) != b.tile_rows(i) {
            return Err(Error::size_mismatch(a.tile_rows(i), b.tile_rows(i), "right-hand side tile rows"));
        }
    }
    check_ranks(transport, &[a, b])
}

/// Solve with the default event bus
#[tracing::instrument(skip_all, fields(rank = transport.rank()))]
pub fn getrs<T: Scalar>(
    a: &MatrixView<T>,
    factors: &LuFactors,
    b: &MatrixView<T>,
    transport: &dyn Transport,
    options: &Options,
) -> Result<RunReport> {
    getrs_with_events(a, factors, b, transport, options, &crate::default_events())
}

/// Solve reporting to `events`
///
/// `B` is overwritten with `X`. Every rank must pass the same `factors`.
pub fn getrs_with_events<T: Scalar>(
    a: &MatrixView<T>,
    factors: &LuFactors,
    b: &MatrixView<T>,
    transport: &dyn Transport,
    options: &Options,
    events: &EventBus,
) -> Result<RunReport> {
    options.validate()?;
    validate(a, factors, b, transport)?;
    let context = PipelineContext::new();

    let start = Instant::now();
    let mut rows = 0;
    for (k, step) in factors.pivots.steps().iter().enumerate() {
        for j in 0..b.nt() {
            let pass = SwapPass::new(k, Channel::RowSwap, 0);
            rows += permute_rows(b, k, step, j, pass, transport).map_err(|err| {
                transport.abort(&format!("rank {} failed: {err}", transport.rank()));
                err
            })?;
        }
    }
    let swaps = start.elapsed();
    events.emit(
        PipelineEvent::RowsSwapped {
            trace_id: context.trace_id,
            step: factors.pivots.len().saturating_sub(1),
            rows,
            deferred: false,
        },
        &context,
    );

    let lower = a.clone().with_uplo(Uplo::Lower);
    let mut report = crate::trsm::run(
        Side::Left,
        Diag::Unit,
        T::one(),
        &lower,
        b,
        transport,
        options,
        events,
        context.fork(),
    )?;
    let upper = a.clone().with_uplo(Uplo::Upper);
    let second = crate::trsm::run(
        Side::Left,
        Diag::NonUnit,
        T::one(),
        &upper,
        b,
        transport,
        options,
        events,
        context.fork(),
    )?;

    report.absorb(&second);
    report.routine = ROUTINE;
    report.trace_id = context.trace_id;
    report.elapsed += swaps;
    *report.stage_timings.entry("row_swaps".to_string()).or_default() += swaps;
    tracing::debug!(rows, steps = report.steps, "getrs done");
    Ok(report)
}
