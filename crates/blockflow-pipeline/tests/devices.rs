//! Pipelines on the accelerator target

mod common;

use blockflow_core::{
    BlockCyclic, DeviceSet, Diag, Distribution, Error, EventBus, LocalFabric, MetricsHandler,
    Options, Residency, Side, Target, TiledMatrix, Transport, Uplo,
};
use blockflow_pipeline::{getrf, getrf_with_events, trsm, trsm_with_events};
use common::{distribute, local_part, merge, options, Dense};
use std::sync::Arc;

fn device_grid() -> Arc<dyn Distribution> {
    Arc::new(BlockCyclic::single().with_devices(2))
}

fn on_devices(dense: &Dense, nb: usize, devices: &DeviceSet) -> TiledMatrix<f64> {
    let matrix = distribute(dense, nb, &device_grid(), 0);
    matrix.attach_devices(devices.clone());
    matrix
}

fn device_options(lookahead: usize) -> Options {
    options(lookahead).with_target(Target::Devices)
}

fn assert_all_home(matrix: &TiledMatrix<f64>, devices: &DeviceSet) {
    for (i, j) in matrix.local_tiles() {
        assert_eq!(matrix.residency(i, j), Some(Residency::ValidHost), "tile ({i}, {j})");
        assert_eq!(matrix.holds(i, j), 0);
    }
    for arena in devices.iter() {
        assert_eq!(arena.reserved(), 0, "device {}", arena.id());
        assert_eq!(arena.resident(), 0, "device {}", arena.id());
    }
}

#[test]
fn test_trsm_on_devices_matches_host() {
    let n = 24;
    let a = Dense::triangular(n, true, false, 61);
    let b = Dense::random(n, 8, 62);

    let endpoint = LocalFabric::endpoints(1).remove(0);
    let host_a = distribute(&a, 4, &device_grid(), 0);
    let host_b = distribute(&b, 4, &device_grid(), 0);
    trsm(
        Side::Left,
        Diag::NonUnit,
        0.5,
        &host_a.view().with_uplo(Uplo::Lower),
        &host_b.view(),
        &endpoint,
        &options(1),
    )
    .unwrap();

    let devices = DeviceSet::new(2, 256);
    let am = on_devices(&a, 4, &devices);
    let bm = on_devices(&b, 4, &devices);
    let metrics = MetricsHandler::new();
    let events = EventBus::new();
    events.register(metrics.clone());
    trsm_with_events(
        Side::Left,
        Diag::NonUnit,
        0.5,
        &am.view().with_uplo(Uplo::Lower),
        &bm.view(),
        &endpoint,
        &device_options(1),
        &events,
    )
    .unwrap();

    assert!(local_part(&host_b).max_diff(&local_part(&bm)) < 1e-13);
    assert!(metrics.snapshot().holds_released > 0);
    assert!(devices.iter().any(|arena| arena.peak_resident() > 0));
    assert_all_home(&am, &devices);
    assert_all_home(&bm, &devices);
}

#[test]
fn test_getrf_on_devices_matches_host() {
    let a = Dense::random(20, 20, 63);
    let endpoint = LocalFabric::endpoints(1).remove(0);

    let host = distribute(&a, 4, &device_grid(), 0);
    let reference = getrf(&host.view(), &endpoint, &options(2)).unwrap();

    let devices = DeviceSet::new(2, 256);
    let am = on_devices(&a, 4, &devices);
    let metrics = MetricsHandler::new();
    let events = EventBus::new();
    events.register(metrics.clone());
    let factors = getrf_with_events(&am.view(), &endpoint, &device_options(2), &events).unwrap();

    assert_eq!(factors.pivots, reference.pivots);
    assert!(local_part(&host).max_diff(&local_part(&am)) < 1e-12);
    assert!(metrics.snapshot().holds_released > 0);
    assert_all_home(&am, &devices);
}

#[test]
fn test_getrf_on_devices_across_grid() {
    let a = Dense::random(24, 24, 67);
    let endpoint = LocalFabric::endpoints(1).remove(0);
    let host = distribute(&a, 4, &device_grid(), 0);
    let reference = getrf(&host.view(), &endpoint, &options(1)).unwrap();

    let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::new(2, 2).unwrap().with_devices(2));
    let results = LocalFabric::run(4, |endpoint| {
        let rank = endpoint.rank();
        let devices = DeviceSet::new(2, 256);
        let am = distribute(&a, 4, &dist, rank);
        am.attach_devices(devices.clone());
        let factors = getrf(&am.view(), &endpoint, &device_options(1)).unwrap();
        assert_all_home(&am, &devices);
        assert_eq!(am.remote_count(), 0, "rank {rank} kept copies");
        (local_part(&am), factors.pivots)
    });

    for (_, pivots) in &results {
        assert_eq!(pivots, &reference.pivots);
    }
    let parts: Vec<Dense> = results.into_iter().map(|(part, _)| part).collect();
    assert!(local_part(&host).max_diff(&merge(&parts)) < 1e-12);
}

#[test]
fn test_undersized_arena_leaves_operands_untouched() {
    let a = Dense::triangular(16, false, false, 64);
    let b = Dense::random(16, 4, 65);
    let devices = DeviceSet::new(2, 1);
    let am = on_devices(&a, 4, &devices);
    let bm = on_devices(&b, 4, &devices);
    let endpoint = LocalFabric::endpoints(1).remove(0);

    let err = trsm(
        Side::Left,
        Diag::NonUnit,
        1.0,
        &am.view().with_uplo(Uplo::Upper),
        &bm.view(),
        &endpoint,
        &device_options(1),
    )
    .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { .. }), "{err:?}");
    assert_eq!(local_part(&bm), b);
    for arena in devices.iter() {
        assert_eq!(arena.reserved(), 0);
    }

    let err = getrf(&am.view(), &endpoint, &device_options(1)).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { .. }));
    assert_eq!(local_part(&am), a);
}

#[test]
fn test_device_target_requires_accelerators() {
    let endpoint = LocalFabric::endpoints(1).remove(0);
    let a = distribute(&Dense::random(8, 8, 66), 4, &device_grid(), 0);
    let err = getrf(&a.view(), &endpoint, &device_options(1)).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
}
