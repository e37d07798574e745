//! Tiled storage, views, tile kernels and the in-process transport

use approx::assert_abs_diff_eq;
use blockflow_core::kernels;
use blockflow_core::{
    BlockCyclic, Channel, Diag, Distribution, Error, Layout, LocalFabric, Op, Placement, Shape, Side,
    Tag, Tile, TiledMatrix, Transport, Uplo,
};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

fn random(len: usize, seed: u64) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Well-conditioned triangular tile in column-major order
fn triangular_tile(n: usize, seed: u64) -> Tile<f64> {
    let values = random(n * n, seed);
    Tile::from_fn(n, n, Layout::ColMajor, |i, j| {
        if i == j {
            2.0 + values[i + j * n].abs()
        } else {
            values[i + j * n] / n as f64
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_local_parts_cover_matrix_once(
        m in 1usize..30,
        n in 1usize..30,
        nb in 1usize..8,
        p in 1usize..4,
        q in 1usize..4,
    ) {
        let data = random(m * n, (m * 31 + n) as u64);
        let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::new(p, q).unwrap());
        let mut merged = vec![0.0; m * n];
        let mut owned = 0;
        for rank in 0..p * q {
            let matrix = TiledMatrix::from_col_major(
                m, n, nb, nb, Shape::General, &data, m, Arc::clone(&dist), rank,
            ).unwrap();
            owned += matrix.local_tiles().len();
            let mut part = vec![0.0; m * n];
            matrix.write_local_into(&mut part, m).unwrap();
            for (acc, v) in merged.iter_mut().zip(&part) {
                *acc += v;
            }
        }
        prop_assert_eq!(owned, m.div_ceil(nb) * n.div_ceil(nb));
        prop_assert_eq!(merged, data);
    }

    #[test]
    fn prop_transposed_view_reads_mirror(m in 1usize..20, n in 1usize..20, nb in 1usize..6) {
        let data = random(m * n, 7);
        let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::single());
        let matrix = TiledMatrix::from_col_major(m, n, nb, nb, Shape::General, &data, m, dist, 0).unwrap();
        let view = matrix.view().transpose();
        prop_assert_eq!((view.m(), view.n()), (n, m));
        prop_assert_eq!((view.mt(), view.nt()), (matrix.nt(), matrix.mt()));
        for i in 0..view.mt() {
            for j in 0..view.nt() {
                let tile = view.read(i, j).unwrap();
                let logical = tile.view(view.op());
                prop_assert_eq!(logical.rows(), view.tile_rows(i));
                for r in 0..logical.rows() {
                    for c in 0..logical.cols() {
                        let (row, col) = (i * nb + r, j * nb + c);
                        prop_assert_eq!(logical.get(r, c), data[col + row * m]);
                    }
                }
            }
        }
    }

    #[test]
    fn prop_tile_trsm_solves(n in 1usize..9, rhs in 1usize..6, seed in 0u64..1000, lower in any::<bool>(), left in any::<bool>()) {
        let uplo = if lower { Uplo::Lower } else { Uplo::Upper };
        let side = if left { Side::Left } else { Side::Right };
        let a = triangular_tile(n, seed);
        let (rows, cols) = if left { (n, rhs) } else { (rhs, n) };
        let b = Tile::from_col_major(rows, cols, random(rows * cols, seed + 1)).unwrap();

        let mut x = b.clone();
        kernels::trsm(side, uplo, Diag::NonUnit, 2.0, a.view(Op::NoTrans), &mut x.view_mut(Op::NoTrans)).unwrap();

        // multiply back with the referenced triangle only
        let tri = |i: usize, j: usize| {
            let inside = if lower { i >= j } else { i <= j };
            if inside { a.get(i, j) } else { 0.0 }
        };
        for r in 0..rows {
            for c in 0..cols {
                let product: f64 = match side {
                    Side::Left => (0..n).map(|t| tri(r, t) * x.get(t, c)).sum(),
                    Side::Right => (0..n).map(|t| x.get(r, t) * tri(t, c)).sum(),
                };
                prop_assert!((product - 2.0 * b.get(r, c)).abs() < 1e-12);
            }
        }
    }
}

#[test]
fn test_gemm_through_transpositions() {
    let a = Tile::from_col_major(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let mut c = Tile::zeros(2, 2, Layout::ColMajor);
    // C = A^T A
    kernels::gemm(1.0, a.view(Op::Trans), a.view(Op::NoTrans), 0.0, &mut c.view_mut(Op::NoTrans)).unwrap();
    assert_abs_diff_eq!(c.get(0, 0), 14.0);
    assert_abs_diff_eq!(c.get(0, 1), 32.0);
    assert_abs_diff_eq!(c.get(1, 0), 32.0);
    assert_abs_diff_eq!(c.get(1, 1), 77.0);

    let err = kernels::gemm(1.0, a.view(Op::NoTrans), a.view(Op::NoTrans), 0.0, &mut c.view_mut(Op::NoTrans))
        .unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { .. }));
}

#[test]
fn test_band_skips_tiles_outside() {
    let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::single());
    let band = TiledMatrix::<f64>::with_shape(12, 12, 3, 3, Shape::Band { kl: 3, ku: 1 }, dist, 0).unwrap();
    assert!(band.tile_exists(1, 0));
    assert!(band.tile_exists(0, 1));
    assert!(!band.tile_exists(2, 0));
    assert!(!band.tile_exists(0, 2));
    assert!(matches!(band.read(3, 0).unwrap_err(), Error::TileUnavailable { .. }));
    assert_eq!(band.local_tiles().len(), 4 + 3 + 3);
}

#[test]
fn test_sub_view_and_update() {
    let n = 8;
    let data = random(n * n, 3);
    let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::single());
    let matrix = TiledMatrix::from_col_major(n, n, 4, 4, Shape::General, &data, n, dist, 0).unwrap();
    let sub = matrix.view().transpose().sub(1..2, 0..1).unwrap();
    assert_eq!(sub.storage_index(0, 0), (0, 1));

    // write logical (0, 1) of the transposed sub-view: stored at (1, 4)
    sub.update(0, 0, Placement::Host, |tile| tile.set(0, 1, 42.0)).unwrap();
    let mut out = vec![0.0; n * n];
    matrix.write_local_into(&mut out, n).unwrap();
    assert_eq!(out[1 + 4 * n], 42.0);
    assert!(matrix.view().sub(0..3, 0..1).is_err());
}

#[test]
fn test_messages_keep_order_per_tag() {
    let received = LocalFabric::run(2, |endpoint| {
        let first = Tag::new(3, Channel::Tile, 0, 1);
        let second = Tag::new(3, Channel::Tile, 1, 1);
        if endpoint.rank() == 0 {
            for value in 0..4u8 {
                endpoint.send(1, first, vec![value]).unwrap();
            }
            endpoint.send(1, second, vec![9]).unwrap();
            Vec::new()
        } else {
            // the later tag can be taken first
            let mut got = endpoint.recv(0, second).unwrap();
            for _ in 0..4 {
                got.extend(endpoint.recv(0, first).unwrap());
            }
            got
        }
    });
    assert_eq!(received[1], vec![9, 0, 1, 2, 3]);
}

#[test]
fn test_abort_wakes_blocked_receiver() {
    let outcomes = LocalFabric::run(3, |endpoint| {
        let tag = Tag::new(0, Channel::Pivot, 0, 0);
        match endpoint.rank() {
            0 => {
                endpoint.abort("panel failed");
                Ok(Vec::new())
            }
            rank => endpoint.recv(rank - 1, tag),
        }
    });
    for outcome in &outcomes[1..] {
        match outcome {
            Err(Error::Transport { operation, reason, .. }) => {
                assert_eq!(*operation, "recv");
                assert!(reason.contains("panel failed"), "{reason}");
            }
            other => panic!("expected a transport error, got {other:?}"),
        }
    }
}

#[test]
fn test_broadcast_all_reaches_every_rank() {
    let payloads = LocalFabric::run(4, |endpoint| {
        let tag = Tag::new(5, Channel::Pivot, 0, 0);
        let payload = if endpoint.rank() == 2 { vec![7, 7] } else { Vec::new() };
        endpoint.broadcast_all(2, tag, payload).unwrap()
    });
    assert!(payloads.iter().all(|p| p == &vec![7, 7]));
}
