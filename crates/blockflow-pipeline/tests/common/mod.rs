//! Shared helpers for the pipeline integration tests
#![allow(dead_code)]

use blockflow_core::{BlockCyclic, Distribution, LocalEndpoint, LocalFabric, Options, Shape, TiledMatrix};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

/// Column-major dense matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    pub m: usize,
    pub n: usize,
    pub data: Vec<f64>,
}

impl Dense {
    pub fn zeros(m: usize, n: usize) -> Self {
        Self {
            m,
            n,
            data: vec![0.0; m * n],
        }
    }

    pub fn from_fn(m: usize, n: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut out = Self::zeros(m, n);
        for j in 0..n {
            for i in 0..m {
                out.data[i + j * m] = f(i, j);
            }
        }
        out
    }

    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 })
    }

    /// Uniform entries in `[-1, 1)`
    pub fn random(m: usize, n: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let data = (0..m * n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Self { m, n, data }
    }

    /// Random matrix with a dominant diagonal
    pub fn diagonally_dominant(n: usize, seed: u64) -> Self {
        let mut a = Self::random(n, n, seed);
        for i in 0..n {
            a.set(i, i, a.get(i, i) + n as f64);
        }
        a
    }

    /// Random triangle with a well-conditioned diagonal; the other triangle is garbage
    pub fn triangular(n: usize, lower: bool, unit: bool, seed: u64) -> Self {
        let mut a = Self::random(n, n, seed).scaled(1.0 / n as f64);
        for i in 0..n {
            a.set(i, i, if unit { 99.0 } else { 1.0 + a.get(i, i).abs() });
        }
        // garbage in the unused triangle must never be read
        for j in 0..n {
            for i in 0..n {
                if (lower && i < j) || (!lower && i > j) {
                    a.set(i, j, 1.0e3);
                }
            }
        }
        a
    }

    /// Copy with the unused triangle zeroed and the diagonal made explicit
    pub fn triangle(&self, lower: bool, unit: bool) -> Self {
        Self::from_fn(self.m, self.n, |i, j| {
            if i == j {
                if unit {
                    1.0
                } else {
                    self.get(i, j)
                }
            } else if (lower && i > j) || (!lower && i < j) {
                self.get(i, j)
            } else {
                0.0
            }
        })
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i + j * self.m]
    }

    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.data[i + j * self.m] = value;
    }

    pub fn transpose(&self) -> Self {
        Self::from_fn(self.n, self.m, |i, j| self.get(j, i))
    }

    pub fn matmul(&self, other: &Dense) -> Self {
        assert_eq!(self.n, other.m);
        let mut out = Self::zeros(self.m, other.n);
        for j in 0..other.n {
            for t in 0..self.n {
                let b = other.get(t, j);
                for i in 0..self.m {
                    out.data[i + j * self.m] += self.get(i, t) * b;
                }
            }
        }
        out
    }

    pub fn scaled(&self, alpha: f64) -> Self {
        Self {
            m: self.m,
            n: self.n,
            data: self.data.iter().map(|v| v * alpha).collect(),
        }
    }

    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0, |acc, v| acc.max(v.abs()))
    }

    pub fn max_diff(&self, other: &Dense) -> f64 {
        assert_eq!((self.m, self.n), (other.m, other.n));
        self.data
            .iter()
            .zip(&other.data)
            .fold(0.0, |acc, (a, b)| acc.max((a - b).abs()))
    }

    /// Rows of `self` reordered so that row `r` is row `perm[r]`
    pub fn permute_rows(&self, perm: &[usize]) -> Self {
        Self::from_fn(self.m, self.n, |i, j| self.get(perm[i], j))
    }

    /// Split a packed LU result into its unit lower and upper factors
    pub fn lu_factors(&self) -> (Dense, Dense) {
        let k = self.m.min(self.n);
        let l = Self::from_fn(self.m, k, |i, j| match i.cmp(&j) {
            std::cmp::Ordering::Greater => self.get(i, j),
            std::cmp::Ordering::Equal => 1.0,
            std::cmp::Ordering::Less => 0.0,
        });
        let u = Self::from_fn(k, self.n, |i, j| if i <= j { self.get(i, j) } else { 0.0 });
        (l, u)
    }
}

/// Block-cyclic layout over a `p x q` grid
pub fn grid(p: usize, q: usize) -> Arc<dyn Distribution> {
    Arc::new(BlockCyclic::new(p, q).unwrap())
}

/// This rank's part of `dense`, cut into `nb x nb` tiles
pub fn distribute(dense: &Dense, nb: usize, dist: &Arc<dyn Distribution>, rank: usize) -> TiledMatrix<f64> {
    distribute_shaped(dense, nb, Shape::General, dist, rank)
}

pub fn distribute_shaped(
    dense: &Dense,
    nb: usize,
    shape: Shape,
    dist: &Arc<dyn Distribution>,
    rank: usize,
) -> TiledMatrix<f64> {
    TiledMatrix::from_col_major(
        dense.m,
        dense.n,
        nb,
        nb,
        shape,
        &dense.data,
        dense.m,
        Arc::clone(dist),
        rank,
    )
    .unwrap()
}

/// Local tiles written into a zero matrix
pub fn local_part(matrix: &TiledMatrix<f64>) -> Dense {
    let mut out = Dense::zeros(matrix.m(), matrix.n());
    matrix.write_local_into(&mut out.data, matrix.m()).unwrap();
    out
}

/// Reassemble the full matrix from every rank's local part
pub fn merge(parts: &[Dense]) -> Dense {
    let mut out = Dense::zeros(parts[0].m, parts[0].n);
    for part in parts {
        for (acc, v) in out.data.iter_mut().zip(&part.data) {
            *acc += v;
        }
    }
    out
}

/// Run `f` on every rank of a `p x q` grid
pub fn on_grid<R, F>(p: usize, q: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(LocalEndpoint, Arc<dyn Distribution>) -> R + Sync,
{
    let dist = grid(p, q);
    LocalFabric::run(p * q, |endpoint| f(endpoint, Arc::clone(&dist)))
}

/// Options with a small, fixed panel pool
pub fn options(lookahead: usize) -> Options {
    Options::default()
        .with_lookahead(lookahead)
        .with_max_panel_threads(2)
}

/// Lookahead depths every pipeline must agree on
pub fn lookahead_depths(blocks: usize) -> Vec<usize> {
    let mut depths = vec![0, 1, 2, blocks.saturating_sub(1).min(4)];
    depths.sort_unstable();
    depths.dedup();
    depths
}

/// `|| A x - b || / (|| A || || x ||)` in the max norm
pub fn backward_error(a: &Dense, x: &Dense, b: &Dense) -> f64 {
    let residual = a.matmul(x).max_diff(b);
    residual / (a.max_abs() * x.max_abs()).max(f64::MIN_POSITIVE)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
