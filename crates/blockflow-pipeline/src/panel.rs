//! Panel solvers
//!
//! For the triangular solve the panel is the block-row of the right-hand
//! side at the current diagonal tile. For LU it is the block-column at and
//! below the diagonal: its tiles are gathered on the diagonal owner into a
//! row-major workspace, factored there with partial pivoting, and only the
//! factored diagonal tile and the pivot records leave that rank.

use crate::broadcast::relabel;
use crate::pivot::{PanelPivots, Pivot};
use blockflow_core::{
    kernels, Channel, Diag, Error, ExecutionEngine, ExecutionMode, Layout, MatrixView, Placement,
    Result, Scalar, Side, Subordinate, Tag, Tile, Transport, Uplo, WorkspacePool,
};
use std::sync::Arc;

/// `B(k, :) = multiplier * op(A(k, k))^-1 * B(k, :)` on the local tiles of the block-row
///
/// Returns the number of tiles solved. `A(k, k)` must be local or received.
pub fn solve_block_row<T: Scalar>(
    a: &MatrixView<T>,
    b: &MatrixView<T>,
    k: usize,
    diag: Diag,
    multiplier: T,
) -> Result<usize> {
    let uplo = a
        .uplo()
        .ok_or_else(|| Error::InvalidParameter("triangular operand has no uplo".to_string()))?;
    let local: Vec<usize> = (0..b.nt()).filter(|&j| b.is_local_existing(k, j)).collect();
    if local.is_empty() {
        return Ok(0);
    }
    let akk = a.read(k, k)?;
    let op = a.op();
    for &j in &local {
        b.update(k, j, Placement::Host, |bkj| {
            kernels::trsm(Side::Left, uplo, diag, multiplier, akk.view(op), bkj)
        })??;
    }
    a.tick(k, k)?;
    Ok(local.len())
}

/// `A(i, k) = A(i, k) * U(k, k)^-1` for the local tiles below the diagonal
pub fn solve_below_diagonal<T: Scalar>(a: &MatrixView<T>, k: usize) -> Result<usize> {
    let local: Vec<usize> = (k + 1..a.mt())
        .filter(|&i| a.is_local_existing(i, k))
        .collect();
    if local.is_empty() {
        return Ok(0);
    }
    let akk = a.read(k, k)?;
    for &i in &local {
        a.update(i, k, Placement::Host, |aik| {
            kernels::trsm_lu_lower(akk.view(a.op()), aik)
        })??;
    }
    a.tick(k, k)?;
    Ok(local.len())
}

/// `A(k, j) = L(k, k)^-1 * A(k, j)` with the unit lower factor of the diagonal tile
pub fn solve_right_of_diagonal<T: Scalar>(a: &MatrixView<T>, k: usize, j: usize) -> Result<()> {
    let akk = a.read(k, k)?;
    a.update(k, j, Placement::Host, |akj| {
        kernels::trsm(
            Side::Left,
            Uplo::Lower,
            Diag::Unit,
            T::one(),
            akk.view(a.op()),
            akj,
        )
    })?
}

/// Collect the tiles of block-column `k` at and below the diagonal on its diagonal owner
///
/// Returns the tiles with their block-row on the diagonal owner and `None`
/// everywhere else.
pub fn gather_panel<T: Scalar>(
    a: &MatrixView<T>,
    k: usize,
    transport: &dyn Transport,
) -> Result<Option<Vec<(usize, Tile<T>)>>> {
    let me = transport.rank();
    let root = a.tile_rank(k, k);
    let mut gathered = Vec::new();
    for i in (k..a.mt()).filter(|&i| a.tile_exists(i, k)) {
        let owner = a.tile_rank(i, k);
        let tag = Tag::new(k, Channel::Gather, 0, i);
        if owner == root {
            if me == root {
                gathered.push((i, a.read(i, k)?.to_layout(Layout::ColMajor)));
            }
        } else if me == owner {
            let tile = a.read(i, k)?.to_layout(Layout::ColMajor);
            transport
                .send(root, tag, tile.as_bytes().to_vec())
                .map_err(|e| relabel(e, "panel gather", k))?;
        } else if me == root {
            let bytes = transport
                .recv(owner, tag)
                .map_err(|e| relabel(e, "panel gather", k))?;
            let tile = Tile::from_bytes(a.tile_rows(i), a.tile_cols(k), Layout::ColMajor, &bytes)?;
            gathered.push((i, tile));
        }
    }
    Ok((me == root).then_some(gathered))
}

/// Result of a panel factorization on the diagonal owner
#[derive(Debug, Clone)]
pub struct FactoredPanel<T> {
    /// `L(k, k)` strictly below the diagonal, `U(k, k)` on and above it
    pub diag: Tile<T>,
    pub pivots: PanelPivots,
}

/// Factors gathered panels with partial pivoting
#[derive(Debug, Clone)]
pub struct PanelSolver<T: Scalar> {
    inner_blocking: usize,
    engine: Subordinate,
    workspace: Arc<WorkspacePool<T>>,
}

impl<T: Scalar> PanelSolver<T> {
    pub fn new(inner_blocking: usize, engine: Subordinate, workspace: Arc<WorkspacePool<T>>) -> Self {
        Self {
            inner_blocking: inner_blocking.max(1),
            engine,
            workspace,
        }
    }

    /// Factor the panel of step `k`
    ///
    /// `tiles` are the gathered block-rows in order, `row_base` is the
    /// global index of the first row of the panel. The first exactly-zero
    /// pivot is reported, left unscaled, and factorization continues.
    pub fn factor(
        &self,
        tiles: &[(usize, Tile<T>)],
        row_base: usize,
    ) -> Result<FactoredPanel<T>> {
        let (first_row, first) = tiles
            .first()
            .ok_or_else(|| Error::InvalidParameter("empty panel".to_string()))?;
        let nb = first.cols();
        let diag_rows = first.rows();
        let mut rows = Vec::new();
        for (i, tile) in tiles {
            if tile.cols() != nb {
                return Err(Error::size_mismatch(nb, tile.cols(), "panel tile columns"));
            }
            rows.extend((0..tile.rows()).map(|r| Pivot::new(*i, r)));
        }
        let m = rows.len();

        let mut w = self.workspace.checkout(m * nb);
        let mut offset = 0;
        for (_, tile) in tiles {
            for r in 0..tile.rows() {
                for c in 0..nb {
                    w[(offset + r) * nb + c] = tile.get(r, c);
                }
            }
            offset += tile.rows();
        }

        let (swaps, zero_pivot) = self.factor_in_place(&mut w, m, nb, row_base);
        tracing::trace!(panel_row = first_row, m, nb, ?zero_pivot, "panel factored");

        let diag = Tile::from_fn(diag_rows, nb, Layout::ColMajor, |r, c| w[r * nb + c]);
        Ok(FactoredPanel {
            diag,
            pivots: PanelPivots {
                pivots: swaps.into_iter().map(|p| rows[p]).collect(),
                zero_pivot,
            },
        })
    }

    /// Blocked right-looking LU of a row-major `m x nb` buffer
    ///
    /// Returns the swap partner of each eliminated row and the first zero pivot.
    fn factor_in_place(
        &self,
        w: &mut [T],
        m: usize,
        nb: usize,
        row_base: usize,
    ) -> (Vec<usize>, Option<usize>) {
        let count = m.min(nb);
        let mut swaps = Vec::with_capacity(count);
        let mut zero_pivot = None;
        let threads = self.engine.num_threads();
        let mut jb = 0;
        while jb < count {
            let jend = (jb + self.inner_blocking).min(count);
            for j in jb..jend {
                let mut p = j;
                let mut best = w[j * nb + j].abs1();
                for r in j + 1..m {
                    let value = w[r * nb + j].abs1();
                    if value > best {
                        best = value;
                        p = r;
                    }
                }
                swaps.push(p);
                if p != j {
                    for c in 0..nb {
                        w.swap(j * nb + c, p * nb + c);
                    }
                }
                let pivot = w[j * nb + j];
                if pivot == T::zero() && zero_pivot.is_none() {
                    zero_pivot = Some(row_base + j);
                }

                let (head, tail) = w.split_at_mut((j + 1) * nb);
                let prow = &head[j * nb..];
                let chunk = Subordinate::chunk_size(m - j - 1, threads) * nb;
                self.engine.for_each_chunk_mut(tail, chunk, |_, block| {
                    for row in block.chunks_mut(nb) {
                        if pivot != T::zero() {
                            row[j] /= pivot;
                        }
                        let l = row[j];
                        for c in j + 1..jend {
                            row[c] -= l * prow[c];
                        }
                    }
                });
            }

            // U12 = L11^-1 A12
            for r in jb..jend {
                for t in jb..r {
                    let l = w[r * nb + t];
                    for c in jend..nb {
                        let u = w[t * nb + c];
                        w[r * nb + c] -= l * u;
                    }
                }
            }

            // A22 -= L21 U12
            if jend < nb && jend < m {
                let (head, tail) = w.split_at_mut(jend * nb);
                let u12 = &head[jb * nb..];
                let chunk = Subordinate::chunk_size(m - jend, threads) * nb;
                self.engine.for_each_chunk_mut(tail, chunk, |_, block| {
                    for row in block.chunks_mut(nb) {
                        for t in jb..jend {
                            let l = row[t];
                            if l == T::zero() {
                                continue;
                            }
                            for c in jend..nb {
                                row[c] -= l * u12[(t - jb) * nb + c];
                            }
                        }
                    }
                });
            }
            jb = jend;
        }
        (swaps, zero_pivot)
    }
}
