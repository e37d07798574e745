//! Matrix views: tile sub-ranges, transposition and triangle selection
//!
//! A [`MatrixView`] never copies data. All indices are tile indices in view
//! coordinates and are mapped onto the underlying storage on access.

use crate::device::DeviceHold;
use crate::error::{Error, Result};
use crate::layout::{Op, Uplo};
use crate::matrix::{Placement, Residency, TiledMatrix};
use crate::numeric::Scalar;
use crate::tile::{Tile, TileMut};
use std::ops::Range;

#[derive(Debug)]
pub struct MatrixView<T> {
    matrix: TiledMatrix<T>,
    row0: usize,
    col0: usize,
    rows: usize,
    cols: usize,
    op: Op,
    // Triangle in storage orientation
    uplo: Option<Uplo>,
}

impl<T> Clone for MatrixView<T> {
    fn clone(&self) -> Self {
        Self {
            matrix: self.matrix.clone(),
            row0: self.row0,
            col0: self.col0,
            rows: self.rows,
            cols: self.cols,
            op: self.op,
            uplo: self.uplo,
        }
    }
}

impl<T: Scalar> TiledMatrix<T> {
    /// View of the whole matrix
    pub fn view(&self) -> MatrixView<T> {
        MatrixView {
            matrix: self.clone(),
            row0: 0,
            col0: 0,
            rows: self.mt(),
            cols: self.nt(),
            op: Op::NoTrans,
            uplo: None,
        }
    }
}

impl<T: Scalar> MatrixView<T> {
    pub fn matrix(&self) -> &TiledMatrix<T> {
        &self.matrix
    }

    pub fn op(&self) -> Op {
        self.op
    }

    /// Triangle as seen through the view
    pub fn uplo(&self) -> Option<Uplo> {
        self.uplo.map(|u| if self.op.swaps_indices() { u.flip() } else { u })
    }

    /// Treat the view as triangular with the given logical triangle
    pub fn with_uplo(mut self, uplo: Uplo) -> Self {
        self.uplo = Some(if self.op.swaps_indices() { uplo.flip() } else { uplo });
        self
    }

    pub fn rank(&self) -> usize {
        self.matrix.rank()
    }

    pub fn num_ranks(&self) -> usize {
        self.matrix.distribution().num_ranks()
    }

    /// Block-rows of the view
    pub fn mt(&self) -> usize {
        if self.op.swaps_indices() {
            self.cols
        } else {
            self.rows
        }
    }

    /// Block-columns of the view
    pub fn nt(&self) -> usize {
        if self.op.swaps_indices() {
            self.rows
        } else {
            self.cols
        }
    }

    /// Storage coordinates of view tile `(i, j)`
    #[inline]
    pub fn storage_index(&self, i: usize, j: usize) -> (usize, usize) {
        if self.op.swaps_indices() {
            (self.row0 + j, self.col0 + i)
        } else {
            (self.row0 + i, self.col0 + j)
        }
    }

    pub fn tile_rows(&self, i: usize) -> usize {
        if self.op.swaps_indices() {
            self.matrix.tile_cols(self.col0 + i)
        } else {
            self.matrix.tile_rows(self.row0 + i)
        }
    }

    pub fn tile_cols(&self, j: usize) -> usize {
        if self.op.swaps_indices() {
            self.matrix.tile_rows(self.row0 + j)
        } else {
            self.matrix.tile_cols(self.col0 + j)
        }
    }

    /// Total element rows
    pub fn m(&self) -> usize {
        (0..self.mt()).map(|i| self.tile_rows(i)).sum()
    }

    /// Total element columns
    pub fn n(&self) -> usize {
        (0..self.nt()).map(|j| self.tile_cols(j)).sum()
    }

    pub fn tile_rank(&self, i: usize, j: usize) -> usize {
        let (si, sj) = self.storage_index(i, j);
        self.matrix.tile_rank(si, sj)
    }

    pub fn tile_device(&self, i: usize, j: usize) -> usize {
        let (si, sj) = self.storage_index(i, j);
        self.matrix.tile_device(si, sj)
    }

    pub fn is_local(&self, i: usize, j: usize) -> bool {
        self.tile_rank(i, j) == self.matrix.rank()
    }

    pub fn tile_exists(&self, i: usize, j: usize) -> bool {
        if i >= self.mt() || j >= self.nt() {
            return false;
        }
        let (si, sj) = self.storage_index(i, j);
        self.matrix.tile_exists(si, sj)
    }

    /// Local and existing
    pub fn is_local_existing(&self, i: usize, j: usize) -> bool {
        self.tile_exists(i, j) && self.is_local(i, j)
    }

    /// Local existing tiles in view coordinates
    pub fn local_tiles(&self) -> Vec<(usize, usize)> {
        let mut tiles = Vec::new();
        for j in 0..self.nt() {
            for i in 0..self.mt() {
                if self.is_local_existing(i, j) {
                    tiles.push((i, j));
                }
            }
        }
        tiles
    }

    /// Tile sub-range in view coordinates
    pub fn sub(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Self> {
        if rows.start > rows.end || rows.end > self.mt() {
            return Err(Error::InvalidParameter(format!(
                "row range {rows:?} outside {} block-rows",
                self.mt()
            )));
        }
        if cols.start > cols.end || cols.end > self.nt() {
            return Err(Error::InvalidParameter(format!(
                "column range {cols:?} outside {} block-columns",
                self.nt()
            )));
        }
        let mut view = self.clone();
        let (srows, scols) = if self.op.swaps_indices() {
            (cols, rows)
        } else {
            (rows, cols)
        };
        view.row0 += srows.start;
        view.col0 += scols.start;
        view.rows = srows.len();
        view.cols = scols.len();
        Ok(view)
    }

    /// Transposed view
    pub fn transpose(&self) -> Self {
        let mut view = self.clone();
        view.op = self.op.transposed();
        view
    }

    /// Conjugate-transposed view
    ///
    /// A transposed complex view has no conjugate-transposed representation.
    pub fn conj_transpose(&self) -> Result<Self> {
        if self.op == Op::Trans {
            if T::IS_COMPLEX {
                return Err(Error::InvalidParameter(
                    "conjugate transpose of a transposed complex view".to_string(),
                ));
            }
            return Ok(self.transpose());
        }
        let mut view = self.clone();
        view.op = self.op.conj_transposed();
        Ok(view)
    }

    /// Snapshot of a tile in storage orientation; read it through [`Self::op`]
    pub fn read(&self, i: usize, j: usize) -> Result<Tile<T>> {
        let (si, sj) = self.storage_index(i, j);
        self.matrix.read(si, sj)
    }

    /// Mutate a local tile through the view's transposition
    pub fn update<R>(
        &self,
        i: usize,
        j: usize,
        placement: Placement,
        f: impl FnOnce(&mut TileMut<'_, T>) -> R,
    ) -> Result<R> {
        let (si, sj) = self.storage_index(i, j);
        let op = self.op;
        self.matrix.update(si, sj, placement, |tile| {
            let mut view = tile.view_mut(op);
            f(&mut view)
        })
    }

    /// Store a received copy, in storage orientation
    pub fn install_remote(&self, i: usize, j: usize, tile: Tile<T>, life: usize) -> Result<()> {
        let (si, sj) = self.storage_index(i, j);
        self.matrix.install_remote(si, sj, tile, life)
    }

    pub fn tick(&self, i: usize, j: usize) -> Result<()> {
        let (si, sj) = self.storage_index(i, j);
        self.matrix.tick(si, sj)
    }

    pub fn remote_life(&self, i: usize, j: usize) -> Option<usize> {
        let (si, sj) = self.storage_index(i, j);
        self.matrix.remote_life(si, sj)
    }

    pub fn residency(&self, i: usize, j: usize) -> Option<Residency> {
        let (si, sj) = self.storage_index(i, j);
        self.matrix.residency(si, sj)
    }

    /// Pin a local tile on its accelerator
    pub fn hold(&self, i: usize, j: usize) -> Result<DeviceHold> {
        let (si, sj) = self.storage_index(i, j);
        self.matrix.hold(si, sj, self.matrix.tile_device(si, sj))
    }

    /// Placement of a tile on its own accelerator
    pub fn device_placement(&self, i: usize, j: usize) -> Placement {
        Placement::Device(self.tile_device(i, j))
    }
}
