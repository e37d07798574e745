//! Tile buffers and transposition-aware accessors
//!
//! A [`Tile`] owns a dense `rows x cols` buffer in either storage order. Host
//! copies are column-major, accelerator copies row-major. [`TileRef`] and
//! [`TileMut`] present a tile through an [`Op`] so kernels can be written once
//! in logical coordinates.

use crate::error::{Error, Result};
use crate::layout::{Layout, Op};
use crate::numeric::Scalar;

/// Dense tile buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Tile<T> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
    layout: Layout,
}

impl<T: Scalar> Tile<T> {
    /// Zero-filled tile
    pub fn zeros(rows: usize, cols: usize, layout: Layout) -> Self {
        Self {
            data: vec![T::zero(); rows * cols],
            rows,
            cols,
            layout,
        }
    }

    /// Tile filled element by element
    pub fn from_fn(
        rows: usize,
        cols: usize,
        layout: Layout,
        mut f: impl FnMut(usize, usize) -> T,
    ) -> Self {
        let mut tile = Self::zeros(rows, cols, layout);
        for j in 0..cols {
            for i in 0..rows {
                tile.set(i, j, f(i, j));
            }
        }
        tile
    }

    /// Wrap a column-major buffer
    pub fn from_col_major(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::size_mismatch(rows * cols, data.len(), "tile buffer"));
        }
        Ok(Self {
            data,
            rows,
            cols,
            layout: Layout::ColMajor,
        })
    }

    /// Rebuild a tile from its wire bytes
    pub fn from_bytes(rows: usize, cols: usize, layout: Layout, bytes: &[u8]) -> Result<Self> {
        let expected = rows * cols * std::mem::size_of::<T>();
        if bytes.len() != expected {
            return Err(Error::size_mismatch(expected, bytes.len(), "tile payload bytes"));
        }
        let mut tile = Self::zeros(rows, cols, layout);
        bytemuck::cast_slice_mut::<T, u8>(&mut tile.data).copy_from_slice(bytes);
        Ok(tile)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Raw buffer in storage order
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Buffer viewed as bytes, for the transport
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    #[inline]
    fn offset(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < self.rows && j < self.cols);
        match self.layout {
            Layout::ColMajor => i + j * self.rows,
            Layout::RowMajor => i * self.cols + j,
        }
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        self.data[self.offset(i, j)]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        let idx = self.offset(i, j);
        self.data[idx] = value;
    }

    #[inline]
    pub fn at_mut(&mut self, i: usize, j: usize) -> &mut T {
        let idx = self.offset(i, j);
        &mut self.data[idx]
    }

    /// Copy in another storage order
    pub fn to_layout(&self, layout: Layout) -> Self {
        if layout == self.layout {
            return self.clone();
        }
        Self::from_fn(self.rows, self.cols, layout, |i, j| self.get(i, j))
    }

    /// Convert storage order in place
    pub fn convert(&mut self, layout: Layout) {
        if layout != self.layout {
            *self = self.to_layout(layout);
        }
    }

    /// Copy of one row
    pub fn row(&self, r: usize) -> Vec<T> {
        (0..self.cols).map(|j| self.get(r, j)).collect()
    }

    /// Overwrite one row
    pub fn set_row(&mut self, r: usize, values: &[T]) -> Result<()> {
        if values.len() != self.cols {
            return Err(Error::size_mismatch(self.cols, values.len(), "tile row"));
        }
        for (j, &v) in values.iter().enumerate() {
            self.set(r, j, v);
        }
        Ok(())
    }

    /// Interchange two rows of this tile
    pub fn swap_rows(&mut self, r1: usize, r2: usize) {
        if r1 == r2 {
            return;
        }
        match self.layout {
            Layout::RowMajor => {
                let (lo, hi) = (r1.min(r2), r1.max(r2));
                let (head, tail) = self.data.split_at_mut(hi * self.cols);
                head[lo * self.cols..(lo + 1) * self.cols].swap_with_slice(&mut tail[..self.cols]);
            }
            Layout::ColMajor => {
                for j in 0..self.cols {
                    self.data.swap(r1 + j * self.rows, r2 + j * self.rows);
                }
            }
        }
    }

    /// Read through a transposition
    pub fn view(&self, op: Op) -> TileRef<'_, T> {
        TileRef { tile: self, op }
    }

    /// Write through a transposition
    pub fn view_mut(&mut self, op: Op) -> TileMut<'_, T> {
        TileMut { tile: self, op }
    }

    /// Largest `|re| + |im|` entry, used in tests and diagnostics
    pub fn max_abs(&self) -> f64 {
        self.data
            .iter()
            .map(|v| v.magnitude_f64())
            .fold(0.0, f64::max)
    }
}

/// Read-only tile seen through an [`Op`]
#[derive(Clone, Copy)]
pub struct TileRef<'a, T> {
    tile: &'a Tile<T>,
    op: Op,
}

impl<'a, T: Scalar> TileRef<'a, T> {
    #[inline]
    pub fn rows(&self) -> usize {
        if self.op.swaps_indices() {
            self.tile.cols
        } else {
            self.tile.rows
        }
    }

    #[inline]
    pub fn cols(&self) -> usize {
        if self.op.swaps_indices() {
            self.tile.rows
        } else {
            self.tile.cols
        }
    }

    #[inline]
    pub fn op(&self) -> Op {
        self.op
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        match self.op {
            Op::NoTrans => self.tile.get(i, j),
            Op::Trans => self.tile.get(j, i),
            Op::ConjTrans => self.tile.get(j, i).conj(),
        }
    }
}

/// Mutable tile seen through an [`Op`]
pub struct TileMut<'a, T> {
    tile: &'a mut Tile<T>,
    op: Op,
}

impl<'a, T: Scalar> TileMut<'a, T> {
    #[inline]
    pub fn rows(&self) -> usize {
        if self.op.swaps_indices() {
            self.tile.cols
        } else {
            self.tile.rows
        }
    }

    #[inline]
    pub fn cols(&self) -> usize {
        if self.op.swaps_indices() {
            self.tile.rows
        } else {
            self.tile.cols
        }
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        match self.op {
            Op::NoTrans => self.tile.get(i, j),
            Op::Trans => self.tile.get(j, i),
            Op::ConjTrans => self.tile.get(j, i).conj(),
        }
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        match self.op {
            Op::NoTrans => self.tile.set(i, j, value),
            Op::Trans => self.tile.set(j, i, value),
            Op::ConjTrans => self.tile.set(j, i, value.conj()),
        }
    }

    /// Reborrow as read-only
    pub fn as_ref(&self) -> TileRef<'_, T> {
        TileRef {
            tile: self.tile,
            op: self.op,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;

    fn sample(layout: Layout) -> Tile<f64> {
        Tile::from_fn(3, 2, layout, |i, j| (10 * i + j) as f64)
    }

    #[test]
    fn test_layout_conversion_preserves_values() {
        let col = sample(Layout::ColMajor);
        let row = col.to_layout(Layout::RowMajor);
        assert_eq!(row.layout(), Layout::RowMajor);
        assert_eq!(row.data(), &[0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        for i in 0..3 {
            for j in 0..2 {
                assert_eq!(col.get(i, j), row.get(i, j));
            }
        }
    }

    #[test]
    fn test_swap_rows_both_layouts() {
        for layout in [Layout::ColMajor, Layout::RowMajor] {
            let mut tile = sample(layout);
            tile.swap_rows(0, 2);
            assert_eq!(tile.row(0), vec![20.0, 21.0]);
            assert_eq!(tile.row(2), vec![0.0, 1.0]);
            tile.swap_rows(1, 1);
            assert_eq!(tile.row(1), vec![10.0, 11.0]);
        }
    }

    #[test]
    fn test_bytes_roundtrip_is_exact() {
        let tile = sample(Layout::RowMajor);
        let bytes = tile.as_bytes().to_vec();
        let back = Tile::<f64>::from_bytes(3, 2, Layout::RowMajor, &bytes).unwrap();
        assert_eq!(back, tile);
        assert!(Tile::<f64>::from_bytes(2, 2, Layout::RowMajor, &bytes).is_err());
    }

    #[test]
    fn test_conj_trans_view() {
        let mut tile = Tile::from_fn(2, 3, Layout::ColMajor, |i, j| {
            Complex::new(i as f64, j as f64)
        });
        let view = tile.view(Op::ConjTrans);
        assert_eq!(view.rows(), 3);
        assert_eq!(view.cols(), 2);
        assert_eq!(view.get(2, 1), Complex::new(1.0, -2.0));

        let mut m = tile.view_mut(Op::ConjTrans);
        m.set(2, 1, Complex::new(5.0, 5.0));
        assert_eq!(m.get(2, 1), Complex::new(5.0, 5.0));
        assert_eq!(tile.get(1, 2), Complex::new(5.0, -5.0));
    }

    #[test]
    fn test_from_col_major_checks_length() {
        assert!(Tile::from_col_major(2, 2, vec![1.0f64; 3]).is_err());
        let tile = Tile::from_col_major(2, 2, vec![1.0f64, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(tile.get(1, 0), 2.0);
        assert_eq!(tile.get(0, 1), 3.0);
    }
}
