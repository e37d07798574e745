//! Rank-k updates of the tiles beyond the panel
//!
//! A [`Contribution`] describes `dest(i, j) = beta * dest(i, j) - left(i, k) * right(k, j)`
//! over a set of block-rows and block-columns. The lookahead engine applies
//! it to one window entry at a time; the trailing engine applies it to
//! everything past the window in a single batched call per target.

use blockflow_core::{
    kernels, ExecutionEngine, MatrixView, ParallelEngine, Placement, Result, Scalar, Target,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// One destination tile of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateItem {
    pub i: usize,
    pub j: usize,
    /// Both operand tiles exist; otherwise the tile is only scaled
    pub has_operands: bool,
}

/// Contribution of step `k` to a block of the destination
#[derive(Debug)]
pub struct Contribution<'v, T: Scalar> {
    pub dest: &'v MatrixView<T>,
    pub left: &'v MatrixView<T>,
    pub right: &'v MatrixView<T>,
    pub k: usize,
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub beta: T,
}

impl<'v, T: Scalar> Contribution<'v, T> {
    /// Local destination tiles this rank has to touch
    pub fn items(&self) -> Vec<UpdateItem> {
        let mut items = Vec::new();
        for &j in &self.cols {
            for &i in &self.rows {
                if !self.dest.is_local_existing(i, j) {
                    continue;
                }
                let has_operands =
                    self.left.tile_exists(i, self.k) && self.right.tile_exists(self.k, j);
                if has_operands || self.beta != T::one() {
                    items.push(UpdateItem { i, j, has_operands });
                }
            }
        }
        items
    }

    fn placement(&self, target: Target, item: &UpdateItem) -> Placement {
        if target.is_device() {
            self.dest.device_placement(item.i, item.j)
        } else {
            Placement::Host
        }
    }

    /// Update a single destination tile
    pub fn apply(&self, item: &UpdateItem, placement: Placement) -> Result<()> {
        let (i, j) = (item.i, item.j);
        if !item.has_operands {
            let beta = self.beta;
            return self
                .dest
                .update(i, j, placement, |c| kernels::scale(beta, c));
        }
        // operands are snapshotted before the destination is locked
        let l = self.left.read(i, self.k)?;
        let r = self.right.read(self.k, j)?;
        let (lop, rop) = (self.left.op(), self.right.op());
        self.dest.update(i, j, placement, |c| {
            kernels::gemm(-T::one(), l.view(lop), r.view(rop), self.beta, c)
        })?
    }

    /// Finish this consumer round of every received operand copy
    pub fn tick_consumed(&self) -> Result<()> {
        for &i in &self.rows {
            if self.left.tile_exists(i, self.k)
                && self.cols.iter().any(|&j| self.dest.is_local_existing(i, j))
            {
                self.left.tick(i, self.k)?;
            }
        }
        for &j in &self.cols {
            if self.right.tile_exists(self.k, j)
                && self.rows.iter().any(|&i| self.dest.is_local_existing(i, j))
            {
                self.right.tick(self.k, j)?;
            }
        }
        Ok(())
    }

    /// Apply the whole contribution on `target`; returns the tiles updated
    pub fn apply_updates(&self, target: Target, engine: &ParallelEngine) -> Result<usize> {
        let items = self.items();
        match target {
            Target::HostTask => {
                let errors = Mutex::new(Vec::new());
                rayon::scope(|scope| {
                    for item in &items {
                        let errors = &errors;
                        scope.spawn(move |_| {
                            if let Err(err) = self.apply(item, Placement::Host) {
                                errors.lock().push(err);
                            }
                        });
                    }
                });
                if let Some(err) = errors.into_inner().into_iter().next() {
                    return Err(err);
                }
            }
            Target::HostNest => {
                engine
                    .execute_batch(items.len(), |n| self.apply(&items[n], Placement::Host))
                    .into_iter()
                    .collect::<Result<Vec<_>>>()?;
            }
            Target::HostBatch => {
                for item in &items {
                    self.apply(item, Placement::Host)?;
                }
            }
            Target::Devices => {
                let mut per_device: BTreeMap<usize, Vec<UpdateItem>> = BTreeMap::new();
                for item in &items {
                    per_device
                        .entry(self.dest.tile_device(item.i, item.j))
                        .or_default()
                        .push(*item);
                }
                let batches: Vec<Vec<UpdateItem>> = per_device.into_values().collect();
                engine
                    .execute_batch(batches.len(), |n| {
                        batches[n]
                            .iter()
                            .try_for_each(|item| self.apply(item, self.placement(target, item)))
                    })
                    .into_iter()
                    .collect::<Result<Vec<_>>>()?;
            }
        }
        self.tick_consumed()?;
        Ok(items.len())
    }
}

/// Apply `contribution` past the lookahead window as one logical operation
pub fn trailing_update<T: Scalar>(
    contribution: &Contribution<'_, T>,
    target: Target,
    engine: &ParallelEngine,
) -> Result<usize> {
    let updated = contribution.apply_updates(target, engine)?;
    tracing::trace!(
        step = contribution.k,
        updated,
        target = target.name(),
        "trailing update"
    );
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use blockflow_core::{BlockCyclic, DeviceSet, Distribution, Residency, Shape, TiledMatrix};
    use std::sync::Arc;

    fn dense(n: usize, nb: usize, f: impl Fn(usize, usize) -> f64) -> TiledMatrix<f64> {
        let data: Vec<f64> = (0..n * n).map(|idx| f(idx % n, idx / n)).collect();
        let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::single().with_devices(2));
        TiledMatrix::from_col_major(n, n, nb, nb, Shape::General, &data, n, dist, 0).unwrap()
    }

    fn engine() -> ParallelEngine {
        ParallelEngine::with_num_threads(2, "trailing-test").unwrap()
    }

    #[test]
    fn test_targets_agree() {
        let mut results = Vec::new();
        for target in [Target::HostTask, Target::HostNest, Target::HostBatch, Target::Devices] {
            let a = dense(6, 2, |i, j| (i + 2 * j) as f64);
            a.attach_devices(DeviceSet::new(2, 64));
            let _reservation = a.devices().unwrap().reserve(&[9, 9]).unwrap();
            let v = a.view();
            let contribution = Contribution {
                dest: &v,
                left: &v,
                right: &v,
                k: 0,
                rows: vec![1, 2],
                cols: vec![1, 2],
                beta: 2.0,
            };
            assert_eq!(contribution.apply_updates(target, &engine()).unwrap(), 4);
            a.release_all_to_host().unwrap();
            let mut out = vec![0.0; 36];
            a.write_local_into(&mut out, 6).unwrap();
            results.push(out);
        }
        for other in &results[1..] {
            for (x, y) in results[0].iter().zip(other) {
                assert_relative_eq!(x, y, epsilon = 1e-12);
            }
        }
        // element (4, 4) sits at the corner of tile (2, 2)
        let expected = 2.0 * 12.0 - (4.0 * 8.0 + 6.0 * 9.0);
        assert_relative_eq!(results[0][4 + 4 * 6], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_operand_only_scales() {
        let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::single());
        let band =
            TiledMatrix::<f64>::with_shape(8, 8, 2, 2, Shape::Band { kl: 2, ku: 2 }, dist, 0).unwrap();
        for (i, j) in band.local_tiles() {
            band.update(i, j, Placement::Host, |t| {
                for r in 0..t.rows() {
                    for c in 0..t.cols() {
                        t.set(r, c, 1.0);
                    }
                }
            })
            .unwrap();
        }
        let v = band.view();
        // left(3, 0) lies outside the band
        let contribution = Contribution {
            dest: &v,
            left: &v,
            right: &v,
            k: 0,
            rows: vec![3],
            cols: vec![2, 3],
            beta: 3.0,
        };
        let items = contribution.items();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| !item.has_operands));
        contribution
            .apply_updates(Target::HostBatch, &engine())
            .unwrap();
        assert_eq!(band.read(3, 3).unwrap().get(1, 1), 3.0);
        assert_eq!(band.residency(3, 3), Some(Residency::ValidHost));

        let unscaled = Contribution { beta: 1.0, ..contribution };
        assert!(unscaled.items().is_empty());
    }
}
