//! Accelerator residency across one pipeline run
//!
//! Before the first task runs, every accelerator reserves room for the local
//! tiles it may receive plus the batch workspace of the updates; a shortfall
//! fails the run before any tile has been touched. During the run panel
//! tiles are pinned with [`DeviceHold`]s taken per step and dropped when the
//! step's consumers have all been issued. At the end every local tile is
//! brought back to the host.

use blockflow_core::{
    DeviceHold, DeviceSet, Error, MatrixView, Reservation, Result, Scalar, Target,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Tiles of device workspace needed for `local` resident tiles
///
/// Each batched call needs three pointer arrays per tile, rounded up to
/// whole tiles, plus one staging tile per in-flight step.
pub fn workspace_tiles(local: usize, lookahead: usize, tile_bytes: usize) -> usize {
    let arrays = local * 3 * std::mem::size_of::<usize>();
    lookahead + 1 + arrays.div_ceil(tile_bytes.max(1))
}

/// Per-run accelerator bookkeeping for one rank
#[derive(Debug)]
pub struct ResidencyManager<T: Scalar> {
    matrices: Vec<MatrixView<T>>,
    reservations: Mutex<Vec<Reservation>>,
    holds: Mutex<HashMap<usize, Vec<DeviceHold>>>,
    enabled: bool,
}

impl<T: Scalar> ResidencyManager<T> {
    /// Manager that never touches accelerators
    pub fn disabled() -> Self {
        Self {
            matrices: Vec::new(),
            reservations: Mutex::new(Vec::new()),
            holds: Mutex::new(HashMap::new()),
            enabled: false,
        }
    }

    /// Reserve accelerator space for `matrices`
    ///
    /// Host targets get a disabled manager. On the device target every
    /// matrix must have accelerators attached; matrices sharing a storage
    /// are counted once and matrices sharing a [`DeviceSet`] reserve from it
    /// together.
    pub fn prepare(target: Target, matrices: &[&MatrixView<T>], lookahead: usize) -> Result<Self> {
        if !target.is_device() {
            return Ok(Self::disabled());
        }
        let mut distinct: Vec<MatrixView<T>> = Vec::new();
        for view in matrices {
            if !distinct.iter().any(|d| d.matrix().same_storage(view.matrix())) {
                distinct.push((*view).clone());
            }
        }

        let mut groups: Vec<(DeviceSet, Vec<usize>, usize)> = Vec::new();
        for view in &distinct {
            let matrix = view.matrix();
            let devices = matrix.devices().ok_or_else(|| {
                Error::InvalidParameter("device target requires attached accelerators".to_string())
            })?;
            let mut per_device = vec![0usize; devices.len()];
            for (i, j) in matrix.local_tiles() {
                let device = matrix.tile_device(i, j);
                let slot = per_device.get_mut(device).ok_or_else(|| {
                    Error::InvalidParameter(format!(
                        "tile ({i}, {j}) maps to device {device}, {} attached",
                        devices.len()
                    ))
                })?;
                *slot += 1;
            }
            let tile_bytes = matrix.mb() * matrix.nb() * std::mem::size_of::<T>();
            match groups.iter_mut().find(|(set, _, _)| set.same_as(&devices)) {
                Some((_, counts, bytes)) => {
                    for (total, count) in counts.iter_mut().zip(per_device) {
                        *total += count;
                    }
                    *bytes = (*bytes).min(tile_bytes);
                }
                None => groups.push((devices, per_device, tile_bytes)),
            }
        }

        let mut reservations = Vec::with_capacity(groups.len());
        for (devices, counts, tile_bytes) in &groups {
            let request: Vec<usize> = counts
                .iter()
                .map(|&local| local + workspace_tiles(local, lookahead, *tile_bytes))
                .collect();
            // earlier reservations are returned on drop if this one fails
            reservations.push(devices.reserve(&request)?);
        }
        tracing::debug!(groups = groups.len(), "accelerator workspace reserved");
        Ok(Self {
            matrices: distinct,
            reservations: Mutex::new(reservations),
            holds: Mutex::new(HashMap::new()),
            enabled: true,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Pin the local tiles `tiles` of `view` for step `step`
    pub fn hold(
        &self,
        step: usize,
        view: &MatrixView<T>,
        tiles: impl IntoIterator<Item = (usize, usize)>,
    ) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let mut taken = Vec::new();
        for (i, j) in tiles {
            if view.is_local_existing(i, j) {
                taken.push(view.hold(i, j)?);
            }
        }
        let count = taken.len();
        self.holds.lock().entry(step).or_default().extend(taken);
        Ok(count)
    }

    /// Drop the holds of step `step`; returns how many were released
    pub fn release(&self, step: usize) -> usize {
        self.holds
            .lock()
            .remove(&step)
            .map(|holds| holds.len())
            .unwrap_or(0)
    }

    /// Holds still outstanding
    pub fn outstanding(&self) -> usize {
        self.holds.lock().values().map(Vec::len).sum()
    }

    /// Release everything and bring local tiles home; returns the tiles moved
    ///
    /// Safe to call on error paths: all holds and reservations are dropped
    /// even if moving a tile fails.
    pub fn finish(&self) -> Result<usize> {
        self.holds.lock().clear();
        let mut moved = 0;
        let mut first_error = None;
        for view in &self.matrices {
            match view.matrix().release_all_to_host() {
                Ok(count) => moved += count,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        self.reservations.lock().clear();
        if self.enabled {
            tracing::debug!(moved, "accelerator residency released");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(moved),
        }
    }
}
