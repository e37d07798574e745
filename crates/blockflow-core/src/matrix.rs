//! Distributed tiled matrix storage
//!
//! Every rank holds a [`TiledMatrix`] handle onto its own tile storage: the
//! tiles it owns according to the [`Distribution`], plus remote copies that
//! arrived through a broadcast. Remote copies carry a life count and are
//! reclaimed once every consumer round has ticked them.
//!
//! Each local tile also carries a residency state. A tile buffer lives either
//! on the host (column-major) or on one accelerator (row-major); moving it
//! charges or refunds the accelerator arena.

use crate::device::{DeviceHold, DeviceSet};
use crate::distribution::Distribution;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::numeric::Scalar;
use crate::tile::Tile;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Which tiles of the matrix exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Every tile exists
    General,
    /// Only tiles touching the band `-kl <= col - row <= ku` exist
    ///
    /// Out-of-band entries of partially covered tiles must be zero; this is
    /// not checked.
    Band { kl: usize, ku: usize },
}

/// Physical location of a tile buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    Device(usize),
}

impl Location {
    /// Storage order used at this location
    pub fn layout(&self) -> Layout {
        match self {
            Location::Host => Layout::ColMajor,
            Location::Device(_) => Layout::RowMajor,
        }
    }
}

/// Residency state of a local tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Allocated but never written
    Unbound,
    ValidHost,
    ValidDevice(usize),
    /// A writer at the given location is mutating the tile
    Stale { writer: Location },
}

/// Where a tile update should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Host,
    Device(usize),
    /// Wherever the tile currently lives
    InPlace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote { life: usize },
}

#[derive(Debug)]
struct SlotMeta {
    residency: Residency,
    origin: Origin,
}

impl SlotMeta {
    fn location(&self) -> Location {
        match self.residency {
            Residency::ValidDevice(d) => Location::Device(d),
            Residency::Stale { writer } => writer,
            Residency::Unbound | Residency::ValidHost => Location::Host,
        }
    }
}

/// Storage cell of one tile
#[derive(Debug)]
pub struct TileSlot<T> {
    tile: Mutex<Tile<T>>,
    meta: Mutex<SlotMeta>,
    holds: Arc<AtomicUsize>,
}

impl<T: Scalar> TileSlot<T> {
    fn new(tile: Tile<T>, residency: Residency, origin: Origin) -> Self {
        Self {
            tile: Mutex::new(tile),
            meta: Mutex::new(SlotMeta { residency, origin }),
            holds: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[derive(Debug)]
struct Storage<T> {
    id: Uuid,
    m: usize,
    n: usize,
    mb: usize,
    nb: usize,
    mt: usize,
    nt: usize,
    shape: Shape,
    rank: usize,
    dist: Arc<dyn Distribution>,
    slots: DashMap<(usize, usize), Arc<TileSlot<T>>>,
    devices: RwLock<Option<DeviceSet>>,
}

/// Per-rank handle onto distributed tile storage
///
/// Cloning the handle shares the storage.
#[derive(Debug)]
pub struct TiledMatrix<T> {
    inner: Arc<Storage<T>>,
}

impl<T> Clone for TiledMatrix<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Scalar> TiledMatrix<T> {
    /// General `m x n` matrix in `mb x nb` tiles; local tiles start zeroed
    pub fn new(
        m: usize,
        n: usize,
        mb: usize,
        nb: usize,
        dist: Arc<dyn Distribution>,
        rank: usize,
    ) -> Result<Self> {
        Self::with_shape(m, n, mb, nb, Shape::General, dist, rank)
    }

    /// Matrix with an explicit tile shape
    pub fn with_shape(
        m: usize,
        n: usize,
        mb: usize,
        nb: usize,
        shape: Shape,
        dist: Arc<dyn Distribution>,
        rank: usize,
    ) -> Result<Self> {
        if mb == 0 || nb == 0 {
            return Err(Error::InvalidParameter(format!(
                "tile size must be positive, got {mb}x{nb}"
            )));
        }
        if rank >= dist.num_ranks() {
            return Err(Error::InvalidParameter(format!(
                "rank {rank} outside a grid of {} ranks",
                dist.num_ranks()
            )));
        }
        let storage = Storage {
            id: Uuid::new_v4(),
            m,
            n,
            mb,
            nb,
            mt: m.div_ceil(mb),
            nt: n.div_ceil(nb),
            shape,
            rank,
            dist,
            slots: DashMap::new(),
            devices: RwLock::new(None),
        };
        let matrix = Self {
            inner: Arc::new(storage),
        };
        for j in 0..matrix.nt() {
            for i in 0..matrix.mt() {
                if matrix.is_local(i, j) && matrix.tile_exists(i, j) {
                    let tile = Tile::zeros(matrix.tile_rows(i), matrix.tile_cols(j), Layout::ColMajor);
                    matrix.inner.slots.insert(
                        (i, j),
                        Arc::new(TileSlot::new(tile, Residency::Unbound, Origin::Local)),
                    );
                }
            }
        }
        Ok(matrix)
    }

    /// Matrix whose local tiles are copied from a column-major array
    #[allow(clippy::too_many_arguments)]
    pub fn from_col_major(
        m: usize,
        n: usize,
        mb: usize,
        nb: usize,
        shape: Shape,
        data: &[T],
        ld: usize,
        dist: Arc<dyn Distribution>,
        rank: usize,
    ) -> Result<Self> {
        let matrix = Self::with_shape(m, n, mb, nb, shape, dist, rank)?;
        matrix.fill_from_col_major(data, ld)?;
        Ok(matrix)
    }

    /// Overwrite every local tile from a column-major array
    pub fn fill_from_col_major(&self, data: &[T], ld: usize) -> Result<()> {
        self.check_dense(data.len(), ld)?;
        for (i, j) in self.local_tiles() {
            let (r0, c0) = (i * self.inner.mb, j * self.inner.nb);
            let tile = Tile::from_fn(self.tile_rows(i), self.tile_cols(j), Layout::ColMajor, |r, c| {
                data[(r0 + r) + (c0 + c) * ld]
            });
            self.set_tile(i, j, tile)?;
        }
        Ok(())
    }

    /// Copy every local tile into a column-major array
    pub fn write_local_into(&self, out: &mut [T], ld: usize) -> Result<()> {
        self.check_dense(out.len(), ld)?;
        for (i, j) in self.local_tiles() {
            let tile = self.read(i, j)?;
            let (r0, c0) = (i * self.inner.mb, j * self.inner.nb);
            for c in 0..tile.cols() {
                for r in 0..tile.rows() {
                    out[(r0 + r) + (c0 + c) * ld] = tile.get(r, c);
                }
            }
        }
        Ok(())
    }

    fn check_dense(&self, len: usize, ld: usize) -> Result<()> {
        if ld < self.inner.m {
            return Err(Error::size_mismatch(self.inner.m, ld, "leading dimension"));
        }
        let needed = if self.inner.n == 0 {
            0
        } else {
            ld * (self.inner.n - 1) + self.inner.m
        };
        if len < needed {
            return Err(Error::size_mismatch(needed, len, "dense array length"));
        }
        Ok(())
    }

    /// Storage identity shared by all clones of this handle
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn same_storage(&self, other: &TiledMatrix<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn m(&self) -> usize {
        self.inner.m
    }

    pub fn n(&self) -> usize {
        self.inner.n
    }

    pub fn mb(&self) -> usize {
        self.inner.mb
    }

    pub fn nb(&self) -> usize {
        self.inner.nb
    }

    /// Number of block-rows
    pub fn mt(&self) -> usize {
        self.inner.mt
    }

    /// Number of block-columns
    pub fn nt(&self) -> usize {
        self.inner.nt
    }

    pub fn shape(&self) -> Shape {
        self.inner.shape
    }

    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    pub fn distribution(&self) -> &Arc<dyn Distribution> {
        &self.inner.dist
    }

    pub fn tile_rows(&self, i: usize) -> usize {
        self.inner.mb.min(self.inner.m - i * self.inner.mb)
    }

    pub fn tile_cols(&self, j: usize) -> usize {
        self.inner.nb.min(self.inner.n - j * self.inner.nb)
    }

    pub fn tile_rank(&self, i: usize, j: usize) -> usize {
        self.inner.dist.tile_rank(i, j)
    }

    pub fn tile_device(&self, i: usize, j: usize) -> usize {
        self.inner.dist.tile_device(i, j)
    }

    pub fn is_local(&self, i: usize, j: usize) -> bool {
        self.tile_rank(i, j) == self.inner.rank
    }

    /// Whether tile `(i, j)` is stored at all
    pub fn tile_exists(&self, i: usize, j: usize) -> bool {
        if i >= self.inner.mt || j >= self.inner.nt {
            return false;
        }
        match self.inner.shape {
            Shape::General => true,
            Shape::Band { kl, ku } => {
                let row_first = (i * self.inner.mb) as i64;
                let row_last = row_first + self.tile_rows(i) as i64 - 1;
                let col_first = (j * self.inner.nb) as i64;
                let col_last = col_first + self.tile_cols(j) as i64 - 1;
                col_first - row_last <= ku as i64 && row_first - col_last <= kl as i64
            }
        }
    }

    /// Local existing tiles in column-major tile order
    pub fn local_tiles(&self) -> Vec<(usize, usize)> {
        let mut tiles: Vec<_> = self
            .inner
            .slots
            .iter()
            .filter(|entry| entry.value().meta.lock().origin == Origin::Local)
            .map(|entry| *entry.key())
            .collect();
        tiles.sort_by_key(|&(i, j)| (j, i));
        tiles
    }

    fn slot(&self, i: usize, j: usize) -> Option<Arc<TileSlot<T>>> {
        self.inner.slots.get(&(i, j)).map(|entry| Arc::clone(entry.value()))
    }

    fn local_slot(&self, i: usize, j: usize) -> Result<Arc<TileSlot<T>>> {
        if !self.is_local(i, j) {
            return Err(self.unavailable(i, j));
        }
        self.slot(i, j).ok_or_else(|| self.unavailable(i, j))
    }

    fn unavailable(&self, i: usize, j: usize) -> Error {
        Error::TileUnavailable {
            row: i,
            col: j,
            rank: self.inner.rank,
        }
    }

    /// Snapshot of a local tile or received copy
    pub fn read(&self, i: usize, j: usize) -> Result<Tile<T>> {
        let slot = self.slot(i, j).ok_or_else(|| self.unavailable(i, j))?;
        let tile = slot.tile.lock().clone();
        Ok(tile)
    }

    /// Replace a local tile; it becomes valid on the host
    pub fn set_tile(&self, i: usize, j: usize, mut tile: Tile<T>) -> Result<()> {
        let slot = self.local_slot(i, j)?;
        if tile.rows() != self.tile_rows(i) || tile.cols() != self.tile_cols(j) {
            return Err(Error::size_mismatch(
                self.tile_rows(i) * self.tile_cols(j),
                tile.rows() * tile.cols(),
                "tile replacement",
            ));
        }
        let mut meta = slot.meta.lock();
        self.relocate(&slot, &mut meta, (i, j), Location::Host)?;
        tile.convert(Layout::ColMajor);
        *slot.tile.lock() = tile;
        meta.residency = Residency::ValidHost;
        Ok(())
    }

    /// Mutate a local tile at the requested placement
    ///
    /// The tile is first moved to the placement's location, marked stale
    /// while `f` runs, and valid at that location afterwards.
    pub fn update<R>(
        &self,
        i: usize,
        j: usize,
        placement: Placement,
        f: impl FnOnce(&mut Tile<T>) -> R,
    ) -> Result<R> {
        let slot = self.local_slot(i, j)?;
        let target = {
            let mut meta = slot.meta.lock();
            if let Residency::Stale { writer } = meta.residency {
                return Err(Error::Execution(format!(
                    "tile ({i}, {j}) already has a writer at {writer:?}"
                )));
            }
            let target = match placement {
                Placement::Host => Location::Host,
                Placement::Device(d) => Location::Device(d),
                Placement::InPlace => meta.location(),
            };
            self.relocate(&slot, &mut meta, (i, j), target)?;
            meta.residency = Residency::Stale { writer: target };
            target
        };
        let result = {
            let mut tile = slot.tile.lock();
            f(&mut tile)
        };
        slot.meta.lock().residency = match target {
            Location::Host => Residency::ValidHost,
            Location::Device(d) => Residency::ValidDevice(d),
        };
        Ok(result)
    }

    fn relocate(
        &self,
        slot: &TileSlot<T>,
        meta: &mut SlotMeta,
        (i, j): (usize, usize),
        target: Location,
    ) -> Result<()> {
        let from = meta.location();
        if from == target {
            return Ok(());
        }
        if let Location::Device(d) = from {
            if slot.holds.load(Ordering::Acquire) > 0 {
                return Err(Error::Execution(format!(
                    "tile ({i}, {j}) is held on device {d}"
                )));
            }
        }
        let devices = self.inner.devices.read();
        if let Location::Device(d) = target {
            let devices = devices.as_ref().ok_or_else(|| {
                Error::InvalidParameter("matrix has no accelerators attached".to_string())
            })?;
            devices.arena(d)?.acquire()?;
        }
        slot.tile.lock().convert(target.layout());
        if let (Location::Device(d), Some(devices)) = (from, devices.as_ref()) {
            devices.arena(d)?.release();
        }
        meta.residency = match target {
            Location::Host => Residency::ValidHost,
            Location::Device(d) => Residency::ValidDevice(d),
        };
        tracing::trace!(i, j, ?from, ?target, "tile moved");
        Ok(())
    }

    /// Attach the accelerators of this rank
    pub fn attach_devices(&self, devices: DeviceSet) {
        *self.inner.devices.write() = Some(devices);
    }

    pub fn devices(&self) -> Option<DeviceSet> {
        self.inner.devices.read().clone()
    }

    /// Residency of a local tile
    pub fn residency(&self, i: usize, j: usize) -> Option<Residency> {
        let slot = self.slot(i, j)?;
        let meta = slot.meta.lock();
        match meta.origin {
            Origin::Local => Some(meta.residency),
            Origin::Remote { .. } => None,
        }
    }

    /// Move a local tile to `device` and pin it there
    pub fn hold(&self, i: usize, j: usize, device: usize) -> Result<DeviceHold> {
        let slot = self.local_slot(i, j)?;
        let mut meta = slot.meta.lock();
        self.relocate(&slot, &mut meta, (i, j), Location::Device(device))?;
        Ok(DeviceHold::new(Arc::clone(&slot.holds), device, (i, j)))
    }

    /// Outstanding holds on a tile
    pub fn holds(&self, i: usize, j: usize) -> usize {
        self.slot(i, j)
            .map(|slot| slot.holds.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Bring every local tile back to the host; returns how many moved
    pub fn release_all_to_host(&self) -> Result<usize> {
        let mut moved = 0;
        for (i, j) in self.local_tiles() {
            let slot = self.local_slot(i, j)?;
            let mut meta = slot.meta.lock();
            if meta.location() != Location::Host {
                moved += 1;
            }
            self.relocate(&slot, &mut meta, (i, j), Location::Host)?;
            meta.residency = Residency::ValidHost;
        }
        Ok(moved)
    }

    /// Store a received copy of a tile this rank does not own
    pub fn install_remote(&self, i: usize, j: usize, tile: Tile<T>, life: usize) -> Result<()> {
        if self.is_local(i, j) {
            return Err(Error::Broadcast(format!(
                "rank {} owns tile ({i}, {j}) and cannot receive a copy",
                self.inner.rank
            )));
        }
        if life == 0 {
            return Err(Error::Broadcast(format!(
                "copy of tile ({i}, {j}) delivered with no consumers"
            )));
        }
        match self.inner.slots.entry((i, j)) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Broadcast(format!(
                "duplicate delivery of tile ({i}, {j}) to rank {}",
                self.inner.rank
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(TileSlot::new(
                    tile,
                    Residency::ValidHost,
                    Origin::Remote { life },
                )));
                Ok(())
            }
        }
    }

    /// Finish one consumer round of a tile
    ///
    /// Local tiles are unaffected. A remote copy is reclaimed when its life
    /// reaches zero; ticking a reclaimed copy is an error.
    pub fn tick(&self, i: usize, j: usize) -> Result<()> {
        if self.is_local(i, j) {
            return Ok(());
        }
        let exhausted = || {
            Error::Broadcast(format!(
                "tick on exhausted copy of tile ({i}, {j}) on rank {}",
                self.inner.rank
            ))
        };
        let slot = self.slot(i, j).ok_or_else(exhausted)?;
        let remaining = {
            let mut meta = slot.meta.lock();
            match &mut meta.origin {
                Origin::Remote { life } if *life > 0 => {
                    *life -= 1;
                    *life
                }
                _ => return Err(exhausted()),
            }
        };
        if remaining == 0 {
            self.inner.slots.remove(&(i, j));
        }
        Ok(())
    }

    /// Remaining consumer rounds of a received copy
    pub fn remote_life(&self, i: usize, j: usize) -> Option<usize> {
        let slot = self.slot(i, j)?;
        let meta = slot.meta.lock();
        match meta.origin {
            Origin::Remote { life } => Some(life),
            Origin::Local => None,
        }
    }

    /// Number of received copies still alive
    pub fn remote_count(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|entry| matches!(entry.value().meta.lock().origin, Origin::Remote { .. }))
            .count()
    }
}
