//! Accelerator memory arenas
//!
//! Accelerators are modelled as memory arenas with a capacity counted in
//! tiles. A pipeline reserves its whole working set up front through a
//! [`Reservation`] and then moves tiles in and out of the reserved space.
//! [`DeviceHold`] pins a tile's accelerator copy until it is dropped.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct ArenaState {
    reserved: usize,
    resident: usize,
    peak_resident: usize,
}

/// One accelerator's memory
#[derive(Debug)]
pub struct DeviceArena {
    id: usize,
    capacity: usize,
    state: Mutex<ArenaState>,
}

impl DeviceArena {
    pub fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            state: Mutex::new(ArenaState::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Capacity in tiles
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tiles not yet promised to a reservation
    pub fn available(&self) -> usize {
        self.capacity - self.state.lock().reserved
    }

    pub fn reserved(&self) -> usize {
        self.state.lock().reserved
    }

    /// Tiles currently resident
    pub fn resident(&self) -> usize {
        self.state.lock().resident
    }

    /// Highest resident count seen
    pub fn peak_resident(&self) -> usize {
        self.state.lock().peak_resident
    }

    fn reserve(&self, tiles: usize) -> Result<()> {
        let mut state = self.state.lock();
        let available = self.capacity - state.reserved;
        if tiles > available {
            return Err(Error::ResourceExhausted {
                device: self.id,
                requested: tiles,
                available,
            });
        }
        state.reserved += tiles;
        Ok(())
    }

    fn unreserve(&self, tiles: usize) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(tiles);
    }

    /// Place one tile in reserved space
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.resident >= state.reserved {
            return Err(Error::ResourceExhausted {
                device: self.id,
                requested: state.resident + 1,
                available: state.reserved,
            });
        }
        state.resident += 1;
        state.peak_resident = state.peak_resident.max(state.resident);
        Ok(())
    }

    /// Free one resident tile
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.resident = state.resident.saturating_sub(1);
    }
}

/// The accelerators attached to one rank
#[derive(Debug, Clone)]
pub struct DeviceSet {
    arenas: Arc<Vec<DeviceArena>>,
}

impl DeviceSet {
    /// `count` accelerators with equal capacity
    pub fn new(count: usize, capacity_tiles: usize) -> Self {
        Self::with_capacities(vec![capacity_tiles; count])
    }

    /// One accelerator per capacity entry
    pub fn with_capacities(capacities: Vec<usize>) -> Self {
        let arenas = capacities
            .into_iter()
            .enumerate()
            .map(|(id, capacity)| DeviceArena::new(id, capacity))
            .collect();
        Self {
            arenas: Arc::new(arenas),
        }
    }

    pub fn len(&self) -> usize {
        self.arenas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    pub fn arena(&self, device: usize) -> Result<&DeviceArena> {
        self.arenas.get(device).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "device {device} out of range ({} attached)",
                self.arenas.len()
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceArena> {
        self.arenas.iter()
    }

    /// Reserve `tiles[d]` on every device `d`, all or nothing
    pub fn reserve(&self, tiles: &[usize]) -> Result<Reservation> {
        if tiles.len() > self.arenas.len() {
            return Err(Error::size_mismatch(
                self.arenas.len(),
                tiles.len(),
                "device reservation",
            ));
        }
        for (arena, &count) in self.arenas.iter().zip(tiles) {
            if let Err(err) = arena.reserve(count) {
                for (prev, &c) in self.arenas.iter().zip(tiles).take(arena.id) {
                    prev.unreserve(c);
                }
                return Err(err);
            }
        }
        tracing::debug!(?tiles, "reserved accelerator workspace");
        Ok(Reservation {
            devices: self.clone(),
            tiles: tiles.to_vec(),
        })
    }

    /// Two handles refer to the same arenas
    pub fn same_as(&self, other: &DeviceSet) -> bool {
        Arc::ptr_eq(&self.arenas, &other.arenas)
    }
}

/// Reserved accelerator space, returned on drop
#[derive(Debug)]
pub struct Reservation {
    devices: DeviceSet,
    tiles: Vec<usize>,
}

impl Reservation {
    pub fn tiles(&self) -> &[usize] {
        &self.tiles
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        for (arena, &count) in self.devices.arenas.iter().zip(&self.tiles) {
            arena.unreserve(count);
        }
    }
}

/// Pins the accelerator copy of one tile
///
/// While any hold exists the tile cannot leave its accelerator.
#[derive(Debug)]
pub struct DeviceHold {
    counter: Arc<AtomicUsize>,
    device: usize,
    tile: (usize, usize),
}

impl DeviceHold {
    pub(crate) fn new(counter: Arc<AtomicUsize>, device: usize, tile: (usize, usize)) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter,
            device,
            tile,
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn tile(&self) -> (usize, usize) {
        self.tile
    }
}

impl Drop for DeviceHold {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
