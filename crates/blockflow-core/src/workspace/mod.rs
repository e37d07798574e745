//! Reusable buffers for per-panel workspaces
//!
//! The LU panel is gathered into a dense row-major buffer once per
//! block-column. Buffers come from a [`WorkspacePool`] and return to it when
//! the [`PooledBuffer`] guard drops, so a pipeline allocates at most a
//! handful of panel buffers regardless of the number of block-columns.

use crate::numeric::Scalar;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Pool of zeroed buffers for one scalar type
#[derive(Debug)]
pub struct WorkspacePool<T> {
    buffers: Mutex<Vec<Vec<T>>>,
    max_buffers: usize,
}

impl<T: Scalar> WorkspacePool<T> {
    /// Create a pool keeping at most `max_buffers` idle buffers
    pub fn new(max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
        })
    }

    /// Check out a zeroed buffer of exactly `len` elements
    ///
    /// An idle buffer with enough capacity is reused when one exists.
    pub fn checkout(self: &Arc<Self>, len: usize) -> PooledBuffer<T> {
        let reused = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter()
                .position(|buf| buf.capacity() >= len)
                .map(|idx| buffers.swap_remove(idx))
        };
        let mut data = reused.unwrap_or_else(|| Vec::with_capacity(len));
        data.resize(len, T::zero());
        PooledBuffer {
            data,
            pool: Arc::downgrade(self),
        }
    }

    fn checkin(&self, mut buffer: Vec<T>) {
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_buffers {
            buffers.push(buffer);
        }
    }

    /// Idle buffers currently held
    pub fn pool_size(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// Checked-out workspace, returned to its pool on drop
#[derive(Debug)]
pub struct PooledBuffer<T: Scalar> {
    data: Vec<T>,
    pool: Weak<WorkspacePool<T>>,
}

impl<T: Scalar> PooledBuffer<T> {
    /// Buffer not attached to any pool
    pub fn detached(len: usize) -> Self {
        Self {
            data: vec![T::zero(); len],
            pool: Weak::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

impl<T: Scalar> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.checkin(std::mem::take(&mut self.data));
        }
    }
}

impl<T: Scalar> std::ops::Deref for PooledBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T: Scalar> std::ops::DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}
