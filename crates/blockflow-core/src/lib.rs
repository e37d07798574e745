//! Core types for lookahead-pipelined tiled linear algebra
//!
//! This crate provides everything the factorization pipelines are built on:
//! tiles and their views, the block-cyclic ownership oracle, distributed tile
//! storage with accelerator residency, per-tile kernels, the message
//! transport between ranks, and the execution engines the schedulers run on.
//!
//! # Architecture Overview
//!
//! 1. **Data** - [`Tile`], [`TiledMatrix`], [`MatrixView`] and [`Distribution`]
//! 2. **Compute** - [`kernels`] and the [`ExecutionEngine`]s that run them
//! 3. **Movement** - [`Transport`] between ranks and [`DeviceSet`] arenas within one
//!
//! # Example
//!
//! ```rust
//! use blockflow_core::{BlockCyclic, Shape, TiledMatrix};
//! use std::sync::Arc;
//!
//! let data: Vec<f64> = (0..16).map(|v| v as f64).collect();
//! let a = TiledMatrix::from_col_major(
//!     4, 4, 2, 2, Shape::General, &data, 4, Arc::new(BlockCyclic::single()), 0,
//! ).unwrap();
//! assert_eq!((a.mt(), a.nt()), (2, 2));
//! assert_eq!(a.read(1, 1).unwrap().get(0, 0), 10.0);
//! ```

pub mod config;
pub mod device;
pub mod distribution;
pub mod error;
pub mod execution;
pub mod kernels;
pub mod layout;
pub mod matrix;
pub mod numeric;
pub mod pipeline;
pub mod tile;
pub mod transport;
pub mod view;
pub mod workspace;

// Re-export core types
pub use error::{Error, Result};

pub use config::{Options, Target};
pub use device::{DeviceArena, DeviceHold, DeviceSet, Reservation};
pub use distribution::{BlockCyclic, Distribution};
pub use execution::{
    ExecutionEngine, ExecutionMode, ExecutionStrategy, HierarchicalExecution, ParallelismBudget,
    SequentialEngine, Subordinate,
};
#[cfg(feature = "parallel")]
pub use execution::{budgeted_engines, ParallelEngine};
pub use layout::{Diag, Direction, Layout, Op, Side, Uplo};
pub use matrix::{Location, Placement, Residency, Shape, TiledMatrix};
pub use numeric::Scalar;
pub use tile::{Tile, TileMut, TileRef};
pub use transport::{Channel, LocalEndpoint, LocalFabric, Tag, Transport, TransportStats};
pub use view::MatrixView;
pub use workspace::{PooledBuffer, WorkspacePool};

pub use pipeline::{
    EventBus, EventHandler, LoggingHandler, MetricsHandler, PipelineContext, PipelineEvent,
    PipelineMetrics,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        BlockCyclic, Diag, Distribution, ExecutionEngine, LocalFabric, MatrixView, Options,
        Result, Scalar, Shape, Side, Target, Tile, TiledMatrix, Transport, Uplo,
    };

    pub use crate::error::Error;
}
