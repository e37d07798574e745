//! Lookahead-pipelined tiled triangular solve and LU factorization
//!
//! Both routines sweep the block indices of a distributed tiled matrix. For
//! each step they run a panel, update a window of the next `lookahead` blocks
//! at high priority, then update everything beyond the window in one batched
//! call. Fresh tiles are pushed to the ranks that need them as soon as they
//! are final, so communication overlaps with the previous step's trailing work.
//!
//! # Features
//!
//! - **Data-flow scheduling**: tasks declare the tokens they read and write,
//!   see [`graph`]
//! - **Tile broadcast**: remote copies with a consumer count, see [`broadcast`]
//! - **Pivoted LU**: panels factored on one rank, only the diagonal tile and
//!   the pivots travel, see [`getrf()`]
//! - **Accelerator residency**: workspace reserved up front, panel tiles
//!   pinned per step, see [`residency`]
//!
//! # Example
//!
//! ```rust
//! use blockflow_core::{BlockCyclic, Diag, LocalFabric, Options, Shape, Side, TiledMatrix, Uplo};
//! use blockflow_pipeline::trsm;
//! use std::sync::Arc;
//!
//! // 2 x 2 lower triangular system, one tile per element
//! let a_data = [2.0, 1.0, 0.0, 4.0];
//! let mut b_data = [2.0, 9.0];
//! let endpoint = LocalFabric::endpoints(1).remove(0);
//! let dist = Arc::new(BlockCyclic::single());
//! let a = TiledMatrix::from_col_major(2, 2, 1, 1, Shape::General, &a_data, 2, dist.clone(), 0).unwrap();
//! let b = TiledMatrix::from_col_major(2, 1, 1, 1, Shape::General, &b_data, 2, dist, 0).unwrap();
//!
//! let a = a.view().with_uplo(Uplo::Lower);
//! trsm(Side::Left, Diag::NonUnit, 1.0, &a, &b.view(), &endpoint, &Options::default()).unwrap();
//! b.write_local_into(&mut b_data, 2).unwrap();
//! assert_eq!(b_data, [1.0, 2.0]);
//! ```

pub mod broadcast;
pub mod getrf;
pub mod getrs;
pub mod graph;
pub mod lookahead;
pub mod panel;
pub mod pivot;
pub mod report;
pub mod residency;
pub mod trailing;
pub mod trsm;

mod session;

use blockflow_core::{EventBus, LoggingHandler};

// Re-export entry points
pub use getrf::{apply_deferred, getrf, getrf_with_events, plan_getrf};
pub use getrs::{getrs, getrs_with_events};
pub use trsm::{plan_trsm, trsm, trsm_with_events};

// Re-export building blocks
pub use broadcast::{BroadcastDirector, Directive, TileRange};
pub use graph::{Plan, Priority, TaskGraph, TaskKind, TaskSpec, Token};
pub use lookahead::Sweep;
pub use pivot::{PanelPivots, Pivot, Pivots};
pub use report::{LuFactors, LuInfo, RunReport};
pub use residency::ResidencyManager;

/// Event bus used by the entry points without an explicit one
///
/// Forwards every event to the `log` facade at debug level.
pub fn default_events() -> EventBus {
    let events = EventBus::new();
    events.register(LoggingHandler::new(log::Level::Debug));
    events
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        getrf, getrs, trsm, LuFactors, LuInfo, Pivots, RunReport,
    };
}
