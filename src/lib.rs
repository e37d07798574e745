//! Lookahead-pipelined tiled factorization and triangular solve
//!
//! Facade over the workspace crates:
//!
//! - [`blockflow_core`]: tiles, distributed tiled matrices, views, tile kernels,
//!   transport, execution engines and pipeline events
//! - [`blockflow_pipeline`]: the `trsm`, `getrf` and `getrs` pipelines and their
//!   task scheduler
//!
//! ```rust
//! use blockflow::prelude::*;
//! use std::sync::Arc;
//!
//! let n = 6;
//! let a_data: Vec<f64> = (0..n * n)
//!     .map(|idx| if idx % (n + 1) == 0 { 4.0 } else { 1.0 / (1 + idx) as f64 })
//!     .collect();
//! let mut b_data = vec![1.0; n];
//!
//! let endpoint = LocalFabric::endpoints(1).remove(0);
//! let dist: Arc<dyn Distribution> = Arc::new(BlockCyclic::single());
//! let a = TiledMatrix::from_col_major(n, n, 2, 2, Shape::General, &a_data, n, dist.clone(), 0)?;
//! let b = TiledMatrix::from_col_major(n, 1, 2, 2, Shape::General, &b_data, n, dist, 0)?;
//!
//! let options = Options::default();
//! let factors = getrf(&a.view(), &endpoint, &options)?;
//! getrs(&a.view(), &factors, &b.view(), &endpoint, &options)?;
//! b.write_local_into(&mut b_data, n)?;
//! assert!(b_data.iter().all(|x| x.is_finite()));
//! # Ok::<(), blockflow::blockflow_core::Error>(())
//! ```

pub use blockflow_core;
pub use blockflow_pipeline;

/// Everything needed to build matrices and run the pipelines
pub mod prelude {
    pub use blockflow_core::prelude::*;
    pub use blockflow_core::LocalEndpoint;
    pub use blockflow_pipeline::prelude::*;
}
