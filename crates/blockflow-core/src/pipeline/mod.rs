//! Pipeline observability infrastructure
//!
//! The factorization pipelines themselves live in the `blockflow-pipeline`
//! crate; this module holds the run context and the event bus they report to.

pub mod context;
pub mod events;

pub use context::PipelineContext;
pub use events::{
    EventBus, EventHandler, LoggingHandler, MetricsHandler, NullEventHandler, PipelineEvent,
    PipelineMetrics,
};
