//! Event-based pipeline notification system
//!
//! Pipelines publish [`PipelineEvent`]s as they go, so logging, metrics and
//! test probes can observe a run without being wired into the scheduler.

use super::context::PipelineContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Pipeline event that can be emitted during execution
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A routine started on one rank
    RunStarted {
        trace_id: Uuid,
        routine: &'static str,
        rank: usize,
        timestamp: Instant,
    },

    /// A routine finished on one rank
    RunCompleted {
        trace_id: Uuid,
        routine: &'static str,
        rank: usize,
        duration: Duration,
        tasks: usize,
    },

    /// A routine failed on one rank
    RunFailed {
        trace_id: Uuid,
        routine: &'static str,
        rank: usize,
        error: String,
    },

    /// The diagonal owner factored panel `step`
    PanelFactored {
        trace_id: Uuid,
        step: usize,
        zero_pivot: Option<usize>,
    },

    /// Pivot records of `step` reached this rank
    PivotsBroadcast {
        trace_id: Uuid,
        step: usize,
        count: usize,
    },

    /// Tiles sent by this rank during `step`
    TilesBroadcast {
        trace_id: Uuid,
        step: usize,
        tiles: usize,
        bytes: usize,
    },

    /// Row interchanges applied to local tiles
    RowsSwapped {
        trace_id: Uuid,
        step: usize,
        rows: usize,
        deferred: bool,
    },

    /// Device holds released after `step`
    DeviceCleanup {
        trace_id: Uuid,
        step: usize,
        released: usize,
    },
}

/// Trait for handling pipeline events
pub trait EventHandler: Send + Sync {
    /// Handle a pipeline event
    fn handle_event(&self, event: &PipelineEvent, context: &PipelineContext);

    /// Check if this handler is interested in a particular event type
    fn is_interested(&self, event: &PipelineEvent) -> bool {
        let _ = event;
        true
    }

    /// Get the name of this handler for debugging
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Event bus for distributing events to multiple handlers
///
/// Clones share handlers and the enabled flag.
pub struct EventBus {
    handlers: Arc<Mutex<Vec<Box<dyn EventHandler>>>>,
    enabled: Arc<AtomicBool>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Register an event handler
    pub fn register<H>(&self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.lock().push(Box::new(handler));
    }

    /// Emit an event to all registered handlers
    pub fn emit(&self, event: PipelineEvent, context: &PipelineContext) {
        self.publish(&event, context);
    }

    /// Emit a borrowed event
    pub fn publish(&self, event: &PipelineEvent, context: &PipelineContext) {
        if !self.is_enabled() {
            return;
        }
        let handlers = self.handlers.lock();
        for handler in handlers.iter() {
            if handler.is_interested(event) {
                handler.handle_event(event, context);
            }
        }
    }

    /// Enable or disable event emission
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Check if the event bus is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Get the number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            enabled: Arc::clone(&self.enabled),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Forwards events to the `log` facade
pub struct LoggingHandler {
    level: log::Level,
}

impl LoggingHandler {
    pub fn new(level: log::Level) -> Self {
        Self { level }
    }
}

impl EventHandler for LoggingHandler {
    fn handle_event(&self, event: &PipelineEvent, context: &PipelineContext) {
        match event {
            PipelineEvent::RunStarted {
                trace_id,
                routine,
                rank,
                ..
            } => {
                log::log!(self.level, "{routine} started on rank {rank} ({trace_id})");
            }
            PipelineEvent::RunCompleted {
                trace_id,
                routine,
                rank,
                duration,
                tasks,
            } => {
                log::log!(
                    self.level,
                    "{routine} completed on rank {rank}: {tasks} tasks in {duration:?} ({trace_id})"
                );
            }
            PipelineEvent::RunFailed {
                trace_id,
                routine,
                rank,
                error,
            } => {
                log::error!("{routine} failed on rank {rank}: {error} (trace: {trace_id})");
            }
            PipelineEvent::PanelFactored {
                step,
                zero_pivot: Some(index),
                ..
            } => {
                log::warn!("panel {step} has an exactly zero pivot at row {index}");
            }
            _ => {
                log::trace!("[{context}] {event:?}");
            }
        }
    }
}

/// Metrics collection handler
///
/// Clones share one set of counters, so a clone can be registered while the
/// original is kept for [`MetricsHandler::snapshot`].
#[derive(Clone, Default)]
pub struct MetricsHandler {
    metrics: Arc<Mutex<PipelineMetrics>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineMetrics {
    pub runs_started: usize,
    pub runs_completed: usize,
    pub panels: usize,
    pub zero_pivots: usize,
    pub tiles_broadcast: usize,
    pub bytes_broadcast: usize,
    pub rows_swapped: usize,
    pub holds_released: usize,
    pub errors: HashMap<String, usize>,
}

impl MetricsHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> PipelineMetrics {
        self.metrics.lock().clone()
    }
}

impl EventHandler for MetricsHandler {
    fn handle_event(&self, event: &PipelineEvent, _context: &PipelineContext) {
        let mut metrics = self.metrics.lock();
        match event {
            PipelineEvent::RunStarted { .. } => metrics.runs_started += 1,
            PipelineEvent::RunCompleted { .. } => metrics.runs_completed += 1,
            PipelineEvent::RunFailed { routine, .. } => {
                *metrics.errors.entry(routine.to_string()).or_insert(0) += 1;
            }
            PipelineEvent::PanelFactored { zero_pivot, .. } => {
                metrics.panels += 1;
                if zero_pivot.is_some() {
                    metrics.zero_pivots += 1;
                }
            }
            PipelineEvent::TilesBroadcast { tiles, bytes, .. } => {
                metrics.tiles_broadcast += tiles;
                metrics.bytes_broadcast += bytes;
            }
            PipelineEvent::RowsSwapped { rows, .. } => metrics.rows_swapped += rows,
            PipelineEvent::DeviceCleanup { released, .. } => metrics.holds_released += released,
            _ => {}
        }
    }
}

/// Null event handler that does nothing
#[derive(Default, Clone)]
pub struct NullEventHandler;

impl EventHandler for NullEventHandler {
    fn handle_event(&self, _event: &PipelineEvent, _context: &PipelineContext) {}

    fn is_interested(&self, _event: &PipelineEvent) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus() {
        let bus = EventBus::new();
        bus.register(LoggingHandler::new(log::Level::Debug));
        bus.register(NullEventHandler);
        assert_eq!(bus.handler_count(), 2);

        let context = PipelineContext::new();
        bus.emit(
            PipelineEvent::RunStarted {
                trace_id: context.trace_id,
                routine: "trsm",
                rank: 0,
                timestamp: Instant::now(),
            },
            &context,
        );
    }

    #[test]
    fn test_metrics_handler() {
        let metrics = MetricsHandler::new();
        let bus = EventBus::new();
        bus.register(metrics.clone());
        let context = PipelineContext::new();
        let trace_id = context.trace_id;

        bus.emit(
            PipelineEvent::PanelFactored {
                trace_id,
                step: 0,
                zero_pivot: Some(3),
            },
            &context,
        );
        bus.emit(
            PipelineEvent::TilesBroadcast {
                trace_id,
                step: 0,
                tiles: 4,
                bytes: 512,
            },
            &context,
        );
        bus.emit(
            PipelineEvent::RunFailed {
                trace_id,
                routine: "getrf",
                rank: 1,
                error: "boom".to_string(),
            },
            &context,
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.panels, 1);
        assert_eq!(snapshot.zero_pivots, 1);
        assert_eq!(snapshot.tiles_broadcast, 4);
        assert_eq!(snapshot.bytes_broadcast, 512);
        assert_eq!(snapshot.errors.get("getrf"), Some(&1));
    }

    #[test]
    fn test_disabled_bus_drops_events() {
        let metrics = MetricsHandler::new();
        let bus = EventBus::new();
        bus.register(metrics.clone());
        bus.clone().set_enabled(false);
        assert!(!bus.is_enabled());

        let context = PipelineContext::new();
        bus.emit(
            PipelineEvent::DeviceCleanup {
                trace_id: context.trace_id,
                step: 2,
                released: 3,
            },
            &context,
        );
        assert_eq!(metrics.snapshot().holds_released, 0);
    }
}
