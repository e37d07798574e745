//! Run options for the factorization and solve pipelines
//!
//! Options are plain serde structs so they can be loaded from JSON documents
//! next to the rest of an application's configuration. Absent fields take
//! their defaults; explicitly invalid values are rejected by [`Options::validate`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Where tile updates execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// One host task per output tile
    #[default]
    HostTask,
    /// Nested data-parallel loop over output tiles
    HostNest,
    /// A single batched host call per update
    HostBatch,
    /// Batched calls on the accelerator that owns each output tile
    Devices,
}

impl Target {
    /// Whether updates run on accelerator arenas
    pub fn is_device(&self) -> bool {
        matches!(self, Target::Devices)
    }

    /// Short name used in logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            Target::HostTask => "host_task",
            Target::HostNest => "host_nest",
            Target::HostBatch => "host_batch",
            Target::Devices => "devices",
        }
    }
}

/// Options shared by `trsm`, `getrf` and `getrs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Number of block-columns updated eagerly after each panel
    pub lookahead: usize,
    /// Column blocking inside the panel factorization
    pub inner_blocking: usize,
    /// Upper bound on threads working on one panel
    pub max_panel_threads: usize,
    /// Execution target for tile updates
    pub target: Target,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lookahead: 1,
            inner_blocking: 16,
            max_panel_threads: default_panel_threads(),
            target: Target::HostTask,
        }
    }
}

fn default_panel_threads() -> usize {
    (num_cpus::get() / 2).max(1)
}

impl Options {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lookahead depth
    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = lookahead;
        self
    }

    /// Set the panel inner blocking
    pub fn with_inner_blocking(mut self, inner_blocking: usize) -> Self {
        self.inner_blocking = inner_blocking;
        self
    }

    /// Set the panel thread limit
    pub fn with_max_panel_threads(mut self, threads: usize) -> Self {
        self.max_panel_threads = threads;
        self
    }

    /// Set the execution target
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Reject values no pipeline can run with
    pub fn validate(&self) -> Result<()> {
        if self.inner_blocking == 0 {
            return Err(Error::InvalidParameter(
                "inner_blocking must be positive".to_string(),
            ));
        }
        if self.max_panel_threads == 0 {
            return Err(Error::InvalidParameter(
                "max_panel_threads must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON options document
    pub fn from_json(document: &str) -> Result<Self> {
        let options: Options = serde_json::from_str(document)?;
        options.validate()?;
        Ok(options)
    }

    /// Serialize to a JSON document
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
