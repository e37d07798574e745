//! Error types for tiled factorization pipelines
//!
//! Provides a unified error type for all blockflow crates.

use thiserror::Error;

/// Core error type for pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid parameter provided to a function
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration document could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tile grids of the operands are not compatible
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A tile was requested that this process neither owns nor received
    #[error("Tile ({row}, {col}) is not available on rank {rank}")]
    TileUnavailable { row: usize, col: usize, rank: usize },

    /// Broadcast protocol violation (duplicate delivery, exhausted life, tag collision)
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Message transport failed; the pipeline cannot make progress
    #[error("Transport failure in {operation} at block {stage}: {reason}")]
    Transport {
        operation: &'static str,
        stage: usize,
        reason: String,
    },

    /// Accelerator memory could not be reserved
    #[error("Resource exhausted on device {device}: requested {requested} tiles, {available} available")]
    ResourceExhausted {
        device: usize,
        requested: usize,
        available: usize,
    },

    /// Factor has an exactly zero pivot and cannot be used for a solve
    #[error("Singular matrix: U({index}, {index}) is exactly zero")]
    SingularMatrix { index: usize },

    /// Threading or scheduling error
    #[error("Execution error: {0}")]
    Execution(String),

    /// Other errors
    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

// Helper functions for common error patterns

impl Error {
    /// Create an error for a tile grid mismatch
    pub fn size_mismatch(expected: usize, actual: usize, context: &str) -> Self {
        Self::DimensionMismatch {
            context: context.to_string(),
            expected,
            actual,
        }
    }

    /// Create a transport error tagged with operation and block index
    pub fn transport(operation: &'static str, stage: usize, reason: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            stage,
            reason: reason.into(),
        }
    }

    /// Whether the error leaves other processes unable to continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ResourceExhausted { .. } | Self::Broadcast(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
