//! Error types for expert routing and continual-learning state.
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery Strategy |
//! |----------|----------|-------------------|
//! | Lifecycle | InvalidNumLabels, UnregisteredExpert, InvariantViolation | Fix call order |
//! | Validation | DimensionMismatch, InvalidInput | Fix input data |
//! | Configuration | ConfigError, Unimplemented | Fix configuration |
//! | Infrastructure | TensorError, IoError, CheckpointError, SerializationError | Abort the run |
//!
//! Errors propagate to the caller. A failed training or evaluation step is not
//! retried locally.

use thiserror::Error;

use crate::expert::ExpertId;

/// Errors raised by the expert-of-experts core.
#[derive(Debug, Error)]
pub enum EoeError {
    // === Lifecycle Errors ===
    /// `new_task` called with a label count of zero.
    #[error("Invalid label count for new task: {num_labels}")]
    InvalidNumLabels { num_labels: usize },

    /// Statistics update or query for an expert whose task was never registered.
    #[error("Expert {expert} has no registered task (registered tasks: {registered})")]
    UnregisteredExpert { expert: ExpertId, registered: usize },

    /// Internal bookkeeping invariant broken (e.g. zero observation count).
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    // === Validation Errors ===
    /// Tensor shape does not match what the operation expects.
    #[error("Dimension mismatch in {context}: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Input rejected before any computation.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    // === Configuration Errors ===
    /// Configuration missing, malformed or out of range.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Requested operation has no implementation (e.g. unknown query mode).
    #[error("Unimplemented: {message}")]
    Unimplemented { message: String },

    // === Infrastructure Errors ===
    /// candle tensor operation failed.
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    /// Checkpoint missing a tensor or holding the wrong shape.
    #[error("Checkpoint error: {message}")]
    CheckpointError { message: String },

    /// JSON or TOML (de)serialization failed.
    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    /// File I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for expert-of-experts operations.
pub type EoeResult<T> = Result<T, EoeError>;

impl EoeError {
    /// Shape mismatch helper.
    pub fn dims(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
