use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the selection engine.
pub type Result<T> = std::result::Result<T, SelectionError>;

/// Errors raised by the selection engine.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// Input table is malformed or violates the dataset invariants.
    #[error("dataset error: {0}")]
    Dataset(String),
    /// A descriptor name is not part of the dataset vocabulary.
    #[error("unknown descriptor `{0}`")]
    UnknownDescriptor(String),
    /// Engine settings are unusable (empty grid, zero round budget, bad prefix).
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Cross-validation cannot be configured for this dataset.
    #[error("split configuration error: {0}")]
    Split(String),
    /// A hyperparameter combination cannot be fitted (e.g. too many components).
    #[error("invalid combination: {0}")]
    InvalidCombination(String),
    /// A training partition carries no usable signal (zero variance, single class).
    #[error("degenerate partition: {0}")]
    Degenerate(String),
    /// Fitting or scoring produced a non-finite value.
    #[error("numeric failure: {0}")]
    Numeric(String),
    /// No candidate produced a usable score in a round.
    #[error("round {round}: no candidate produced a usable score")]
    NoViableCandidate {
        /// Round that could not be committed.
        round: usize,
    },
    /// Persisted artifacts disagree in a way that cannot be repaired.
    #[error("corrupt selection store at {path}: {reason}")]
    CorruptStore {
        /// Artifact that failed validation.
        path: PathBuf,
        /// Human-readable description of the mismatch.
        reason: String,
    },
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Delimited-text parsing failure.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl SelectionError {
    /// Returns true for failures that disqualify a single hyperparameter
    /// combination without aborting the surrounding search.
    #[must_use]
    pub const fn is_skippable(&self) -> bool {
        matches!(self, Self::InvalidCombination(_) | Self::Degenerate(_))
    }
}
