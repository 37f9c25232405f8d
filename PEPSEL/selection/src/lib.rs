#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! PEPSEL descriptor selection: greedy forward selection of molecular
//! descriptors, each candidate scored by a nested `(components, C, gamma)`
//! grid search over repeated k-fold cross-validation, plus the final
//! classifier-gated regression cascade built from the recorded subsets.

/// Error type shared by every stage.
#[path = "../error.rs"]
pub mod error;

/// Training and scoring tables.
#[path = "../dataset.rs"]
pub mod dataset;

/// Repeated (stratified) k-fold partitioning.
#[path = "../splitter.rs"]
pub mod splitter;

/// Fold metrics and their optimisation direction.
#[path = "../metrics.rs"]
pub mod metrics;

/// Scaling, projection and kernel models.
#[path = "../model/main.rs"]
pub mod model;

/// Hyperparameter grid search.
#[path = "../grid.rs"]
pub mod grid;

/// Forward selection driver.
#[path = "../selector.rs"]
pub mod selector;

/// Trace and feature-subset artifacts.
#[path = "../store.rs"]
pub mod store;

/// Final pipelines, cascade prediction and cascade cross-validation.
#[path = "../inference.rs"]
pub mod inference;

/// TOML run configuration.
#[path = "../config.rs"]
pub mod config;

/// Structured logging helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use config::{PredictConfig, SelectionConfig};
pub use dataset::{Dataset, DescriptorTable, ScoringTable, TableSchema, TargetTransform};
pub use error::{Result, SelectionError};
pub use grid::{GridOutcome, GridSearch, HyperparameterDomain, ScoredCombination};
pub use inference::{
    cascade_cross_validate, write_predictions, CascadePlan, CascadePredictor, CascadeReport, FittedPipeline,
    OutputColumns, PredictionRow, StageSpec,
};
pub use metrics::{Direction, Metric};
pub use model::svm::SolverConfig;
pub use model::trainer::{KernelTrainer, ModelFamily, ModelTrainer, Predictor};
pub use model::{Hyperparameters, ProjectedModel};
pub use selector::{CandidateScore, ForwardSelector, SelectionSession, SelectionState, SelectorConfig, TraceEntry};
pub use splitter::{CrossValidator, FoldPartition, RepeatedFolds, SplitConfig};
pub use store::{persisted_score, read_features, SelectionStore, StoredSelection, TraceLine};
pub use telemetry::{SelectionTelemetry, SelectionTelemetryBuilder};
