//! Nested hyperparameter search: for one descriptor subset, every
//! `(components, C, gamma)` combination is cross-validated and the best
//! fold-averaged score is kept.

use ndarray::{Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::dataset::Dataset;
use crate::error::{Result, SelectionError};
use crate::metrics::{self, Metric};
use crate::model::trainer::ModelTrainer;
use crate::model::{Hyperparameters, ProjectedModel};
use crate::splitter::{CrossValidator, RepeatedFolds};
use crate::telemetry::{log, SelectionTelemetry};

/// Penalty values searched by default.
pub const DEFAULT_C_VALUES: [f64; 16] = [
    0.001, 0.01, 0.1, 1.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 100.0, 1000.0,
];

/// Kernel widths searched by default.
pub const DEFAULT_GAMMA_VALUES: [f64; 15] = [
    0.001, 0.01, 0.1, 1.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 100.0,
];

/// Value sets the grid is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperparameterDomain {
    /// Penalty values, searched in the given order.
    pub c_values: Vec<f64>,
    /// Kernel widths, searched in the given order.
    pub gamma_values: Vec<f64>,
    /// Optional cap on the component count; the subset width always caps it.
    pub max_components: Option<usize>,
}

impl Default for HyperparameterDomain {
    fn default() -> Self {
        Self {
            c_values: DEFAULT_C_VALUES.to_vec(),
            gamma_values: DEFAULT_GAMMA_VALUES.to_vec(),
            max_components: None,
        }
    }
}

impl HyperparameterDomain {
    /// Rejects empty value sets and a zero component cap.
    pub fn validate(&self) -> Result<()> {
        if self.c_values.is_empty() || self.gamma_values.is_empty() {
            return Err(SelectionError::Configuration(
                "grid needs at least one C and one gamma value".into(),
            ));
        }
        if self.max_components == Some(0) {
            return Err(SelectionError::Configuration(
                "max_components must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Cross product for a subset of `width` descriptors, `components`
    /// outermost, then `C`, then `gamma`.
    #[must_use]
    pub fn combinations(&self, width: usize) -> Vec<Hyperparameters> {
        let max_k = self.max_components.map_or(width, |cap| cap.min(width));
        let mut grid = Vec::with_capacity(max_k * self.c_values.len() * self.gamma_values.len());
        for components in 1..=max_k {
            for &c in &self.c_values {
                for &gamma in &self.gamma_values {
                    grid.push(Hyperparameters {
                        components,
                        c,
                        gamma,
                    });
                }
            }
        }
        grid
    }
}

/// Best combination and its fold-averaged score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredCombination {
    /// Winning combination.
    pub params: Hyperparameters,
    /// Mean fold score.
    pub score: f64,
}

/// Summary of one grid evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOutcome {
    /// Best usable combination; `None` when every combination was skipped.
    pub best: Option<ScoredCombination>,
    /// Combinations scored on every fold.
    pub evaluated: usize,
    /// Combinations dropped for an invalid setting or degenerate partition.
    pub skipped: usize,
    /// Fits that stopped at the solver iteration cap.
    pub unconverged: usize,
}

enum CombinationResult {
    Scored { score: f64, unconverged: usize },
    Skipped(SelectionError),
}

/// Grid search over one dataset with fixed partitions.
///
/// Partitions are planned once at construction, so every subset and every
/// combination is scored on identical folds and repeated evaluations agree.
#[derive(Debug)]
pub struct GridSearch<'a> {
    dataset: &'a Dataset,
    trainer: &'a dyn ModelTrainer,
    domain: &'a HyperparameterDomain,
    folds: RepeatedFolds,
    parallel: bool,
    telemetry: Option<&'a SelectionTelemetry>,
}

impl<'a> GridSearch<'a> {
    /// Plans partitions for `dataset`, stratified when the trainer's family
    /// asks for it.
    pub fn new(
        dataset: &'a Dataset,
        trainer: &'a dyn ModelTrainer,
        domain: &'a HyperparameterDomain,
        validator: &CrossValidator,
    ) -> Result<Self> {
        domain.validate()?;
        let folds = validator.partitions(dataset.target(), trainer.family().stratified())?;
        Ok(Self {
            dataset,
            trainer,
            domain,
            folds,
            parallel: false,
            telemetry: None,
        })
    }

    /// Evaluates combinations on the rayon pool.
    #[must_use]
    pub const fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub const fn telemetry(mut self, telemetry: Option<&'a SelectionTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Metric used to score folds.
    #[must_use]
    pub fn metric(&self) -> Metric {
        self.trainer.family().metric()
    }

    /// Dataset being searched.
    #[must_use]
    pub const fn dataset(&self) -> &'a Dataset {
        self.dataset
    }

    /// Scores every combination for `subset` and keeps the best.
    ///
    /// Ties keep the earliest combination in enumeration order, whether or
    /// not evaluation ran in parallel.
    pub fn evaluate(&self, subset: &[String]) -> Result<GridOutcome> {
        if subset.is_empty() {
            return Err(SelectionError::Configuration("cannot search an empty subset".into()));
        }
        let x = self.dataset.columns(subset)?;
        let grid = self.domain.combinations(subset.len());
        let results: Vec<Result<CombinationResult>> = if self.parallel {
            grid.par_iter().map(|params| self.score(&x, *params)).collect()
        } else {
            grid.iter().map(|params| self.score(&x, *params)).collect()
        };

        let direction = self.metric().direction();
        let mut outcome = GridOutcome {
            best: None,
            evaluated: 0,
            skipped: 0,
            unconverged: 0,
        };
        for (params, result) in grid.iter().zip(results) {
            match result? {
                CombinationResult::Scored { score, unconverged } => {
                    outcome.evaluated += 1;
                    outcome.unconverged += unconverged;
                    let improves = outcome
                        .best
                        .map_or(true, |best| direction.improves(score, best.score));
                    if improves {
                        outcome.best = Some(ScoredCombination {
                            params: *params,
                            score,
                        });
                    }
                }
                CombinationResult::Skipped(reason) => {
                    outcome.skipped += 1;
                    log(
                        self.telemetry,
                        LogLevel::Debug,
                        "grid.combination_skipped",
                        json!({
                            "subset": subset,
                            "components": params.components,
                            "c": params.c,
                            "gamma": params.gamma,
                            "reason": reason.to_string(),
                        }),
                    );
                }
            }
        }
        Ok(outcome)
    }

    fn score(&self, x: &Array2<f64>, params: Hyperparameters) -> Result<CombinationResult> {
        let metric = self.metric();
        let target = self.dataset.target();
        let mut fold_scores = Vec::with_capacity(self.folds.len());
        let mut unconverged = 0;
        for partition in &self.folds {
            let x_train = x.select(Axis(0), &partition.train);
            let y_train = target.select(Axis(0), &partition.train);
            let model = match ProjectedModel::fit(self.trainer, x_train.view(), y_train.view(), params) {
                Ok(model) => model,
                Err(err) if err.is_skippable() => return Ok(CombinationResult::Skipped(err)),
                Err(err) => return Err(err),
            };
            if !model.converged() {
                unconverged += 1;
            }
            let x_test = x.select(Axis(0), &partition.test);
            let y_test = target.select(Axis(0), &partition.test);
            let predicted = model.predict(x_test.view())?;
            fold_scores.push(metric.score(y_test.view(), predicted.view())?);
        }
        let score = metrics::mean(&fold_scores)
            .filter(|score| score.is_finite())
            .ok_or_else(|| SelectionError::Numeric(format!("no finite fold scores for {params}")))?;
        Ok(CombinationResult::Scored { score, unconverged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::svm::SolverConfig;
    use crate::model::trainer::{KernelTrainer, ModelFamily};
    use crate::splitter::SplitConfig;

    fn small_domain() -> HyperparameterDomain {
        HyperparameterDomain {
            c_values: vec![1.0, 10.0, 100.0],
            gamma_values: vec![0.5, 5.0],
            max_components: None,
        }
    }

    fn validator() -> CrossValidator {
        CrossValidator::new(SplitConfig {
            folds: 5,
            repeats: 2,
            seed: 7,
        })
        .unwrap()
    }

    #[test]
    fn enumeration_is_component_major() {
        let grid = small_domain().combinations(2);
        assert_eq!(grid.len(), 12);
        assert_eq!(grid[0].components, 1);
        assert_eq!((grid[0].c, grid[0].gamma), (1.0, 0.5));
        assert_eq!((grid[1].c, grid[1].gamma), (1.0, 5.0));
        assert_eq!(grid[6].components, 2);
    }

    #[test]
    fn component_cap_limits_the_grid() {
        let domain = HyperparameterDomain {
            max_components: Some(1),
            ..small_domain()
        };
        assert!(domain.combinations(4).iter().all(|p| p.components == 1));
    }

    #[test]
    fn repeated_evaluation_is_identical() {
        let dataset = Dataset::synthetic(40, 2, 3);
        let trainer = KernelTrainer::new(ModelFamily::Regressor, SolverConfig::default());
        let domain = small_domain();
        let search = GridSearch::new(&dataset, &trainer, &domain, &validator()).unwrap();
        let subset = vec!["x1".to_string(), "x2".to_string()];
        let first = search.evaluate(&subset).unwrap();
        let second = search.evaluate(&subset).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.evaluated + first.skipped, 12);
        assert!(first.best.is_some());
    }

    #[test]
    fn parallel_matches_sequential() {
        let dataset = Dataset::synthetic(30, 2, 5);
        let trainer = KernelTrainer::new(ModelFamily::Regressor, SolverConfig::default());
        let domain = small_domain();
        let subset = vec!["x2".to_string(), "x1".to_string()];
        let sequential = GridSearch::new(&dataset, &trainer, &domain, &validator())
            .unwrap()
            .evaluate(&subset)
            .unwrap();
        let parallel = GridSearch::new(&dataset, &trainer, &domain, &validator())
            .unwrap()
            .parallel(true)
            .evaluate(&subset)
            .unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn unknown_descriptor_is_fatal() {
        let dataset = Dataset::synthetic(20, 2, 1);
        let trainer = KernelTrainer::new(ModelFamily::Regressor, SolverConfig::default());
        let domain = small_domain();
        let search = GridSearch::new(&dataset, &trainer, &domain, &validator()).unwrap();
        let err = search.evaluate(&["x9".to_string()]).unwrap_err();
        assert!(matches!(err, SelectionError::UnknownDescriptor(_)));
    }

    #[test]
    fn empty_domain_is_rejected() {
        let dataset = Dataset::synthetic(20, 1, 1);
        let trainer = KernelTrainer::new(ModelFamily::Regressor, SolverConfig::default());
        let domain = HyperparameterDomain {
            c_values: Vec::new(),
            ..small_domain()
        };
        let err = GridSearch::new(&dataset, &trainer, &domain, &validator()).unwrap_err();
        assert!(matches!(err, SelectionError::Configuration(_)));
    }

    #[test]
    fn constant_subset_has_no_usable_combination() {
        let rows = 25;
        let mut features = Array2::from_elem((rows, 2), 4.0);
        let mut target = ndarray::Array1::zeros(rows);
        for row in 0..rows {
            let x = f64::from(u32::try_from(row).unwrap());
            features[[row, 1]] = x;
            target[row] = 2.0 * x;
        }
        let dataset = Dataset::new(
            (0..rows).map(|row| format!("p{row}")).collect(),
            vec!["const".into(), "x".into()],
            features,
            target,
        )
        .unwrap();
        let trainer = KernelTrainer::new(ModelFamily::Regressor, SolverConfig::default());
        let domain = small_domain();
        let search = GridSearch::new(&dataset, &trainer, &domain, &validator()).unwrap();

        let constant = search.evaluate(&["const".to_string()]).unwrap();
        assert_eq!(constant.best, None);
        assert_eq!((constant.evaluated, constant.skipped), (0, 6));

        let informative = search.evaluate(&["x".to_string()]).unwrap();
        assert_eq!(informative.evaluated, 6);
        assert!(informative.best.is_some());
    }
}
