use std::fmt;

use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use super::svm::{KernelParams, SolverConfig, SvcModel, SvrModel};
use crate::error::Result;
use crate::metrics::Metric;

/// Which kind of kernel model a run trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Binary classifier scored by MCC over stratified folds.
    Classifier,
    /// Regressor scored by RMSE over unstratified folds.
    Regressor,
}

impl ModelFamily {
    /// Fold metric for this family.
    #[must_use]
    pub const fn metric(self) -> Metric {
        match self {
            Self::Classifier => Metric::Mcc,
            Self::Regressor => Metric::Rmse,
        }
    }

    /// Whether folds preserve class proportions.
    #[must_use]
    pub const fn stratified(self) -> bool {
        matches!(self, Self::Classifier)
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classifier => write!(f, "classifier"),
            Self::Regressor => write!(f, "regressor"),
        }
    }
}

/// A fitted model that maps prepared rows to outputs.
pub trait Predictor: fmt::Debug + Send + Sync {
    /// Final predictions: labels for classifiers, values for regressors.
    fn predict(&self, x: ArrayView2<'_, f64>) -> Array1<f64>;

    /// Raw decision values before thresholding.
    fn decision_function(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        self.predict(x)
    }

    /// False when the solver stopped at its iteration cap.
    fn converged(&self) -> bool;
}

impl Predictor for SvcModel {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        Self::predict(self, x)
    }

    fn decision_function(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        Self::decision_function(self, x)
    }

    fn converged(&self) -> bool {
        self.expansion().converged()
    }
}

impl Predictor for SvrModel {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        Self::predict(self, x)
    }

    fn converged(&self) -> bool {
        self.expansion().converged()
    }
}

/// Fits a predictor for one hyperparameter setting.
pub trait ModelTrainer: fmt::Debug + Send + Sync {
    /// Family this trainer produces.
    fn family(&self) -> ModelFamily;

    /// Trains on already prepared rows.
    fn fit(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        params: KernelParams,
    ) -> Result<Box<dyn Predictor>>;
}

/// RBF support vector trainer for either family.
#[derive(Debug, Clone, Copy)]
pub struct KernelTrainer {
    family: ModelFamily,
    solver: SolverConfig,
}

impl KernelTrainer {
    /// Trainer with explicit solver settings.
    #[must_use]
    pub const fn new(family: ModelFamily, solver: SolverConfig) -> Self {
        Self { family, solver }
    }

    /// Solver settings in use.
    #[must_use]
    pub const fn solver(&self) -> &SolverConfig {
        &self.solver
    }
}

impl ModelTrainer for KernelTrainer {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn fit(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        params: KernelParams,
    ) -> Result<Box<dyn Predictor>> {
        Ok(match self.family {
            ModelFamily::Classifier => Box::new(SvcModel::fit(x, y, params, &self.solver)?),
            ModelFamily::Regressor => Box::new(SvrModel::fit(x, y, params, &self.solver)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn family_fixes_metric_and_stratification() {
        assert_eq!(ModelFamily::Classifier.metric(), Metric::Mcc);
        assert!(ModelFamily::Classifier.stratified());
        assert_eq!(ModelFamily::Regressor.metric(), Metric::Rmse);
        assert!(!ModelFamily::Regressor.stratified());
    }

    #[test]
    fn classifier_trainer_returns_labels() {
        let trainer = KernelTrainer::new(ModelFamily::Classifier, SolverConfig::default());
        let x = array![[0.0], [0.1], [0.9], [1.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let model = trainer
            .fit(x.view(), y.view(), KernelParams { c: 10.0, gamma: 5.0 })
            .unwrap();
        assert_eq!(model.predict(x.view()), y);
        assert!(model.decision_function(x.view())[3] > 0.0);
    }
}
