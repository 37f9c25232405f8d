//! Model pipeline: min-max scaling, principal component projection, and an
//! RBF support vector machine, always fitted on training rows only.

/// Principal component projection.
pub mod projection;
/// Min-max scaling.
pub mod scaler;
/// Support vector solvers.
pub mod svm;
/// Trainer and predictor seams.
pub mod trainer;

use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use projection::Projection;
use scaler::MinMaxScaler;
use svm::KernelParams;
use trainer::{ModelTrainer, Predictor};

use crate::error::{Result, SelectionError};

/// One point of the hyperparameter grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Principal components retained.
    pub components: usize,
    /// Penalty parameter.
    pub c: f64,
    /// RBF width.
    pub gamma: f64,
}

impl Hyperparameters {
    /// Kernel portion of the combination.
    #[must_use]
    pub const fn kernel(&self) -> KernelParams {
        KernelParams {
            c: self.c,
            gamma: self.gamma,
        }
    }
}

impl fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k={} C={} gamma={}", self.components, self.c, self.gamma)
    }
}

/// Scaler, projection and predictor fitted together on one training set.
#[derive(Debug)]
pub struct ProjectedModel {
    scaler: MinMaxScaler,
    projection: Projection,
    predictor: Box<dyn Predictor>,
    params: Hyperparameters,
}

impl ProjectedModel {
    /// Fits every stage on `x`/`y`.
    pub fn fit(
        trainer: &dyn ModelTrainer,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        params: Hyperparameters,
    ) -> Result<Self> {
        let scaler = MinMaxScaler::fit(x)?;
        let scaled = scaler.transform(x)?;
        let projection = Projection::fit(scaled.view(), params.components)?;
        let projected = projection.transform(scaled.view())?;
        let predictor = trainer.fit(projected.view(), y, params.kernel())?;
        Ok(Self {
            scaler,
            projection,
            predictor,
            params,
        })
    }

    /// Predictions for raw descriptor rows.
    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        let prepared = self.prepare(x)?;
        finite(self.predictor.predict(prepared.view()))
    }

    /// Decision values for raw descriptor rows.
    pub fn decision_function(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
        let prepared = self.prepare(x)?;
        finite(self.predictor.decision_function(prepared.view()))
    }

    /// Whether the underlying solver converged.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.predictor.converged()
    }

    /// Combination this model was fitted with.
    #[must_use]
    pub const fn params(&self) -> Hyperparameters {
        self.params
    }

    /// Variance retained by the projection.
    #[must_use]
    pub fn explained_variance(&self) -> &Array1<f64> {
        self.projection.explained_variance()
    }

    fn prepare(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let scaled = self.scaler.transform(x)?;
        self.projection.transform(scaled.view())
    }
}

fn finite(values: Array1<f64>) -> Result<Array1<f64>> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(values)
    } else {
        Err(SelectionError::Numeric("model produced a non-finite output".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::svm::SolverConfig;
    use crate::model::trainer::{KernelTrainer, ModelFamily};
    use ndarray::array;

    #[test]
    fn projected_regressor_learns_a_line() {
        let x = Array2::from_shape_fn((20, 2), |(row, col)| {
            if col == 0 {
                f64::from(u32::try_from(row).unwrap()) / 2.0
            } else {
                f64::from(u32::try_from(row % 3).unwrap())
            }
        });
        let y = x.column(0).mapv(|v| 3.0 * v + 1.0);
        let trainer = KernelTrainer::new(ModelFamily::Regressor, SolverConfig::default());
        let params = Hyperparameters {
            components: 2,
            c: 100.0,
            gamma: 1.0,
        };
        let model = ProjectedModel::fit(&trainer, x.view(), y.view(), params).unwrap();
        let predicted = model.predict(x.view()).unwrap();
        let rmse = crate::metrics::root_mean_squared_error(y.view(), predicted.view()).unwrap();
        assert!(rmse < 2.0, "rmse {rmse}");
        assert_eq!(model.params(), params);
    }

    #[test]
    fn invalid_component_count_is_skippable() {
        let trainer = KernelTrainer::new(ModelFamily::Regressor, SolverConfig::default());
        let x = array![[0.0], [1.0], [2.0]];
        let y = array![0.0, 1.0, 2.0];
        let params = Hyperparameters {
            components: 2,
            c: 1.0,
            gamma: 1.0,
        };
        let err = ProjectedModel::fit(&trainer, x.view(), y.view(), params).unwrap_err();
        assert!(err.is_skippable());
    }
}
