//! Final models built from a recorded selection: single-stage pipelines, the
//! classifier-gated regression cascade, and its cross-validated error.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::dataset::{Dataset, DescriptorTable, ScoringTable, TargetTransform};
use crate::error::{Result, SelectionError};
use crate::metrics;
use crate::model::trainer::{ModelFamily, ModelTrainer};
use crate::model::{Hyperparameters, ProjectedModel};
use crate::splitter::CrossValidator;
use crate::telemetry::{log, SelectionTelemetry};

/// Which descriptors and which fixed combination a stage uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Recorded subset in commit order.
    pub features: Vec<String>,
    /// Length of the prefix of `features` the stage uses.
    pub top_k: usize,
    /// Fixed hyperparameters.
    pub params: Hyperparameters,
}

impl StageSpec {
    /// The first `top_k` recorded descriptors.
    pub fn prefix(&self) -> Result<&[String]> {
        if self.top_k == 0 || self.top_k > self.features.len() {
            return Err(SelectionError::Configuration(format!(
                "top_k {} outside 1..={} recorded features",
                self.top_k,
                self.features.len()
            )));
        }
        Ok(&self.features[..self.top_k])
    }
}

/// Scaler, projection and kernel model fitted on a whole training table.
#[derive(Debug)]
pub struct FittedPipeline {
    features: Vec<String>,
    model: ProjectedModel,
}

impl FittedPipeline {
    /// Fits the stage on every row of `dataset`.
    pub fn fit(dataset: &Dataset, trainer: &dyn ModelTrainer, spec: &StageSpec) -> Result<Self> {
        let features = spec.prefix()?.to_vec();
        let x = dataset.columns(&features)?;
        let model = ProjectedModel::fit(trainer, x.view(), dataset.target(), spec.params)?;
        Ok(Self { features, model })
    }

    /// Descriptors the pipeline reads.
    #[must_use]
    pub fn features(&self) -> &[String] {
        &self.features
    }

    /// Whether the solver converged.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.model.converged()
    }

    /// Predictions for every row of `table`.
    pub fn predict(&self, table: &dyn DescriptorTable) -> Result<Array1<f64>> {
        let x = table.descriptor_columns(&self.features)?;
        self.model.predict(x.view())
    }
}

/// One output row of a prediction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    /// Sample identifier.
    pub id: String,
    /// Passthrough label copied from the scoring table.
    pub passthrough: String,
    /// Predicted value.
    pub value: f64,
}

/// Header names of the prediction table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputColumns {
    /// Identifier header.
    pub id: String,
    /// Passthrough header.
    pub passthrough: String,
    /// Prediction header.
    pub value: String,
}

impl Default for OutputColumns {
    fn default() -> Self {
        Self {
            id: "Names".into(),
            passthrough: "Decision Fn".into(),
            value: "Predicted Value".into(),
        }
    }
}

/// Regressor optionally gated by a binary classifier.
///
/// Without a gate every row is passed to the regressor.
#[derive(Debug)]
pub struct CascadePredictor {
    gate: Option<FittedPipeline>,
    regressor: FittedPipeline,
}

impl CascadePredictor {
    /// Assembles a cascade from fitted stages.
    #[must_use]
    pub const fn new(gate: Option<FittedPipeline>, regressor: FittedPipeline) -> Self {
        Self { gate, regressor }
    }

    /// Rows of `table` the gate admits (all rows without a gate).
    pub fn admitted(&self, table: &dyn DescriptorTable) -> Result<Vec<usize>> {
        let rows = table.row_ids().len();
        match &self.gate {
            Some(gate) => Ok(positives(gate.predict(table)?.view())),
            None => Ok((0..rows).collect()),
        }
    }

    /// Predicts the admitted rows of a scoring table, in table order.
    pub fn predict(
        &self,
        table: &ScoringTable,
        telemetry: Option<&SelectionTelemetry>,
    ) -> Result<Vec<PredictionRow>> {
        let admitted = self.admitted(table)?;
        let values = self.regressor.predict(table)?;
        log(
            telemetry,
            LogLevel::Info,
            "inference.cascade_predicted",
            json!({
                "rows": table.len(),
                "admitted": admitted.len(),
                "gated": self.gate.is_some(),
            }),
        );
        Ok(admitted
            .into_iter()
            .map(|idx| PredictionRow {
                id: table.ids()[idx].clone(),
                passthrough: table.passthrough()[idx].clone(),
                value: values[idx],
            })
            .collect())
    }
}

/// Writes predictions as a comma-separated table with a header row.
pub fn write_predictions(path: impl AsRef<Path>, rows: &[PredictionRow], columns: &OutputColumns) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([&columns.id, &columns.passthrough, &columns.value])?;
    for row in rows {
        let value = row.value.to_string();
        writer.write_record([row.id.as_str(), row.passthrough.as_str(), value.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Cascade stages and the threshold that defines the positive class.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadePlan {
    /// Gate stage, trained on binarized targets.
    pub classifier: StageSpec,
    /// Regression stage, trained on positive rows.
    pub regressor: StageSpec,
    /// Raw target values at or below this are positive.
    pub threshold: f64,
}

/// RMSE of one cascade fold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CascadeFold {
    /// Zero-based repeat.
    pub repeat: usize,
    /// Zero-based fold.
    pub fold: usize,
    /// Test rows the gate admitted.
    pub admitted: usize,
    /// RMSE over admitted rows against raw targets.
    pub rmse: f64,
}

/// Cross-validated cascade error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeReport {
    /// Scored folds in partition order.
    pub folds: Vec<CascadeFold>,
    /// Folds with no admitted test rows or an unfittable stage.
    pub skipped: usize,
    /// Mean RMSE over scored folds.
    pub mean_rmse: Option<f64>,
}

/// Repeated stratified cross-validation of the classifier-gated regressor.
///
/// Per fold the gate is fitted on the training rows, the regressor on the
/// training rows whose raw target is positive, and RMSE is measured on the
/// test rows the gate admits. Each fold RMSE is appended to `results` when
/// given.
pub fn cascade_cross_validate(
    dataset: &Dataset,
    classifier: &dyn ModelTrainer,
    regressor: &dyn ModelTrainer,
    plan: &CascadePlan,
    validator: &CrossValidator,
    results: Option<&Path>,
    telemetry: Option<&SelectionTelemetry>,
) -> Result<CascadeReport> {
    if classifier.family() != ModelFamily::Classifier || regressor.family() != ModelFamily::Regressor {
        return Err(SelectionError::Configuration(
            "cascade needs a classifier gate and a regressor".into(),
        ));
    }
    let labeled = dataset
        .clone()
        .with_target(TargetTransform::Binarize { threshold: plan.threshold })?;
    let folds = validator.stratified(labeled.target())?;
    let mut sink = match results {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            Some(OpenOptions::new().create(true).append(true).open(path)?)
        }
        None => None,
    };

    let mut report = CascadeReport {
        folds: Vec::with_capacity(folds.len()),
        skipped: 0,
        mean_rmse: None,
    };
    for partition in &folds {
        let positive_train: Vec<usize> = partition
            .train
            .iter()
            .copied()
            .filter(|&idx| labeled.target()[idx] > 0.5)
            .collect();
        let stages = FittedPipeline::fit(&labeled.rows(&partition.train), classifier, &plan.classifier)
            .and_then(|gate| {
                let reg = FittedPipeline::fit(&dataset.rows(&positive_train), regressor, &plan.regressor)?;
                Ok(CascadePredictor::new(Some(gate), reg))
            });
        let cascade = match stages {
            Ok(cascade) => cascade,
            Err(err) if err.is_skippable() => {
                report.skipped += 1;
                log(
                    telemetry,
                    LogLevel::Warn,
                    "inference.cascade_fold_skipped",
                    json!({ "repeat": partition.repeat, "fold": partition.fold, "reason": err.to_string() }),
                );
                continue;
            }
            Err(err) => return Err(err),
        };

        let test = dataset.rows(&partition.test);
        let admitted = cascade.admitted(&test)?;
        if admitted.is_empty() {
            report.skipped += 1;
            log(
                telemetry,
                LogLevel::Warn,
                "inference.cascade_fold_skipped",
                json!({ "repeat": partition.repeat, "fold": partition.fold, "reason": "no admitted rows" }),
            );
            continue;
        }
        let scored = test.rows(&admitted);
        let predicted = cascade.regressor.predict(&scored)?;
        let rmse = metrics::root_mean_squared_error(scored.target(), predicted.view())?;
        if let Some(file) = sink.as_mut() {
            writeln!(file, "{rmse}")?;
        }
        log(
            telemetry,
            LogLevel::Debug,
            "inference.cascade_fold_scored",
            json!({ "repeat": partition.repeat, "fold": partition.fold, "admitted": admitted.len(), "rmse": rmse }),
        );
        report.folds.push(CascadeFold {
            repeat: partition.repeat,
            fold: partition.fold,
            admitted: admitted.len(),
            rmse,
        });
    }
    if let Some(file) = sink.as_mut() {
        file.sync_all()?;
    }
    let rmses: Vec<f64> = report.folds.iter().map(|fold| fold.rmse).collect();
    report.mean_rmse = metrics::mean(&rmses);
    log(
        telemetry,
        LogLevel::Info,
        "inference.cascade_cv_finished",
        json!({ "scored": report.folds.len(), "skipped": report.skipped, "mean_rmse": report.mean_rmse }),
    );
    Ok(report)
}

fn positives(labels: ArrayView1<'_, f64>) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter(|(_, &label)| label > 0.5)
        .map(|(idx, _)| idx)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::svm::SolverConfig;
    use crate::model::trainer::KernelTrainer;
    use crate::splitter::SplitConfig;
    use ndarray::{Array1, Array2};
    use tempfile::tempdir;

    /// Rows with `activity <= 64` are "active"; `potency` tracks their value.
    fn activity_table() -> Dataset {
        let rows = 40;
        let mut features = Array2::zeros((rows, 2));
        let mut target = Array1::zeros(rows);
        for row in 0..rows {
            let step = f64::from(u32::try_from(row).unwrap());
            let active = row % 2 == 0;
            features[[row, 0]] = if active { 0.0 } else { 10.0 } + step / 40.0;
            features[[row, 1]] = step;
            target[row] = if active { 4.0 + step } else { 200.0 + step };
        }
        Dataset::new(
            (0..rows).map(|row| format!("pep{row}")).collect(),
            vec!["gate".into(), "potency".into()],
            features,
            target,
        )
        .unwrap()
    }

    fn stage(features: &[&str], top_k: usize, c: f64, gamma: f64) -> StageSpec {
        StageSpec {
            features: features.iter().map(|name| (*name).to_string()).collect(),
            top_k,
            params: Hyperparameters {
                components: 1,
                c,
                gamma,
            },
        }
    }

    #[test]
    fn prefix_must_fit_the_recorded_subset() {
        let spec = stage(&["a", "b"], 3, 1.0, 1.0);
        assert!(matches!(spec.prefix().unwrap_err(), SelectionError::Configuration(_)));
        assert_eq!(stage(&["a", "b"], 1, 1.0, 1.0).prefix().unwrap(), ["a".to_string()]);
    }

    #[test]
    fn gate_limits_rows_passed_to_regressor() {
        let dataset = activity_table();
        let gate_trainer = KernelTrainer::new(ModelFamily::Classifier, SolverConfig::default());
        let reg_trainer = KernelTrainer::new(ModelFamily::Regressor, SolverConfig::default());
        let labeled = dataset
            .clone()
            .with_target(TargetTransform::Binarize { threshold: 64.0 })
            .unwrap();
        let active = dataset
            .clone()
            .with_target(TargetTransform::AtMost { threshold: 64.0 })
            .unwrap();
        let gate = FittedPipeline::fit(&labeled, &gate_trainer, &stage(&["gate"], 1, 10.0, 5.0)).unwrap();
        let reg = FittedPipeline::fit(&active, &reg_trainer, &stage(&["potency"], 1, 100.0, 1.0)).unwrap();
        let cascade = CascadePredictor::new(Some(gate), reg);
        let admitted = cascade.admitted(&dataset).unwrap();
        assert_eq!(admitted, (0..40).step_by(2).collect::<Vec<_>>());
    }

    #[test]
    fn predictions_are_written_with_configured_headers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/predictions.csv");
        let rows = vec![PredictionRow {
            id: "pep1".into(),
            passthrough: "0.76".into(),
            value: 12.5,
        }];
        let columns = OutputColumns {
            value: "Predicted MBIC Value".into(),
            ..OutputColumns::default()
        };
        write_predictions(&path, &rows, &columns).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "Names,Decision Fn,Predicted MBIC Value\npep1,0.76,12.5\n");
    }

    #[test]
    fn cascade_cv_appends_one_line_per_scored_fold() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("full_model_results.txt");
        let dataset = activity_table();
        let gate_trainer = KernelTrainer::new(ModelFamily::Classifier, SolverConfig::default());
        let reg_trainer = KernelTrainer::new(ModelFamily::Regressor, SolverConfig::default());
        let plan = CascadePlan {
            classifier: stage(&["gate"], 1, 10.0, 5.0),
            regressor: stage(&["potency"], 1, 100.0, 1.0),
            threshold: 64.0,
        };
        let validator = CrossValidator::new(SplitConfig {
            folds: 5,
            repeats: 2,
            seed: 3,
        })
        .unwrap();
        let report = cascade_cross_validate(
            &dataset,
            &gate_trainer,
            &reg_trainer,
            &plan,
            &validator,
            Some(results.as_path()),
            None,
        )
        .unwrap();
        assert_eq!(report.folds.len() + report.skipped, 10);
        let lines = fs::read_to_string(&results).unwrap().lines().count();
        assert_eq!(lines, report.folds.len());
        assert!(report.mean_rmse.is_some());
    }
}
