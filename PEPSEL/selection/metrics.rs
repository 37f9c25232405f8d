use std::fmt;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SelectionError};

/// Optimisation direction of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Errors: smaller is better.
    LowerIsBetter,
    /// Agreement coefficients: larger is better.
    HigherIsBetter,
}

impl Direction {
    /// Returns true when `candidate` strictly beats `incumbent`.
    ///
    /// Strictness keeps the first-seen value on ties.
    #[must_use]
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::LowerIsBetter => candidate < incumbent,
            Self::HigherIsBetter => candidate > incumbent,
        }
    }

    /// Picks the best of a sequence, keeping the first on ties.
    pub fn best_by<T>(self, items: impl IntoIterator<Item = T>, score: impl Fn(&T) -> f64) -> Option<T> {
        items.into_iter().fold(None, |best, item| match best {
            Some(current) if !self.improves(score(&item), score(&current)) => Some(current),
            _ => Some(item),
        })
    }
}

/// Fold-level quality metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Root-mean-squared error of continuous predictions.
    Rmse,
    /// Matthews correlation coefficient of binary predictions.
    Mcc,
}

impl Metric {
    /// Direction in which this metric improves.
    #[must_use]
    pub const fn direction(self) -> Direction {
        match self {
            Self::Rmse => Direction::LowerIsBetter,
            Self::Mcc => Direction::HigherIsBetter,
        }
    }

    /// Scores one fold.
    pub fn score(self, truth: ArrayView1<'_, f64>, predicted: ArrayView1<'_, f64>) -> Result<f64> {
        match self {
            Self::Rmse => root_mean_squared_error(truth, predicted),
            Self::Mcc => matthews_corrcoef(truth, predicted),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rmse => write!(f, "rmse"),
            Self::Mcc => write!(f, "mcc"),
        }
    }
}

fn check_pair(truth: ArrayView1<'_, f64>, predicted: ArrayView1<'_, f64>) -> Result<()> {
    if truth.is_empty() || truth.len() != predicted.len() {
        return Err(SelectionError::Numeric(format!(
            "cannot score {} predictions against {} targets",
            predicted.len(),
            truth.len()
        )));
    }
    if predicted.iter().any(|value| !value.is_finite()) {
        return Err(SelectionError::Numeric("non-finite prediction".into()));
    }
    Ok(())
}

/// Root-mean-squared error between targets and predictions.
#[allow(clippy::cast_precision_loss)]
pub fn root_mean_squared_error(
    truth: ArrayView1<'_, f64>,
    predicted: ArrayView1<'_, f64>,
) -> Result<f64> {
    check_pair(truth, predicted)?;
    let sum_sq: f64 = truth
        .iter()
        .zip(predicted.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    Ok((sum_sq / truth.len() as f64).sqrt())
}

/// Matthews correlation coefficient of binary labels (`> 0.5` is positive).
///
/// Returns 0 when any marginal is empty, e.g. a single class predicted.
pub fn matthews_corrcoef(truth: ArrayView1<'_, f64>, predicted: ArrayView1<'_, f64>) -> Result<f64> {
    check_pair(truth, predicted)?;
    let (mut tp, mut tn, mut fp, mut fn_) = (0.0_f64, 0.0_f64, 0.0_f64, 0.0_f64);
    for (&t, &p) in truth.iter().zip(predicted.iter()) {
        match (t > 0.5, p > 0.5) {
            (true, true) => tp += 1.0,
            (false, false) => tn += 1.0,
            (false, true) => fp += 1.0,
            (true, false) => fn_ += 1.0,
        }
    }
    let denominator = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
    if denominator == 0.0 {
        return Ok(0.0);
    }
    Ok((tp * tn - fp * fn_) / denominator)
}

/// Arithmetic mean; `None` for an empty slice.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rmse_matches_hand_computation() {
        let rmse = root_mean_squared_error(array![1.0, 2.0, 3.0].view(), array![1.0, 2.0, 5.0].view())
            .unwrap();
        assert!((rmse - (4.0_f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn mcc_is_one_for_perfect_agreement() {
        let truth = array![1.0, 0.0, 1.0, 0.0];
        assert!((matthews_corrcoef(truth.view(), truth.view()).unwrap() - 1.0).abs() < 1e-12);
        let flipped = truth.mapv(|v| 1.0 - v);
        assert!((matthews_corrcoef(truth.view(), flipped.view()).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn mcc_is_zero_when_single_class_predicted() {
        let mcc = matthews_corrcoef(array![1.0, 0.0, 1.0].view(), array![1.0, 1.0, 1.0].view()).unwrap();
        assert_eq!(mcc, 0.0);
    }

    #[test]
    fn non_finite_predictions_are_numeric_errors() {
        let err = Metric::Rmse
            .score(array![1.0].view(), array![f64::NAN].view())
            .unwrap_err();
        assert!(matches!(err, SelectionError::Numeric(_)));
    }

    #[test]
    fn best_by_keeps_first_on_ties() {
        let items = vec![("a", 0.5), ("b", 0.2), ("c", 0.2)];
        let best = Direction::LowerIsBetter.best_by(items.clone(), |item| item.1).unwrap();
        assert_eq!(best.0, "b");
        let best = Direction::HigherIsBetter.best_by(items, |item| item.1).unwrap();
        assert_eq!(best.0, "a");
    }
}
