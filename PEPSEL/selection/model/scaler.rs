use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SelectionError};

/// Per-column min-max scaling onto `[0, 1]`.
///
/// Constant columns get a unit range and therefore map to 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinMaxScaler {
    min: Array1<f64>,
    range: Array1<f64>,
}

impl MinMaxScaler {
    /// Learns column minima and ranges from training rows.
    pub fn fit(x: ArrayView2<'_, f64>) -> Result<Self> {
        if x.nrows() == 0 {
            return Err(SelectionError::Degenerate("cannot scale an empty partition".into()));
        }
        let min = x.fold_axis(Axis(0), f64::INFINITY, |acc, &v| acc.min(v));
        let max = x.fold_axis(Axis(0), f64::NEG_INFINITY, |acc, &v| acc.max(v));
        let range = (&max - &min).mapv(|r| if r > 0.0 { r } else { 1.0 });
        Ok(Self { min, range })
    }

    /// Applies the learned scaling; values outside the training range are
    /// extrapolated, not clipped.
    pub fn transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.min.len() {
            return Err(SelectionError::Numeric(format!(
                "scaler fitted on {} columns, got {}",
                self.min.len(),
                x.ncols()
            )));
        }
        Ok((&x - &self.min) / &self.range)
    }

    /// Number of columns the scaler was fitted on.
    #[must_use]
    pub fn width(&self) -> usize {
        self.min.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn scales_training_rows_to_unit_range() {
        let x = array![[1.0, 5.0], [3.0, 5.0], [2.0, 5.0]];
        let scaler = MinMaxScaler::fit(x.view()).unwrap();
        let scaled = scaler.transform(x.view()).unwrap();
        assert_eq!(scaled.column(0).to_vec(), vec![0.0, 1.0, 0.5]);
        assert_eq!(scaled.column(1).to_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rows_reuse_training_statistics() {
        let scaler = MinMaxScaler::fit(array![[0.0], [10.0]].view()).unwrap();
        let scaled = scaler.transform(array![[20.0], [-5.0]].view()).unwrap();
        assert_eq!(scaled.column(0).to_vec(), vec![2.0, -0.5]);
    }
}
