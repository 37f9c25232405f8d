use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SelectionError};

const MAX_SWEEPS: usize = 100;

/// Principal component projection fitted on training rows.
///
/// Components are the leading eigenvectors of the sample covariance, each
/// signed so that its largest-magnitude loading is positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    mean: Array1<f64>,
    components: Array2<f64>,
    explained_variance: Array1<f64>,
}

impl Projection {
    /// Fits `k` components.
    ///
    /// `k` must lie in `1..=min(columns, rows)`; a partition with zero total
    /// variance is degenerate.
    pub fn fit(x: ArrayView2<'_, f64>, k: usize) -> Result<Self> {
        let (rows, cols) = x.dim();
        if k == 0 || k > cols {
            return Err(SelectionError::InvalidCombination(format!(
                "{k} components requested for {cols} descriptors"
            )));
        }
        if k > rows {
            return Err(SelectionError::InvalidCombination(format!(
                "{k} components requested for {rows} training rows"
            )));
        }
        if rows < 2 {
            return Err(SelectionError::Degenerate(
                "projection needs at least two training rows".into(),
            ));
        }
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| SelectionError::Degenerate("empty partition".into()))?;
        let centered = &x - &mean;
        #[allow(clippy::cast_precision_loss)]
        let covariance = centered.t().dot(&centered) / (rows - 1) as f64;
        let total_variance = covariance.diag().sum();
        if total_variance <= f64::EPSILON {
            return Err(SelectionError::Degenerate(
                "training partition has zero variance".into(),
            ));
        }

        let (values, vectors) = symmetric_eigen(covariance);
        let mut order: Vec<usize> = (0..cols).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
        let order = &order[..k];

        let mut components = vectors.select(Axis(1), order);
        for mut column in components.columns_mut() {
            let pivot = column
                .iter()
                .copied()
                .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
            if pivot < 0.0 {
                column.mapv_inplace(|v| -v);
            }
        }
        let explained_variance = order.iter().map(|&idx| values[idx].max(0.0)).collect();
        Ok(Self {
            mean,
            components,
            explained_variance,
        })
    }

    /// Projects rows onto the fitted components.
    pub fn transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.mean.len() {
            return Err(SelectionError::Numeric(format!(
                "projection fitted on {} columns, got {}",
                self.mean.len(),
                x.ncols()
            )));
        }
        Ok((&x - &self.mean).dot(&self.components))
    }

    /// Number of retained components.
    #[must_use]
    pub fn components(&self) -> usize {
        self.components.ncols()
    }

    /// Variance captured by each retained component, descending.
    #[must_use]
    pub fn explained_variance(&self) -> &Array1<f64> {
        &self.explained_variance
    }
}

/// Cyclic Jacobi eigen-decomposition of a symmetric matrix.
///
/// Returns eigenvalues and the matrix whose columns are the eigenvectors.
fn symmetric_eigen(mut a: Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut v = Array2::<f64>::eye(n);
    let scale = a.iter().map(|x| x * x).sum::<f64>().sqrt().max(f64::MIN_POSITIVE);
    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off.sqrt() <= 1e-14 * scale {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq.abs() <= f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + theta.mul_add(theta, 1.0).sqrt());
                let c = 1.0 / t.mul_add(t, 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let (akp, akq) = (a[[k, p]], a[[k, q]]);
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[[p, k]], a[[q, k]]);
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }
    (a.diag().to_owned(), v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn full_rank_projection_is_accepted() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [0.5, 0.7], [0.2, 0.1]];
        let projection = Projection::fit(x.view(), 2).unwrap();
        assert_eq!(projection.transform(x.view()).unwrap().dim(), (4, 2));
    }

    #[test]
    fn more_components_than_descriptors_is_rejected() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [0.5, 0.7]];
        let err = Projection::fit(x.view(), 3).unwrap_err();
        assert!(matches!(err, SelectionError::InvalidCombination(_)));
    }

    #[test]
    fn zero_variance_partition_is_degenerate() {
        let x = array![[0.3, 0.3], [0.3, 0.3], [0.3, 0.3]];
        let err = Projection::fit(x.view(), 1).unwrap_err();
        assert!(matches!(err, SelectionError::Degenerate(_)));
    }

    #[test]
    fn leading_component_follows_dominant_direction() {
        let x = array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.1]];
        let projection = Projection::fit(x.view(), 1).unwrap();
        let loadings = projection.components.column(0).to_vec();
        assert!((loadings[0] - loadings[1]).abs() < 0.05);
        assert!(loadings[0] > 0.0);
        let ev = projection.explained_variance();
        assert!(ev[0] > 3.0);
    }

    #[test]
    fn jacobi_recovers_known_spectrum() {
        let (values, vectors) = symmetric_eigen(array![[2.0, 1.0], [1.0, 2.0]]);
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        assert!((sorted[0] - 1.0).abs() < 1e-10);
        assert!((sorted[1] - 3.0).abs() < 1e-10);
        let orthogonality = vectors.t().dot(&vectors);
        assert!((orthogonality[[0, 1]]).abs() < 1e-10);
    }
}
