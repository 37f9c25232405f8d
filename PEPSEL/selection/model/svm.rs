use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SelectionError};

const TAU: f64 = 1e-12;

/// Stopping rules shared by the classifier and regressor solvers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// KKT violation tolerance.
    pub tolerance: f64,
    /// Width of the insensitive tube for regression.
    pub epsilon: f64,
    /// Iteration cap; a fit that hits it is kept but flagged unconverged.
    pub max_iter: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            epsilon: 0.1,
            max_iter: 100_000,
        }
    }
}

/// Radial basis function kernel `exp(-gamma * |a - b|^2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RbfKernel {
    /// Kernel width coefficient.
    pub gamma: f64,
}

impl RbfKernel {
    /// Kernel value for a pair of rows.
    #[must_use]
    pub fn compute(&self, a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
        let dist_sq: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
        (-self.gamma * dist_sq).exp()
    }

    fn gram(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let n = x.nrows();
        let mut gram = Array2::zeros((n, n));
        for i in 0..n {
            gram[[i, i]] = 1.0;
            for j in (i + 1)..n {
                let value = self.compute(x.row(i), x.row(j));
                gram[[i, j]] = value;
                gram[[j, i]] = value;
            }
        }
        gram
    }
}

/// Dual problem `min 0.5 a'Qa + p'a` subject to `y'a = 0`, `0 <= a <= c`,
/// with `Q[i][j] = y[i] y[j] K[s(i)][s(j)]`.
struct DualProblem<'a> {
    gram: &'a Array2<f64>,
    sample_of: Vec<usize>,
    y: Vec<f64>,
    p: Vec<f64>,
    c: f64,
}

struct DualSolution {
    alpha: Vec<f64>,
    rho: f64,
    converged: bool,
}

impl DualProblem<'_> {
    fn q(&self, i: usize, j: usize) -> f64 {
        self.y[i] * self.y[j] * self.gram[[self.sample_of[i], self.sample_of[j]]]
    }

    fn is_upper(&self, alpha: f64) -> bool {
        alpha >= self.c
    }

    fn is_lower(alpha: f64) -> bool {
        alpha <= 0.0
    }

    /// Second-order working set selection. `None` means the KKT conditions
    /// hold within `tolerance`.
    fn select_pair(&self, alpha: &[f64], grad: &[f64], tolerance: f64) -> Option<(usize, usize)> {
        let len = alpha.len();
        let mut gmax = f64::NEG_INFINITY;
        let mut first = None;
        for t in 0..len {
            if self.y[t] > 0.0 {
                if !self.is_upper(alpha[t]) && -grad[t] >= gmax {
                    gmax = -grad[t];
                    first = Some(t);
                }
            } else if !Self::is_lower(alpha[t]) && grad[t] >= gmax {
                gmax = grad[t];
                first = Some(t);
            }
        }
        let i = first?;

        let mut gmax2 = f64::NEG_INFINITY;
        let mut second = None;
        let mut best_obj = f64::INFINITY;
        let qd_i = self.q(i, i);
        for j in 0..len {
            let grad_diff = if self.y[j] > 0.0 {
                if Self::is_lower(alpha[j]) {
                    continue;
                }
                gmax2 = gmax2.max(grad[j]);
                gmax + grad[j]
            } else {
                if self.is_upper(alpha[j]) {
                    continue;
                }
                gmax2 = gmax2.max(-grad[j]);
                gmax - grad[j]
            };
            if grad_diff > 0.0 {
                let quad = qd_i + self.q(j, j) - 2.0 * self.y[i] * self.y[j] * self.q(i, j);
                let quad = if quad > 0.0 { quad } else { TAU };
                let obj = -(grad_diff * grad_diff) / quad;
                if obj <= best_obj {
                    best_obj = obj;
                    second = Some(j);
                }
            }
        }
        if gmax + gmax2 < tolerance {
            return None;
        }
        second.map(|j| (i, j))
    }

    fn solve(&self, config: &SolverConfig) -> DualSolution {
        let len = self.y.len();
        let c = self.c;
        let mut alpha = vec![0.0; len];
        let mut grad = self.p.clone();
        let mut converged = false;

        for _ in 0..config.max_iter {
            let Some((i, j)) = self.select_pair(&alpha, &grad, config.tolerance) else {
                converged = true;
                break;
            };
            let (old_i, old_j) = (alpha[i], alpha[j]);
            let q_ij = self.q(i, j);
            let quad = self.q(i, i) + self.q(j, j);

            if (self.y[i] - self.y[j]).abs() > f64::EPSILON {
                let denom = quad + 2.0 * q_ij;
                let denom = if denom > 0.0 { denom } else { TAU };
                let delta = (-grad[i] - grad[j]) / denom;
                let diff = alpha[i] - alpha[j];
                alpha[i] += delta;
                alpha[j] += delta;
                if diff > 0.0 {
                    if alpha[j] < 0.0 {
                        alpha[j] = 0.0;
                        alpha[i] = diff;
                    }
                } else if alpha[i] < 0.0 {
                    alpha[i] = 0.0;
                    alpha[j] = -diff;
                }
                if diff > 0.0 {
                    if alpha[i] > c {
                        alpha[i] = c;
                        alpha[j] = c - diff;
                    }
                } else if alpha[j] > c {
                    alpha[j] = c;
                    alpha[i] = c + diff;
                }
            } else {
                let denom = quad - 2.0 * q_ij;
                let denom = if denom > 0.0 { denom } else { TAU };
                let delta = (grad[i] - grad[j]) / denom;
                let sum = alpha[i] + alpha[j];
                alpha[i] -= delta;
                alpha[j] += delta;
                if sum > c {
                    if alpha[i] > c {
                        alpha[i] = c;
                        alpha[j] = sum - c;
                    }
                } else if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = sum;
                }
                if sum > c {
                    if alpha[j] > c {
                        alpha[j] = c;
                        alpha[i] = sum - c;
                    }
                } else if alpha[i] < 0.0 {
                    alpha[i] = 0.0;
                    alpha[j] = sum;
                }
            }

            let (delta_i, delta_j) = (alpha[i] - old_i, alpha[j] - old_j);
            for (k, g) in grad.iter_mut().enumerate() {
                *g += self.q(i, k) * delta_i + self.q(j, k) * delta_j;
            }
        }

        DualSolution {
            rho: self.rho(&alpha, &grad),
            alpha,
            converged,
        }
    }

    fn rho(&self, alpha: &[f64], grad: &[f64]) -> f64 {
        let mut upper = f64::INFINITY;
        let mut lower = f64::NEG_INFINITY;
        let mut free_sum = 0.0;
        let mut free_count = 0_u32;
        for t in 0..alpha.len() {
            let yg = self.y[t] * grad[t];
            if self.is_upper(alpha[t]) {
                if self.y[t] < 0.0 {
                    upper = upper.min(yg);
                } else {
                    lower = lower.max(yg);
                }
            } else if Self::is_lower(alpha[t]) {
                if self.y[t] > 0.0 {
                    upper = upper.min(yg);
                } else {
                    lower = lower.max(yg);
                }
            } else {
                free_count += 1;
                free_sum += yg;
            }
        }
        if free_count > 0 {
            free_sum / f64::from(free_count)
        } else {
            (upper + lower) / 2.0
        }
    }
}

/// Kernel expansion `f(x) = sum_i coef_i K(sv_i, x) - rho`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelExpansion {
    kernel: RbfKernel,
    support: Array2<f64>,
    coef: Array1<f64>,
    rho: f64,
    converged: bool,
}

impl KernelExpansion {
    fn from_dual(x: ArrayView2<'_, f64>, kernel: RbfKernel, coef: &[f64], rho: f64, converged: bool) -> Self {
        let kept: Vec<usize> = (0..coef.len()).filter(|&i| coef[i] != 0.0).collect();
        Self {
            kernel,
            support: x.select(Axis(0), &kept),
            coef: kept.iter().map(|&i| coef[i]).collect(),
            rho,
            converged,
        }
    }

    /// Raw decision values.
    #[must_use]
    pub fn decision_function(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        x.rows()
            .into_iter()
            .map(|row| {
                self.support
                    .rows()
                    .into_iter()
                    .zip(self.coef.iter())
                    .map(|(sv, coef)| coef * self.kernel.compute(sv, row))
                    .sum::<f64>()
                    - self.rho
            })
            .collect()
    }

    /// Number of support vectors retained.
    #[must_use]
    pub fn support_count(&self) -> usize {
        self.coef.len()
    }

    /// Whether the solver met its tolerance before the iteration cap.
    #[must_use]
    pub const fn converged(&self) -> bool {
        self.converged
    }
}

/// Box-constrained kernel hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelParams {
    /// Penalty on margin violations.
    pub c: f64,
    /// RBF width.
    pub gamma: f64,
}

impl KernelParams {
    fn validate(self) -> Result<()> {
        if !(self.c.is_finite() && self.c > 0.0) {
            return Err(SelectionError::InvalidCombination(format!("C must be positive, got {}", self.c)));
        }
        if !(self.gamma.is_finite() && self.gamma > 0.0) {
            return Err(SelectionError::InvalidCombination(format!(
                "gamma must be positive, got {}",
                self.gamma
            )));
        }
        Ok(())
    }
}

/// Binary C-support vector classifier over labels `{0, 1}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcModel {
    expansion: KernelExpansion,
}

impl SvcModel {
    /// Fits the classifier; labels `> 0.5` form the positive class.
    pub fn fit(
        x: ArrayView2<'_, f64>,
        labels: ArrayView1<'_, f64>,
        params: KernelParams,
        config: &SolverConfig,
    ) -> Result<Self> {
        params.validate()?;
        check_rows(x, labels)?;
        let y: Vec<f64> = labels.iter().map(|&v| if v > 0.5 { 1.0 } else { -1.0 }).collect();
        if y.iter().all(|&v| v > 0.0) || y.iter().all(|&v| v < 0.0) {
            return Err(SelectionError::Degenerate(
                "classifier training partition holds a single class".into(),
            ));
        }
        let kernel = RbfKernel { gamma: params.gamma };
        let gram = kernel.gram(x);
        let problem = DualProblem {
            gram: &gram,
            sample_of: (0..y.len()).collect(),
            p: vec![-1.0; y.len()],
            y,
            c: params.c,
        };
        let solution = problem.solve(config);
        let coef: Vec<f64> = solution
            .alpha
            .iter()
            .zip(problem.y.iter())
            .map(|(a, y)| a * y)
            .collect();
        Ok(Self {
            expansion: KernelExpansion::from_dual(x, kernel, &coef, solution.rho, solution.converged),
        })
    }

    /// Signed distance to the separating surface; positive means class 1.
    #[must_use]
    pub fn decision_function(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        self.expansion.decision_function(x)
    }

    /// Predicted labels in `{0, 1}`.
    #[must_use]
    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        self.decision_function(x).mapv(|d| if d > 0.0 { 1.0 } else { 0.0 })
    }

    /// Underlying kernel expansion.
    #[must_use]
    pub const fn expansion(&self) -> &KernelExpansion {
        &self.expansion
    }
}

/// Epsilon-insensitive support vector regressor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvrModel {
    expansion: KernelExpansion,
}

impl SvrModel {
    /// Fits the regressor.
    pub fn fit(
        x: ArrayView2<'_, f64>,
        targets: ArrayView1<'_, f64>,
        params: KernelParams,
        config: &SolverConfig,
    ) -> Result<Self> {
        params.validate()?;
        check_rows(x, targets)?;
        let n = targets.len();
        let kernel = RbfKernel { gamma: params.gamma };
        let gram = kernel.gram(x);
        let mut y = vec![1.0; n];
        y.extend(std::iter::repeat(-1.0).take(n));
        let mut p: Vec<f64> = targets.iter().map(|&z| config.epsilon - z).collect();
        p.extend(targets.iter().map(|&z| config.epsilon + z));
        let problem = DualProblem {
            gram: &gram,
            sample_of: (0..2 * n).map(|i| i % n).collect(),
            y,
            p,
            c: params.c,
        };
        let solution = problem.solve(config);
        let coef: Vec<f64> = (0..n)
            .map(|i| solution.alpha[i] - solution.alpha[i + n])
            .collect();
        Ok(Self {
            expansion: KernelExpansion::from_dual(x, kernel, &coef, solution.rho, solution.converged),
        })
    }

    /// Predicted continuous values.
    #[must_use]
    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        self.expansion.decision_function(x)
    }

    /// Underlying kernel expansion.
    #[must_use]
    pub const fn expansion(&self) -> &KernelExpansion {
        &self.expansion
    }
}

fn check_rows(x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> Result<()> {
    if x.nrows() == 0 || x.nrows() != y.len() {
        return Err(SelectionError::Degenerate(format!(
            "{} training rows for {} targets",
            x.nrows(),
            y.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    #[test]
    fn classifier_separates_two_clusters() {
        let x = array![[0.0, 0.1], [0.1, 0.0], [0.2, 0.1], [0.9, 1.0], [1.0, 0.9], [0.8, 0.9]];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let params = KernelParams { c: 10.0, gamma: 1.0 };
        let model = SvcModel::fit(x.view(), y.view(), params, &SolverConfig::default()).unwrap();
        assert!(model.expansion().converged());
        assert_eq!(model.predict(x.view()), y);
        let probe = model.decision_function(array![[0.05, 0.05], [0.95, 0.95]].view());
        assert!(probe[0] < 0.0 && probe[1] > 0.0);
    }

    #[test]
    fn single_class_partition_is_degenerate() {
        let x = array![[0.0], [1.0]];
        let err = SvcModel::fit(
            x.view(),
            array![1.0, 1.0].view(),
            KernelParams { c: 1.0, gamma: 1.0 },
            &SolverConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SelectionError::Degenerate(_)));
    }

    #[test]
    fn regressor_tracks_a_smooth_function() {
        let x = Array::linspace(0.0, 1.0, 30).into_shape((30, 1)).unwrap();
        let y = x.column(0).mapv(|v| 3.0 * v + 1.0);
        let params = KernelParams { c: 100.0, gamma: 2.0 };
        let model = SvrModel::fit(x.view(), y.view(), params, &SolverConfig::default()).unwrap();
        assert!(model.expansion().converged());
        let predicted = model.predict(x.view());
        for (p, t) in predicted.iter().zip(y.iter()) {
            assert!((p - t).abs() < 0.25, "predicted {p} for {t}");
        }
    }

    #[test]
    fn non_positive_penalty_is_rejected() {
        let x = array![[0.0], [1.0]];
        let err = SvrModel::fit(
            x.view(),
            array![0.0, 1.0].view(),
            KernelParams { c: 0.0, gamma: 1.0 },
            &SolverConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SelectionError::InvalidCombination(_)));
    }
}
