//! One pass of single-parameter updates over the whole FM, shared by both solvers.
//!
//! Both ALS and MCMC visit the parameters in the same fixed order: `w0`, then
//! every `w_j`, then each factor column `f` in turn with every `V_jf` inside
//! it. For each parameter the sweep gathers the sufficient statistics of the
//! residuals against the parameter's gradient `h_i = ∂ŷ_i/∂θ`, asks a
//! [`CoordinateRule`] for the new value, and applies the change to the
//! residual cache incrementally. Only the rows in the feature's column are
//! touched, so a full sweep costs `O(nnz · (k + 1))`.
//!
//! Gradients for a factor parameter use the per-row factor sum
//! `q_if = Σ_j V_jf x_ij`: `h_i = x_ij (q_if − V_jf x_ij)`, which does not
//! depend on `V_jf` itself. After an update by `Δ`, `e_i += Δ h_i` and
//! `q_if += Δ x_ij`.
//!
//! A feature with an empty column is still proposed, with zero statistics, so
//! the rule alone decides its value (shrunk to zero by a ridge penalty, drawn
//! from the group prior by the sampler).

use crate::matrix::SparseDesignMatrix;
use crate::model::{ModelState, ParameterId};
use ndarray::Array1;

/// Residuals `e_i = ŷ_i − t_i` of the current predictions against the
/// current targets (labels, working response, or latent targets).
#[derive(Debug, Clone)]
pub struct ResidualCache {
    residual: Array1<f64>,
}

impl ResidualCache {
    pub fn from_predictions(predictions: &Array1<f64>, targets: &Array1<f64>) -> Self {
        Self {
            residual: predictions - targets,
        }
    }

    pub fn residuals(&self) -> &Array1<f64> {
        &self.residual
    }

    /// Reconstructs the predictions `ŷ = e + t`.
    pub fn predictions(&self, targets: &Array1<f64>) -> Array1<f64> {
        &self.residual + targets
    }

    /// `Σ c_i e_i²`, with `c_i = 1` when no weights are given.
    pub fn weighted_sum_of_squares(&self, weights: Option<&Array1<f64>>) -> f64 {
        match weights {
            Some(c) => self
                .residual
                .iter()
                .zip(c.iter())
                .map(|(&e, &c)| c * e * e)
                .sum(),
            None => self.residual.iter().map(|&e| e * e).sum(),
        }
    }
}

/// Weighted sums a closed-form or conjugate update needs for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SufficientStats {
    /// `Σ c_i h_i²`
    pub sum_h2: f64,
    /// `Σ c_i h_i e_i`
    pub sum_he: f64,
}

/// The prior/penalty group a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamGroup {
    Bias,
    Linear,
    Factor(usize),
}

/// Maps a parameter's current value and sufficient statistics to its new value.
pub trait CoordinateRule {
    fn propose(&mut self, group: ParamGroup, current: f64, stats: SufficientStats) -> f64;
}

/// Which parameter groups a sweep may change. Disabled groups stay untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepScope {
    pub fit_bias: bool,
    pub fit_linear: bool,
}

#[inline]
fn weight_of(weights: Option<&Array1<f64>>, row: usize) -> f64 {
    weights.map_or(1.0, |c| c[row])
}

/// Runs one full coordinate sweep, updating `state` and `cache` in place.
///
/// Returns the first parameter whose proposed value is not finite; the sweep
/// stops there and `state` keeps every earlier update.
pub fn sweep<R: CoordinateRule>(
    x: &SparseDesignMatrix,
    weights: Option<&Array1<f64>>,
    state: &mut ModelState,
    cache: &mut ResidualCache,
    rule: &mut R,
    scope: SweepScope,
) -> Result<(), ParameterId> {
    let e = &mut cache.residual;

    if scope.fit_bias {
        let mut stats = SufficientStats::default();
        for (row, &residual) in e.iter().enumerate() {
            let c = weight_of(weights, row);
            stats.sum_h2 += c;
            stats.sum_he += c * residual;
        }
        let updated = rule.propose(ParamGroup::Bias, state.w0, stats);
        if !updated.is_finite() {
            return Err(ParameterId::Bias);
        }
        let delta = updated - state.w0;
        state.w0 = updated;
        if delta != 0.0 {
            e.mapv_inplace(|r| r + delta);
        }
    }

    if scope.fit_linear {
        for j in 0..x.cols() {
            let (rows, values) = x.column(j);
            let mut stats = SufficientStats::default();
            for (&row, &value) in rows.iter().zip(values) {
                let c = weight_of(weights, row);
                stats.sum_h2 += c * value * value;
                stats.sum_he += c * value * e[row];
            }
            let current = state.w[j];
            let updated = rule.propose(ParamGroup::Linear, current, stats);
            if !updated.is_finite() {
                return Err(ParameterId::Linear(j));
            }
            let delta = updated - current;
            state.w[j] = updated;
            if delta != 0.0 {
                for (&row, &value) in rows.iter().zip(values) {
                    e[row] += delta * value;
                }
            }
        }
    }

    let mut q = Array1::<f64>::zeros(x.rows());
    for f in 0..state.rank() {
        for (row, q_row) in q.iter_mut().enumerate() {
            let (cols, values) = x.row(row);
            *q_row = cols
                .iter()
                .zip(values)
                .map(|(&j, &value)| state.v[[j, f]] * value)
                .sum();
        }

        for j in 0..x.cols() {
            let (rows, values) = x.column(j);
            let current = state.v[[j, f]];
            let mut stats = SufficientStats::default();
            for (&row, &value) in rows.iter().zip(values) {
                let c = weight_of(weights, row);
                let h = value * (q[row] - current * value);
                stats.sum_h2 += c * h * h;
                stats.sum_he += c * h * e[row];
            }
            let updated = rule.propose(ParamGroup::Factor(f), current, stats);
            if !updated.is_finite() {
                return Err(ParameterId::Factor { feature: j, factor: f });
            }
            let delta = updated - current;
            state.v[[j, f]] = updated;
            if delta != 0.0 {
                for (&row, &value) in rows.iter().zip(values) {
                    let h = value * (q[row] - current * value);
                    e[row] += delta * h;
                    q[row] += delta * value;
                }
            }
        }
    }

    Ok(())
}
