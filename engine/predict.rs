//! FM scoring in the factored form.
//!
//! The pairwise term is evaluated as
//! `½ Σ_f [(Σ_i V_if x_i)² − Σ_i V_if² x_i²]`, which touches only the nonzero
//! entries of a row and costs `O(k · nnz(row))` instead of `O(p²)`.

use crate::matrix::SparseDesignMatrix;
use crate::model::ModelState;
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Scores one sparse row given as parallel index/value slices.
#[inline]
pub fn score_row(state: &ModelState, indices: &[usize], values: &[f64]) -> f64 {
    let mut score = state.w0;
    for (&j, &x) in indices.iter().zip(values) {
        score += state.w[j] * x;
    }
    for f in 0..state.rank() {
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for (&j, &x) in indices.iter().zip(values) {
            let vx = state.v[[j, f]] * x;
            sum += vx;
            sum_sq += vx * vx;
        }
        score += 0.5 * (sum * sum - sum_sq);
    }
    score
}

/// Scores row `row` of `x`. An empty row scores `w0`.
#[inline]
pub fn score(state: &ModelState, x: &SparseDesignMatrix, row: usize) -> f64 {
    let (indices, values) = x.row(row);
    score_row(state, indices, values)
}

/// Scores every row of `x`. Rows are independent, so they are scored in parallel.
pub fn predict_scores(state: &ModelState, x: &SparseDesignMatrix) -> Array1<f64> {
    let scores: Vec<f64> = (0..x.rows())
        .into_par_iter()
        .map(|row| score(state, x, row))
        .collect();
    Array1::from_vec(scores)
}

/// The O(p²) definition of the FM score on a dense row: every pair `i < j`
/// contributes `<V_i, V_j> x_i x_j`. Used to check the factored form.
pub fn naive_score(state: &ModelState, row: ArrayView1<f64>) -> f64 {
    let p = row.len();
    let mut score = state.w0 + state.w.dot(&row);
    for i in 0..p {
        for j in (i + 1)..p {
            let interaction = state.v.row(i).dot(&state.v.row(j));
            score += interaction * row[i] * row[j];
        }
    }
    score
}

/// Logistic function with the argument clamped to avoid overflow in `exp`.
#[inline]
pub fn sigmoid(score: f64) -> f64 {
    let s = score.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-s).exp())
}

#[inline]
pub fn standard_normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

/// Standard normal CDF Φ(x) using the Abramowitz-Stegun 26.2.17 approximation
/// (absolute error below 7.5e-8).
#[inline]
pub fn standard_normal_cdf(x: f64) -> f64 {
    let z = x.abs().min(30.0);
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let poly = ((((1.330_274_429 * t - 1.821_255_978) * t + 1.781_477_937) * t
        - 0.356_563_782)
        * t
        + 0.319_381_530)
        * t;
    let upper = 1.0 - standard_normal_pdf(z) * poly;
    if x >= 0.0 { upper } else { 1.0 - upper }
}
