//! Binary classification on top of the regression solvers.
//!
//! ALS classification fits a logistic model by iteratively reweighted least
//! squares: each sweep regresses a working response with IRLS weights. MCMC
//! classification uses probit data augmentation: each sample is given a
//! Gaussian latent target truncated to the side of zero matching its label.

use ndarray::{Array1, ArrayView1, Zip};
use rand::Rng;
use rand_distr::{Exp1, StandardNormal};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const PROB_EPS: f64 = 1e-8;
const MIN_WEIGHT: f64 = 1e-6;

/// How binary labels are written in targets and returned by `predict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelEncoding {
    /// Labels are `0` and `1`.
    #[default]
    ZeroOne,
    /// Labels are `-1` and `+1`.
    PlusMinusOne,
}

impl LabelEncoding {
    pub fn negative(&self) -> f64 {
        match self {
            LabelEncoding::ZeroOne => 0.0,
            LabelEncoding::PlusMinusOne => -1.0,
        }
    }

    pub fn positive(&self) -> f64 {
        1.0
    }

    /// Label value for a positive/negative decision.
    pub fn decode(&self, positive: bool) -> f64 {
        if positive {
            self.positive()
        } else {
            self.negative()
        }
    }
}

impl fmt::Display for LabelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelEncoding::ZeroOne => write!(f, "{{0, 1}}"),
            LabelEncoding::PlusMinusOne => write!(f, "{{-1, +1}}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LabelError {
    #[error("Label {value} at row {row} is not valid for the {encoding} encoding.")]
    InvalidLabel {
        row: usize,
        value: f64,
        encoding: LabelEncoding,
    },
}

/// Validated binary labels, stored as `0.0` / `1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryLabels(Array1<f64>);

impl BinaryLabels {
    /// Checks every target against `encoding` before any training happens.
    pub fn from_targets(y: ArrayView1<f64>, encoding: LabelEncoding) -> Result<Self, LabelError> {
        let mut labels = Array1::zeros(y.len());
        for (row, (&value, label)) in y.iter().zip(labels.iter_mut()).enumerate() {
            if value == encoding.positive() {
                *label = 1.0;
            } else if value != encoding.negative() {
                return Err(LabelError::InvalidLabel {
                    row,
                    value,
                    encoding,
                });
            }
        }
        Ok(Self(labels))
    }

    pub fn as_zero_one(&self) -> &Array1<f64> {
        &self.0
    }

    #[inline]
    pub fn is_positive(&self, row: usize) -> bool {
        self.0[row] > 0.5
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One IRLS linearization of the logistic model around the current scores.
#[derive(Debug, Clone)]
pub struct WorkingResponse {
    /// Fitted probabilities, clamped away from 0 and 1.
    pub mu: Array1<f64>,
    /// IRLS weights `μ(1−μ)` times the prior weights.
    pub weights: Array1<f64>,
    /// Working response `s + (y − μ)/w`.
    pub z: Array1<f64>,
}

/// Linearizes the logistic log-likelihood at `scores`.
///
/// Prior (sample) weights multiply the IRLS weights but do not enter the
/// working response.
pub fn working_response(
    labels: &BinaryLabels,
    scores: &Array1<f64>,
    prior_weights: Option<&Array1<f64>>,
) -> WorkingResponse {
    let eta = scores.mapv(|s| s.clamp(-700.0, 700.0));
    let mu = eta.mapv(|e| (1.0 / (1.0 + (-e).exp())).clamp(PROB_EPS, 1.0 - PROB_EPS));
    let irls = mu.mapv(|m| (m * (1.0 - m)).max(MIN_WEIGHT));

    let mut z = Array1::zeros(eta.len());
    Zip::from(&mut z)
        .and(&eta)
        .and(labels.as_zero_one())
        .and(&mu)
        .and(&irls)
        .for_each(|z, &e, &y, &m, &w| *z = e + (y - m) / w);

    let weights = match prior_weights {
        Some(prior) => &irls * prior,
        None => irls,
    };
    WorkingResponse { mu, weights, z }
}

/// Mean negative log-likelihood of `probabilities` under the labels, weighted
/// by `weights` when given.
pub fn log_loss(
    labels: &BinaryLabels,
    probabilities: &Array1<f64>,
    weights: Option<&Array1<f64>>,
) -> f64 {
    let mut total = 0.0;
    let mut total_weight = 0.0;
    for (row, (&y, &p)) in labels
        .as_zero_one()
        .iter()
        .zip(probabilities.iter())
        .enumerate()
    {
        let c = weights.map_or(1.0, |w| w[row]);
        let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
        total -= c * (y * p.ln() + (1.0 - y) * (1.0 - p).ln());
        total_weight += c;
    }
    if total_weight > 0.0 {
        total / total_weight
    } else {
        0.0
    }
}

/// Draws `x ~ N(0, 1)` conditioned on `x > lower`.
///
/// Plain rejection is efficient while `lower` is small; in the tail an
/// exponential proposal with rate `(lower + sqrt(lower² + 4)) / 2` is used.
pub fn sample_standard_normal_above<R: Rng + ?Sized>(rng: &mut R, lower: f64) -> f64 {
    if lower < 0.45 {
        loop {
            let x: f64 = rng.sample(StandardNormal);
            if x > lower {
                return x;
            }
        }
    }
    let rate = 0.5 * (lower + (lower * lower + 4.0).sqrt());
    loop {
        let e: f64 = rng.sample(Exp1);
        let x = lower + e / rate;
        let u: f64 = rng.r#gen();
        let d = x - rate;
        if u <= (-0.5 * d * d).exp() {
            return x;
        }
    }
}

/// Draws a probit latent target: `N(mean, 1)` truncated to `(0, ∞)` for a
/// positive label and to `(−∞, 0)` for a negative one.
pub fn sample_latent_target<R: Rng + ?Sized>(rng: &mut R, mean: f64, positive: bool) -> f64 {
    if positive {
        mean + sample_standard_normal_above(rng, -mean)
    } else {
        -(-mean + sample_standard_normal_above(rng, mean))
    }
}

/// Resamples every latent target given the current scores.
pub fn resample_latent_targets<R: Rng + ?Sized>(
    rng: &mut R,
    labels: &BinaryLabels,
    scores: &Array1<f64>,
    latent: &mut Array1<f64>,
) {
    for (row, (z, &s)) in latent.iter_mut().zip(scores.iter()).enumerate() {
        *z = sample_latent_target(rng, s, labels.is_positive(row));
    }
}
