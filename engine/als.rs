//! Alternating least squares coordinate descent.
//!
//! Every parameter is replaced by the minimizer of the penalized squared loss
//! with all other parameters held fixed:
//!
//! `θ_new = (θ_old · Σ c h² − Σ c h e) / (Σ c h² + λ)`
//!
//! Each iteration starts from a fresh prediction vector so rounding in the
//! incremental residual cache cannot accumulate across iterations.
//! Classification runs the same updates against the IRLS working response of
//! a logistic model.

use crate::config::{FitConfig, Regularization};
use crate::estimate::{StepOutcome, TrainingError, TrainingStep};
use crate::link::{self, BinaryLabels};
use crate::matrix::SparseDesignMatrix;
use crate::mcmc::PosteriorOutput;
use crate::model::{FitStatus, ModelState};
use crate::predict::{self, predict_scores};
use crate::sweep::{self, CoordinateRule, ParamGroup, ResidualCache, SufficientStats, SweepScope};
use ndarray::Array1;

/// Where the solver is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlsPhase {
    Initialized,
    Iterating,
    Converged,
    MaxIterationsReached,
}

/// What the sweeps regress on.
#[derive(Debug, Clone)]
pub enum AlsObjective {
    /// Squared loss against real-valued targets.
    Regression(Array1<f64>),
    /// Logistic loss, linearized by IRLS before every sweep.
    Classification(BinaryLabels),
}

/// Closed-form ridge update with an optional damping factor.
#[derive(Debug, Clone)]
pub struct RidgeRule<'a> {
    regularization: &'a Regularization,
    step_size: f64,
}

impl<'a> RidgeRule<'a> {
    pub fn new(regularization: &'a Regularization, step_size: f64) -> Self {
        Self {
            regularization,
            step_size,
        }
    }

    fn penalty(&self, group: ParamGroup) -> f64 {
        match group {
            ParamGroup::Bias => self.regularization.bias,
            ParamGroup::Linear => self.regularization.linear,
            ParamGroup::Factor(f) => self.regularization.factor_penalty(f),
        }
    }
}

impl CoordinateRule for RidgeRule<'_> {
    #[inline]
    fn propose(&mut self, group: ParamGroup, current: f64, stats: SufficientStats) -> f64 {
        let denominator = stats.sum_h2 + self.penalty(group);
        if denominator <= 0.0 {
            return current;
        }
        let target = (current * stats.sum_h2 - stats.sum_he) / denominator;
        current + self.step_size * (target - current)
    }
}

pub struct AlsSolver {
    state: ModelState,
    objective: AlsObjective,
    weights: Option<Array1<f64>>,
    total_weight: f64,
    regularization: Regularization,
    step_size: f64,
    tolerance: Option<f64>,
    scope: SweepScope,
    n_iterations: usize,
    iteration: usize,
    phase: AlsPhase,
    last_loss: Option<f64>,
}

impl AlsSolver {
    pub fn new(
        state: ModelState,
        objective: AlsObjective,
        weights: Option<Array1<f64>>,
        config: &FitConfig,
    ) -> Self {
        let n = match &objective {
            AlsObjective::Regression(y) => y.len(),
            AlsObjective::Classification(labels) => labels.len(),
        };
        let total_weight = weights.as_ref().map_or(n as f64, |w| w.sum());
        Self {
            state,
            objective,
            weights,
            total_weight,
            regularization: config.regularization.clone(),
            step_size: config.step_size,
            tolerance: config.tolerance,
            scope: SweepScope {
                fit_bias: config.fit_bias,
                fit_linear: config.fit_linear,
            },
            n_iterations: config.n_iterations,
            iteration: 0,
            phase: AlsPhase::Initialized,
            last_loss: None,
        }
    }

    pub fn phase(&self) -> AlsPhase {
        self.phase
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    fn instability(&self, parameter: String) -> TrainingError {
        log::error!(
            "ALS produced a non-finite value for {} in iteration {}.",
            parameter,
            self.iteration
        );
        TrainingError::NumericInstability {
            iteration: self.iteration,
            parameter,
        }
    }

    fn has_converged(&self, loss: f64) -> bool {
        match (self.tolerance, self.last_loss) {
            (Some(tol), Some(previous)) => {
                let scale = previous.abs().max(f64::MIN_POSITIVE);
                (previous - loss).abs() / scale < tol
            }
            _ => false,
        }
    }
}

impl TrainingStep for AlsSolver {
    fn step(&mut self, x: &SparseDesignMatrix) -> Result<StepOutcome, TrainingError> {
        self.phase = AlsPhase::Iterating;
        self.iteration += 1;

        let scores = predict_scores(&self.state, x);
        let mut rule = RidgeRule::new(&self.regularization, self.step_size);

        let swept = match &self.objective {
            AlsObjective::Regression(y) => {
                let mut cache = ResidualCache::from_predictions(&scores, y);
                sweep::sweep(
                    x,
                    self.weights.as_ref(),
                    &mut self.state,
                    &mut cache,
                    &mut rule,
                    self.scope,
                )
                .map(|_| {
                    cache.weighted_sum_of_squares(self.weights.as_ref()) / self.total_weight
                })
            }
            AlsObjective::Classification(labels) => {
                let working = link::working_response(labels, &scores, self.weights.as_ref());
                let mut cache = ResidualCache::from_predictions(&scores, &working.z);
                sweep::sweep(
                    x,
                    Some(&working.weights),
                    &mut self.state,
                    &mut cache,
                    &mut rule,
                    self.scope,
                )
                .map(|_| {
                    let probabilities = cache.predictions(&working.z).mapv(predict::sigmoid);
                    link::log_loss(labels, &probabilities, self.weights.as_ref())
                })
            }
        };

        let loss = match swept {
            Ok(loss) => loss,
            Err(parameter) => return Err(self.instability(parameter.to_string())),
        };
        if !loss.is_finite() {
            let parameter = self
                .state
                .first_non_finite()
                .map_or_else(|| "training predictions".to_string(), |p| p.to_string());
            return Err(self.instability(parameter));
        }

        log::debug!("ALS iteration {}: training loss {:.6e}", self.iteration, loss);

        let converged = self.has_converged(loss);
        self.last_loss = Some(loss);
        if converged {
            self.phase = AlsPhase::Converged;
        } else if self.iteration >= self.n_iterations {
            self.phase = AlsPhase::MaxIterationsReached;
        }

        Ok(StepOutcome {
            loss,
            converged,
            retained_samples: 0,
        })
    }

    fn state(&self) -> &ModelState {
        &self.state
    }

    fn into_output(self, _status: FitStatus) -> (ModelState, Option<PosteriorOutput>) {
        (self.state, None)
    }
}
