//! Gibbs sampling for FMs with Normal-Gamma hyperpriors.
//!
//! Each iteration draws, in order:
//!
//! 1. the hyperparameters: the noise precision `α` (regression only) and, for
//!    the linear weights and every factor column, a prior mean `μ` and
//!    precision `λ` from their conjugate posteriors;
//! 2. every model parameter from its Gaussian full conditional, visited in
//!    the same order as an ALS sweep and sharing its residual cache;
//! 3. for classification, the probit latent targets given the new scores.
//!
//! After `burn_in` iterations each sample is folded into a running mean; the
//! returned model is that posterior mean.

use crate::config::{FitConfig, McmcPriors};
use crate::estimate::{StepOutcome, TrainingError, TrainingStep};
use crate::link::{self, BinaryLabels};
use crate::matrix::SparseDesignMatrix;
use crate::model::{FitStatus, ModelState};
use crate::predict::{self, predict_scores};
use crate::sweep::{self, CoordinateRule, ParamGroup, ResidualCache, SufficientStats, SweepScope};
use ndarray::{Array1, ArrayView1};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Gamma, StandardNormal};
use serde::{Deserialize, Serialize};

const PRECISION_MIN: f64 = 1e-10;
const PRECISION_MAX: f64 = 1e10;
const MIN_VARIANCE: f64 = 1e-12;

/// Current draw of the hierarchical prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParameters {
    /// Observation-noise precision. Fixed at 1 for classification.
    pub alpha: f64,
    pub lambda_w: f64,
    pub mu_w: f64,
    /// One precision per factor column.
    pub lambda_v: Vec<f64>,
    pub mu_v: Vec<f64>,
}

impl HyperParameters {
    /// Starts the group precisions at the configured regularization values.
    pub fn from_config(config: &FitConfig) -> Self {
        let reg = &config.regularization;
        Self {
            alpha: 1.0,
            lambda_w: reg.linear,
            mu_w: 0.0,
            lambda_v: (0..config.rank).map(|f| reg.factor_penalty(f)).collect(),
            mu_v: vec![0.0; config.rank],
        }
    }
}

/// Hyperparameters and training loss of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub iteration: usize,
    pub loss: f64,
    pub alpha: f64,
    pub lambda_w: f64,
    pub mu_w: f64,
    pub lambda_v: Vec<f64>,
    pub mu_v: Vec<f64>,
}

/// Everything the sampler returns besides the posterior-mean model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorOutput {
    /// Number of samples averaged into the model (iterations after burn-in).
    pub retained_samples: usize,
    /// Posterior mean of the training predictions; probabilities for classification.
    pub training_predictions: Vec<f64>,
    /// Hyperparameters of the final iteration.
    pub hyperparameters: HyperParameters,
    pub trace: Vec<TraceRecord>,
}

/// Running mean of model states and training predictions.
#[derive(Debug, Clone)]
pub struct PosteriorAccumulator {
    count: usize,
    state: ModelState,
    predictions: Array1<f64>,
}

impl PosteriorAccumulator {
    pub fn new(n_features: usize, rank: usize, n_rows: usize) -> Self {
        Self {
            count: 0,
            state: ModelState::zeros(n_features, rank),
            predictions: Array1::zeros(n_rows),
        }
    }

    pub fn add(&mut self, sample: &ModelState, predictions: &Array1<f64>) {
        self.count += 1;
        let weight = 1.0 / self.count as f64;
        self.state.w0 += (sample.w0 - self.state.w0) * weight;
        self.state
            .w
            .zip_mut_with(&sample.w, |mean, &x| *mean += (x - *mean) * weight);
        self.state
            .v
            .zip_mut_with(&sample.v, |mean, &x| *mean += (x - *mean) * weight);
        self.predictions
            .zip_mut_with(predictions, |mean, &x| *mean += (x - *mean) * weight);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean_state(&self) -> &ModelState {
        &self.state
    }

    pub fn mean_predictions(&self) -> &Array1<f64> {
        &self.predictions
    }
}

/// Draws from `Gamma(shape, rate)`, clamped into `[1e-10, 1e10]`.
///
/// Returns `None` when the parameters do not describe a valid distribution.
pub fn draw_gamma<R: Rng + ?Sized>(rng: &mut R, shape: f64, rate: f64) -> Option<f64> {
    if !(shape > 0.0 && rate > 0.0 && shape.is_finite() && rate.is_finite()) {
        return None;
    }
    let gamma = Gamma::new(shape, 1.0 / rate).ok()?;
    let draw = gamma.sample(rng);
    if !draw.is_finite() {
        return None;
    }
    if !(PRECISION_MIN..=PRECISION_MAX).contains(&draw) {
        log::warn!(
            "Clamping precision draw {:.3e} into [{:e}, {:e}].",
            draw,
            PRECISION_MIN,
            PRECISION_MAX
        );
    }
    Some(draw.clamp(PRECISION_MIN, PRECISION_MAX))
}

/// Draws `(μ, λ)` for one parameter group given its current values.
fn sample_group_prior<R: Rng + ?Sized>(
    rng: &mut R,
    values: ArrayView1<f64>,
    lambda: f64,
    priors: &McmcPriors,
) -> Option<(f64, f64)> {
    let m = values.len() as f64;
    let sum: f64 = values.sum();
    let mu_precision = (m + priors.gamma_0) * lambda;
    let mu_mean = (sum + priors.gamma_0 * priors.mu_0) / (m + priors.gamma_0);
    let z: f64 = rng.sample(StandardNormal);
    let mu = mu_mean + z / mu_precision.sqrt();

    let spread: f64 = values.iter().map(|&v| (v - mu) * (v - mu)).sum();
    let shape = 0.5 * (priors.alpha_lambda + m + 1.0);
    let rate = 0.5
        * (priors.beta_lambda + spread + priors.gamma_0 * (mu - priors.mu_0) * (mu - priors.mu_0));
    let lambda = draw_gamma(rng, shape, rate)?;
    mu.is_finite().then_some((mu, lambda))
}

/// Draws each parameter from its Gaussian full conditional.
pub struct GibbsRule<'a> {
    rng: &'a mut StdRng,
    hyper: &'a HyperParameters,
    bias_precision: f64,
    clamped: usize,
}

impl<'a> GibbsRule<'a> {
    pub fn new(rng: &'a mut StdRng, hyper: &'a HyperParameters, bias_precision: f64) -> Self {
        Self {
            rng,
            hyper,
            bias_precision,
            clamped: 0,
        }
    }

    /// How many conditional variances hit the lower bound so far.
    pub fn clamped(&self) -> usize {
        self.clamped
    }
}

impl CoordinateRule for GibbsRule<'_> {
    #[inline]
    fn propose(&mut self, group: ParamGroup, current: f64, stats: SufficientStats) -> f64 {
        let (prior_precision, prior_mean) = match group {
            ParamGroup::Bias => (self.bias_precision, 0.0),
            ParamGroup::Linear => (self.hyper.lambda_w, self.hyper.mu_w),
            ParamGroup::Factor(f) => (self.hyper.lambda_v[f], self.hyper.mu_v[f]),
        };
        let alpha = self.hyper.alpha;
        let precision = alpha * stats.sum_h2 + prior_precision;
        if precision <= 0.0 {
            return current;
        }
        let mean =
            (alpha * (current * stats.sum_h2 - stats.sum_he) + prior_precision * prior_mean)
                / precision;
        let mut variance = 1.0 / precision;
        if variance < MIN_VARIANCE {
            variance = MIN_VARIANCE;
            self.clamped += 1;
        }
        let z: f64 = self.rng.sample(StandardNormal);
        mean + variance.sqrt() * z
    }
}

/// What the sampler conditions on.
#[derive(Debug, Clone)]
pub enum McmcObjective {
    Regression(Array1<f64>),
    Classification(BinaryLabels),
}

enum Targets {
    Observed(Array1<f64>),
    Latent {
        labels: BinaryLabels,
        latent: Array1<f64>,
    },
}

pub struct GibbsSampler {
    state: ModelState,
    targets: Targets,
    hyper: HyperParameters,
    priors: McmcPriors,
    bias_precision: f64,
    scope: SweepScope,
    burn_in: usize,
    iteration: usize,
    rng: StdRng,
    accumulator: PosteriorAccumulator,
    last_predictions: Array1<f64>,
    trace: Vec<TraceRecord>,
}

impl GibbsSampler {
    /// `rng` continues the stream that initialized `state`, so one seed fixes the whole fit.
    pub fn new(
        state: ModelState,
        objective: McmcObjective,
        x: &SparseDesignMatrix,
        config: &FitConfig,
        mut rng: StdRng,
    ) -> Self {
        let scores = predict_scores(&state, x);
        let targets = match objective {
            McmcObjective::Regression(y) => Targets::Observed(y),
            McmcObjective::Classification(labels) => {
                let mut latent = Array1::zeros(labels.len());
                link::resample_latent_targets(&mut rng, &labels, &scores, &mut latent);
                Targets::Latent { labels, latent }
            }
        };
        let accumulator = PosteriorAccumulator::new(state.n_features(), state.rank(), x.rows());
        Self {
            hyper: HyperParameters::from_config(config),
            priors: config.priors,
            bias_precision: config.regularization.bias,
            scope: SweepScope {
                fit_bias: config.fit_bias,
                fit_linear: config.fit_linear,
            },
            burn_in: config.burn_in,
            iteration: 0,
            rng,
            accumulator,
            last_predictions: scores,
            trace: Vec::new(),
            state,
            targets,
        }
    }

    pub fn hyperparameters(&self) -> &HyperParameters {
        &self.hyper
    }

    pub fn trace(&self) -> &[TraceRecord] {
        &self.trace
    }

    pub fn retained_samples(&self) -> usize {
        self.accumulator.count()
    }

    fn current_targets(&self) -> &Array1<f64> {
        match &self.targets {
            Targets::Observed(y) => y,
            Targets::Latent { latent, .. } => latent,
        }
    }

    fn instability(&self, parameter: String) -> TrainingError {
        log::error!(
            "MCMC produced a non-finite value for {} in iteration {}.",
            parameter,
            self.iteration
        );
        TrainingError::NumericInstability {
            iteration: self.iteration,
            parameter,
        }
    }

    fn sample_hyperparameters(&mut self, sum_sq_residuals: f64) -> Result<(), TrainingError> {
        if let Targets::Observed(y) = &self.targets {
            let shape = 0.5 * (self.priors.alpha_0 + y.len() as f64);
            let rate = 0.5 * (self.priors.beta_0 + sum_sq_residuals);
            self.hyper.alpha = match draw_gamma(&mut self.rng, shape, rate) {
                Some(alpha) => alpha,
                None => return Err(self.instability("alpha".to_string())),
            };
        }

        if self.scope.fit_linear && self.state.n_features() > 0 {
            match sample_group_prior(
                &mut self.rng,
                self.state.w.view(),
                self.hyper.lambda_w,
                &self.priors,
            ) {
                Some((mu, lambda)) => {
                    self.hyper.mu_w = mu;
                    self.hyper.lambda_w = lambda;
                }
                None => return Err(self.instability("lambda_w".to_string())),
            }
        }

        for f in 0..self.state.rank() {
            match sample_group_prior(
                &mut self.rng,
                self.state.v.column(f),
                self.hyper.lambda_v[f],
                &self.priors,
            ) {
                Some((mu, lambda)) => {
                    self.hyper.mu_v[f] = mu;
                    self.hyper.lambda_v[f] = lambda;
                }
                None => return Err(self.instability(format!("lambda_v[{f}]"))),
            }
        }
        Ok(())
    }
}

impl TrainingStep for GibbsSampler {
    fn step(&mut self, x: &SparseDesignMatrix) -> Result<StepOutcome, TrainingError> {
        self.iteration += 1;

        // --- Hyperparameters given the current sample ---
        let scores = predict_scores(&self.state, x);
        let mut cache = ResidualCache::from_predictions(&scores, self.current_targets());
        self.sample_hyperparameters(cache.weighted_sum_of_squares(None))?;

        // --- Model parameters, one full conditional at a time ---
        let mut rule = GibbsRule::new(&mut self.rng, &self.hyper, self.bias_precision);
        let swept = sweep::sweep(x, None, &mut self.state, &mut cache, &mut rule, self.scope);
        let clamped = rule.clamped();
        if let Err(parameter) = swept {
            return Err(self.instability(parameter.to_string()));
        }
        if clamped > 0 {
            log::warn!(
                "MCMC iteration {}: {} conditional variances clamped to {:e}.",
                self.iteration,
                clamped,
                MIN_VARIANCE
            );
        }

        // --- Loss, trace and posterior accumulation ---
        let predictions = cache.predictions(self.current_targets());
        let (loss, outputs) = match &self.targets {
            Targets::Observed(y) => {
                let mse = (&predictions - y).mapv(|e| e * e).mean().unwrap_or(0.0);
                (mse, predictions.clone())
            }
            Targets::Latent { labels, .. } => {
                let probabilities = predictions.mapv(predict::standard_normal_cdf);
                (link::log_loss(labels, &probabilities, None), probabilities)
            }
        };
        if !loss.is_finite() {
            let parameter = self
                .state
                .first_non_finite()
                .map_or_else(|| "training predictions".to_string(), |p| p.to_string());
            return Err(self.instability(parameter));
        }

        self.trace.push(TraceRecord {
            iteration: self.iteration,
            loss,
            alpha: self.hyper.alpha,
            lambda_w: self.hyper.lambda_w,
            mu_w: self.hyper.mu_w,
            lambda_v: self.hyper.lambda_v.clone(),
            mu_v: self.hyper.mu_v.clone(),
        });

        if self.iteration > self.burn_in {
            self.accumulator.add(&self.state, &outputs);
        }
        self.last_predictions = outputs;

        // --- Latent targets for the next iteration ---
        if let Targets::Latent { labels, latent } = &mut self.targets {
            link::resample_latent_targets(&mut self.rng, labels, &predictions, latent);
        }

        log::debug!(
            "MCMC iteration {}: training loss {:.6e}, alpha {:.4e}",
            self.iteration,
            loss,
            self.hyper.alpha
        );

        Ok(StepOutcome {
            loss,
            converged: false,
            retained_samples: self.accumulator.count(),
        })
    }

    fn state(&self) -> &ModelState {
        &self.state
    }

    fn into_output(self, status: FitStatus) -> (ModelState, Option<PosteriorOutput>) {
        let retained_samples = self.accumulator.count();
        let (state, training_predictions) = if retained_samples > 0 {
            (
                self.accumulator.mean_state().clone(),
                self.accumulator.mean_predictions().to_vec(),
            )
        } else {
            log::warn!(
                "Sampling ended ({:?}) before any sample was retained; returning the last sample instead of a posterior mean.",
                status
            );
            (self.state, self.last_predictions.to_vec())
        };
        let posterior = PosteriorOutput {
            retained_samples,
            training_predictions,
            hyperparameters: self.hyper,
            trace: self.trace,
        };
        (state, Some(posterior))
    }
}
