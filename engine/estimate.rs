//! Fit entry points.
//!
//! All input is validated before the first iteration runs: configuration,
//! shapes, targets, weights and labels. A failed fit leaves every existing
//! [`FittedModel`] untouched.

use crate::als::{AlsObjective, AlsSolver};
use crate::callback::{FitObserver, IterationReport, NoopObserver};
use crate::config::{ConfigError, FitConfig, SolverKind, Task};
use crate::link::{BinaryLabels, LabelError};
use crate::matrix::{ShapeError, SparseDesignMatrix};
use crate::mcmc::{GibbsSampler, McmcObjective, PosteriorOutput};
use crate::model::{FitStatus, FitSummary, FittedModel, ModelState};
use ndarray::{Array1, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Invalid input shape: {0}")]
    Shape(#[from] ShapeError),
    #[error("Invalid label: {0}")]
    Label(#[from] LabelError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(
        "Training became numerically unstable in iteration {iteration}: {parameter} is no longer finite."
    )]
    NumericInstability { iteration: usize, parameter: String },
    #[error("The estimator has not been fitted yet.")]
    NotFitted,
}

/// Result of one solver iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub loss: f64,
    pub converged: bool,
    pub retained_samples: usize,
}

/// One solver iteration at a time, driven by [`fit_with_observer`].
pub trait TrainingStep {
    fn step(&mut self, x: &SparseDesignMatrix) -> Result<StepOutcome, TrainingError>;

    /// The parameters after the latest iteration (the raw sample for MCMC).
    fn state(&self) -> &ModelState;

    /// Consumes the solver and returns the final model state and sampler output.
    fn into_output(self, status: FitStatus) -> (ModelState, Option<PosteriorOutput>)
    where
        Self: Sized;
}

/// The solver chosen for a fit. Selected once at fit entry.
pub enum Solver {
    Als(AlsSolver),
    Mcmc(GibbsSampler),
}

impl TrainingStep for Solver {
    fn step(&mut self, x: &SparseDesignMatrix) -> Result<StepOutcome, TrainingError> {
        match self {
            Solver::Als(solver) => solver.step(x),
            Solver::Mcmc(sampler) => sampler.step(x),
        }
    }

    fn state(&self) -> &ModelState {
        match self {
            Solver::Als(solver) => solver.state(),
            Solver::Mcmc(sampler) => sampler.state(),
        }
    }

    fn into_output(self, status: FitStatus) -> (ModelState, Option<PosteriorOutput>) {
        match self {
            Solver::Als(solver) => solver.into_output(status),
            Solver::Mcmc(sampler) => sampler.into_output(status),
        }
    }
}

/// Trains a model on `x` and `y` with the given configuration.
pub fn fit(
    x: &SparseDesignMatrix,
    y: ArrayView1<f64>,
    config: &FitConfig,
) -> Result<FittedModel, TrainingError> {
    fit_with_observer(x, y, None, config, None, &mut NoopObserver)
}

/// Like [`fit`], with one non-negative weight per row (ALS only).
pub fn fit_weighted(
    x: &SparseDesignMatrix,
    y: ArrayView1<f64>,
    sample_weights: ArrayView1<f64>,
    config: &FitConfig,
) -> Result<FittedModel, TrainingError> {
    fit_with_observer(x, y, Some(sample_weights), config, None, &mut NoopObserver)
}

/// Continues training from a copy of `initial`; `initial` itself is not modified.
pub fn fit_from(
    initial: &FittedModel,
    x: &SparseDesignMatrix,
    y: ArrayView1<f64>,
    config: &FitConfig,
) -> Result<FittedModel, TrainingError> {
    fit_with_observer(x, y, None, config, Some(initial), &mut NoopObserver)
}

/// Scores (regression) or labels (classification) for every row of `x`.
pub fn predict(model: &FittedModel, x: &SparseDesignMatrix) -> Result<Array1<f64>, TrainingError> {
    Ok(model.predict(x)?)
}

fn validate_inputs(
    x: &SparseDesignMatrix,
    y: ArrayView1<f64>,
    weights: Option<ArrayView1<f64>>,
    config: &FitConfig,
    initial: Option<&FittedModel>,
) -> Result<Option<BinaryLabels>, TrainingError> {
    config.validate()?;

    if x.rows() == 0 {
        return Err(ShapeError::EmptyDesign.into());
    }
    if y.len() != x.rows() {
        return Err(ShapeError::TargetLengthMismatch {
            expected: x.rows(),
            found: y.len(),
        }
        .into());
    }
    if let Some((row, &value)) = y.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(ShapeError::NonFiniteTarget { row, value }.into());
    }

    if let Some(weights) = weights {
        if config.solver == SolverKind::Mcmc {
            return Err(ConfigError::WeightsUnsupported.into());
        }
        if weights.len() != x.rows() {
            return Err(ShapeError::WeightLengthMismatch {
                expected: x.rows(),
                found: weights.len(),
            }
            .into());
        }
        if let Some((row, &value)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(ShapeError::InvalidWeight { row, value }.into());
        }
        if weights.sum() <= 0.0 {
            return Err(ShapeError::ZeroTotalWeight.into());
        }
    }

    if let Some(model) = initial {
        if model.task() != config.task {
            return Err(ConfigError::WarmStartTask {
                model_task: model.task(),
                task: config.task,
            }
            .into());
        }
        if model.n_features() != x.cols() {
            return Err(ShapeError::FeatureCountMismatch {
                expected: model.n_features(),
                found: x.cols(),
            }
            .into());
        }
        if model.rank() != config.rank {
            return Err(ConfigError::WarmStartRank {
                model_rank: model.rank(),
                rank: config.rank,
            }
            .into());
        }
    }

    match config.task {
        Task::Regression => Ok(None),
        Task::Classification => Ok(Some(BinaryLabels::from_targets(y, config.label_encoding)?)),
    }
}

/// The general entry point: optional sample weights, optional warm start, and
/// an observer called after every iteration that may stop the fit.
pub fn fit_with_observer<O>(
    x: &SparseDesignMatrix,
    y: ArrayView1<f64>,
    sample_weights: Option<ArrayView1<f64>>,
    config: &FitConfig,
    initial: Option<&FittedModel>,
    observer: &mut O,
) -> Result<FittedModel, TrainingError>
where
    O: FitObserver + ?Sized,
{
    // --- Validate everything before touching the data ---
    let labels = validate_inputs(x, y, sample_weights, config, initial)?;

    log::info!(
        "Fitting {} FM ({} solver, rank {}) on {} rows x {} features ({} nonzeros) for up to {} iterations.",
        config.task,
        config.solver,
        config.rank,
        x.rows(),
        x.cols(),
        x.nnz(),
        config.n_iterations
    );

    // --- Initial state and solver selection ---
    let mut rng = StdRng::seed_from_u64(config.effective_seed());
    let state = match initial {
        Some(model) => {
            log::info!("Warm-starting from an existing model.");
            model.state().clone()
        }
        None => ModelState::initialize(x.cols(), config.rank, config.init_stdev, &mut rng),
    };

    let mut solver = match (config.solver, labels) {
        (SolverKind::Als, None) => Solver::Als(AlsSolver::new(
            state,
            AlsObjective::Regression(y.to_owned()),
            sample_weights.map(|w| w.to_owned()),
            config,
        )),
        (SolverKind::Als, Some(labels)) => Solver::Als(AlsSolver::new(
            state,
            AlsObjective::Classification(labels),
            sample_weights.map(|w| w.to_owned()),
            config,
        )),
        (SolverKind::Mcmc, None) => Solver::Mcmc(GibbsSampler::new(
            state,
            McmcObjective::Regression(y.to_owned()),
            x,
            config,
            rng,
        )),
        (SolverKind::Mcmc, Some(labels)) => Solver::Mcmc(GibbsSampler::new(
            state,
            McmcObjective::Classification(labels),
            x,
            config,
            rng,
        )),
    };

    // --- Main loop ---
    let mut status = FitStatus::MaxIterationsReached;
    let mut iterations = 0;
    let mut final_loss = f64::NAN;
    for iteration in 1..=config.n_iterations {
        let outcome = solver.step(x)?;
        iterations = iteration;
        final_loss = outcome.loss;

        let report = IterationReport {
            iteration,
            n_iterations: config.n_iterations,
            loss: outcome.loss,
            retained_samples: outcome.retained_samples,
        };
        let flow = observer.on_iteration(&report);
        if outcome.converged {
            status = FitStatus::Converged;
            break;
        }
        if flow.is_break() {
            status = FitStatus::Cancelled;
            break;
        }
    }

    log::info!(
        "Fit finished after {} iterations ({:?}); training loss {:.6e}.",
        iterations,
        status,
        final_loss
    );

    let (state, posterior) = solver.into_output(status);
    let summary = FitSummary {
        status,
        iterations,
        final_loss,
    };
    Ok(FittedModel::new(
        config.task,
        config.solver,
        config.label_encoding,
        summary,
        state,
        posterior,
    ))
}
