use crate::config::{SolverKind, Task};
use crate::link::LabelEncoding;
use crate::matrix::{ShapeError, SparseDesignMatrix};
use crate::mcmc::PosteriorOutput;
use crate::predict;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Defines the link function, connecting the FM score to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFunction {
    /// The identity link, for continuous outcomes (regression).
    Identity,
    /// The logit link. ALS classification fits a logistic model, so its
    /// probabilities are `sigmoid(score)`.
    Logit,
    /// The probit link. MCMC classification samples Gaussian latent targets,
    /// so its probabilities are `Φ(score)`.
    Probit,
}

impl LinkFunction {
    /// Maps a score onto the response scale.
    pub fn inverse(&self, score: f64) -> f64 {
        match self {
            LinkFunction::Identity => score,
            LinkFunction::Logit => predict::sigmoid(score),
            LinkFunction::Probit => predict::standard_normal_cdf(score),
        }
    }
}

/// The FM parameter set: bias `w0`, linear weights `w` (length `p`) and the
/// pairwise factor matrix `V` (shape `p x k`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub w0: f64,
    pub w: Array1<f64>,
    pub v: Array2<f64>,
}

impl ModelState {
    /// All-zero state. With `rank == 0` this is a plain linear model.
    pub fn zeros(n_features: usize, rank: usize) -> Self {
        Self {
            w0: 0.0,
            w: Array1::zeros(n_features),
            v: Array2::zeros((n_features, rank)),
        }
    }

    /// Zero bias and linear weights; factors drawn from `N(0, init_stdev^2)`.
    ///
    /// Factors are filled one factor column at a time so the draw order does
    /// not depend on the memory layout of `V`.
    pub fn initialize<R: Rng + ?Sized>(
        n_features: usize,
        rank: usize,
        init_stdev: f64,
        rng: &mut R,
    ) -> Self {
        let mut state = Self::zeros(n_features, rank);
        if init_stdev > 0.0 {
            for f in 0..rank {
                for j in 0..n_features {
                    let z: f64 = rng.sample(StandardNormal);
                    state.v[[j, f]] = init_stdev * z;
                }
            }
        }
        state
    }

    pub fn n_features(&self) -> usize {
        self.w.len()
    }

    pub fn rank(&self) -> usize {
        self.v.ncols()
    }

    /// Locates the first non-finite parameter, scanning bias, linear, then factors.
    pub fn first_non_finite(&self) -> Option<ParameterId> {
        if !self.w0.is_finite() {
            return Some(ParameterId::Bias);
        }
        if let Some(j) = self.w.iter().position(|w| !w.is_finite()) {
            return Some(ParameterId::Linear(j));
        }
        self.v
            .indexed_iter()
            .find(|(_, v)| !v.is_finite())
            .map(|((feature, factor), _)| ParameterId::Factor { feature, factor })
    }
}

/// Identifies a single FM parameter, used when reporting numeric failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterId {
    Bias,
    Linear(usize),
    Factor { feature: usize, factor: usize },
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterId::Bias => write!(f, "w0"),
            ParameterId::Linear(j) => write!(f, "w[{j}]"),
            ParameterId::Factor { feature, factor } => write!(f, "V[{feature}, {factor}]"),
        }
    }
}

/// How a fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// The relative change of the training loss fell below the tolerance.
    Converged,
    /// The iteration budget was spent.
    MaxIterationsReached,
    /// An observer stopped the fit at an iteration boundary.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub status: FitStatus,
    pub iterations: usize,
    /// Training loss after the last completed iteration (MSE for regression,
    /// mean log-loss for classification).
    pub final_loss: f64,
}

/// Custom error type for model loading and saving.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model file is inconsistent: {0}")]
    Inconsistent(String),
}

/// The read-only artifact returned by a successful fit.
///
/// For ALS this is the final coordinate-descent state. For MCMC the state is
/// the posterior mean over retained samples, and `posterior` carries the
/// sampler's trace and averaged training predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    task: Task,
    solver: SolverKind,
    link: LinkFunction,
    label_encoding: LabelEncoding,
    summary: FitSummary,
    state: ModelState,
    #[serde(default)]
    posterior: Option<PosteriorOutput>,
}

impl FittedModel {
    pub(crate) fn new(
        task: Task,
        solver: SolverKind,
        label_encoding: LabelEncoding,
        summary: FitSummary,
        state: ModelState,
        posterior: Option<PosteriorOutput>,
    ) -> Self {
        let link = match (task, solver) {
            (Task::Regression, _) => LinkFunction::Identity,
            (Task::Classification, SolverKind::Als) => LinkFunction::Logit,
            (Task::Classification, SolverKind::Mcmc) => LinkFunction::Probit,
        };
        Self {
            task,
            solver,
            link,
            label_encoding,
            summary,
            state,
            posterior,
        }
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn solver(&self) -> SolverKind {
        self.solver
    }

    pub fn link(&self) -> LinkFunction {
        self.link
    }

    pub fn label_encoding(&self) -> LabelEncoding {
        self.label_encoding
    }

    pub fn summary(&self) -> &FitSummary {
        &self.summary
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn bias(&self) -> f64 {
        self.state.w0
    }

    pub fn linear_weights(&self) -> &Array1<f64> {
        &self.state.w
    }

    pub fn factors(&self) -> &Array2<f64> {
        &self.state.v
    }

    pub fn rank(&self) -> usize {
        self.state.rank()
    }

    pub fn n_features(&self) -> usize {
        self.state.n_features()
    }

    /// Sampler output; `None` for ALS fits.
    pub fn posterior(&self) -> Option<&PosteriorOutput> {
        self.posterior.as_ref()
    }

    /// Raw FM scores, one per row of `x`.
    pub fn predict_scores(&self, x: &SparseDesignMatrix) -> Result<Array1<f64>, ShapeError> {
        self.check_columns(x)?;
        Ok(predict::predict_scores(&self.state, x))
    }

    /// Scores mapped through the inverse link. For classification these are
    /// probabilities of the positive class; for regression they equal the scores.
    pub fn predict_proba(&self, x: &SparseDesignMatrix) -> Result<Array1<f64>, ShapeError> {
        let link = self.link;
        Ok(self.predict_scores(x)?.mapv_into(|s| link.inverse(s)))
    }

    /// Regression: scores. Classification: labels in the training encoding,
    /// thresholding the probability at 0.5.
    pub fn predict(&self, x: &SparseDesignMatrix) -> Result<Array1<f64>, ShapeError> {
        match self.task {
            Task::Regression => self.predict_scores(x),
            Task::Classification => {
                let encoding = self.label_encoding;
                Ok(self
                    .predict_proba(x)?
                    .mapv_into(|p| encoding.decode(p >= 0.5)))
            }
        }
    }

    fn check_columns(&self, x: &SparseDesignMatrix) -> Result<(), ShapeError> {
        if x.cols() != self.n_features() {
            return Err(ShapeError::FeatureCountMismatch {
                expected: self.n_features(),
                found: x.cols(),
            });
        }
        Ok(())
    }

    /// Saves the fitted model to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        if model.state.v.nrows() != model.state.w.len() {
            return Err(ModelError::Inconsistent(format!(
                "factor matrix has {} rows but there are {} linear weights",
                model.state.v.nrows(),
                model.state.w.len()
            )));
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn summary() -> FitSummary {
        FitSummary {
            status: FitStatus::MaxIterationsReached,
            iterations: 3,
            final_loss: 0.25,
        }
    }

    fn example_state() -> ModelState {
        ModelState {
            w0: 2.0,
            w: array![9.0, 8.0, 7.0],
            v: array![[6.0, 5.0], [0.0, 1.0], [2.0, 0.0]],
        }
    }

    fn example_matrix() -> SparseDesignMatrix {
        SparseDesignMatrix::from_dense(
            array![
                [1.0, 2.0, 0.0],
                [0.0, 3.0, 0.0],
                [4.0, 0.0, 2.0],
                [4.0, 5.0, 0.0]
            ]
            .view(),
        )
        .unwrap()
    }

    #[test]
    fn initialization_is_seeded_and_zero_for_linear_terms() {
        let a = ModelState::initialize(5, 3, 0.1, &mut StdRng::seed_from_u64(7));
        let b = ModelState::initialize(5, 3, 0.1, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.w0, 0.0);
        assert!(a.w.iter().all(|&w| w == 0.0));
        assert!(a.v.iter().any(|&v| v != 0.0));
        assert!(a.v.iter().all(|v| v.abs() < 1.0));

        let flat = ModelState::initialize(4, 2, 0.0, &mut StdRng::seed_from_u64(7));
        assert!(flat.v.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn rank_zero_state_has_empty_factor_matrix() {
        let state = ModelState::zeros(4, 0);
        assert_eq!(state.rank(), 0);
        assert_eq!(state.n_features(), 4);
        assert_eq!(state.v.dim(), (4, 0));
    }

    #[test]
    fn first_non_finite_reports_parameter() {
        let mut state = example_state();
        assert_eq!(state.first_non_finite(), None);
        state.v[[2, 1]] = f64::INFINITY;
        assert_eq!(
            state.first_non_finite(),
            Some(ParameterId::Factor { feature: 2, factor: 1 })
        );
        state.w[1] = f64::NAN;
        assert_eq!(state.first_non_finite(), Some(ParameterId::Linear(1)));
        assert_eq!(ParameterId::Linear(1).to_string(), "w[1]");
    }

    #[test]
    fn regression_model_predicts_reference_scores() {
        let model = FittedModel::new(
            Task::Regression,
            SolverKind::Als,
            LabelEncoding::ZeroOne,
            summary(),
            example_state(),
            None,
        );
        let scores = model.predict(&example_matrix()).unwrap();
        assert_eq!(scores, array![37.0, 26.0, 148.0, 178.0]);
        assert_eq!(model.link(), LinkFunction::Identity);
    }

    #[test]
    fn classification_labels_follow_encoding() {
        let state = ModelState {
            w0: 0.0,
            w: array![1.0, -1.0],
            v: Array2::zeros((2, 0)),
        };
        let x = SparseDesignMatrix::from_dense(array![[2.0, 0.0], [0.0, 2.0]].view()).unwrap();

        let model = FittedModel::new(
            Task::Classification,
            SolverKind::Als,
            LabelEncoding::PlusMinusOne,
            summary(),
            state.clone(),
            None,
        );
        assert_eq!(model.link(), LinkFunction::Logit);
        assert_eq!(model.predict(&x).unwrap(), array![1.0, -1.0]);
        let proba = model.predict_proba(&x).unwrap();
        assert!(proba[0] > 0.85 && proba[1] < 0.15);

        let probit = FittedModel::new(
            Task::Classification,
            SolverKind::Mcmc,
            LabelEncoding::ZeroOne,
            summary(),
            state,
            None,
        );
        assert_eq!(probit.link(), LinkFunction::Probit);
        assert_eq!(probit.predict(&x).unwrap(), array![1.0, 0.0]);
    }

    #[test]
    fn column_mismatch_is_rejected() {
        let model = FittedModel::new(
            Task::Regression,
            SolverKind::Als,
            LabelEncoding::ZeroOne,
            summary(),
            example_state(),
            None,
        );
        let x = SparseDesignMatrix::from_triplets(1, 2, vec![(0, 0, 1.0)]).unwrap();
        assert_eq!(
            model.predict(&x).unwrap_err(),
            ShapeError::FeatureCountMismatch { expected: 3, found: 2 }
        );
    }

    #[test]
    fn toml_round_trip_preserves_model() {
        let model = FittedModel::new(
            Task::Regression,
            SolverKind::Als,
            LabelEncoding::ZeroOne,
            summary(),
            example_state(),
            None,
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let path = path.to_str().unwrap();
        model.save(path).unwrap();
        let loaded = FittedModel::load(path).unwrap();
        assert_eq!(loaded, model);
    }
}
