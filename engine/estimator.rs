//! Estimator-style wrappers: configuration plus the most recent fitted model.
//!
//! The wrapped model is replaced only when a fit succeeds.

#[cfg(any(feature = "regression", feature = "classification"))]
use crate::config::{FitConfig, SolverKind, Task};
#[cfg(any(feature = "regression", feature = "classification"))]
use crate::estimate::{self, TrainingError};
#[cfg(any(feature = "regression", feature = "classification"))]
use crate::matrix::SparseDesignMatrix;
#[cfg(any(feature = "regression", feature = "classification"))]
use crate::model::FittedModel;
#[cfg(any(feature = "regression", feature = "classification"))]
use ndarray::{Array1, ArrayView1};

/// Whether this build can fit regression models.
pub fn supports_regression() -> bool {
    cfg!(feature = "regression")
}

/// Whether this build can fit binary classification models.
pub fn supports_classification() -> bool {
    cfg!(feature = "classification")
}

#[cfg(feature = "regression")]
#[derive(Debug, Clone)]
pub struct FmRegression {
    config: FitConfig,
    model: Option<FittedModel>,
}

#[cfg(feature = "regression")]
impl FmRegression {
    pub fn new(config: FitConfig) -> Self {
        Self {
            config: FitConfig {
                task: Task::Regression,
                ..config
            },
            model: None,
        }
    }

    pub fn als(rank: usize, n_iterations: usize) -> Self {
        Self::new(FitConfig {
            solver: SolverKind::Als,
            rank,
            n_iterations,
            ..FitConfig::default()
        })
    }

    pub fn mcmc(rank: usize, n_iterations: usize, burn_in: usize) -> Self {
        Self::new(FitConfig {
            solver: SolverKind::Mcmc,
            rank,
            n_iterations,
            burn_in,
            ..FitConfig::default()
        })
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn model(&self) -> Option<&FittedModel> {
        self.model.as_ref()
    }

    pub fn fit(
        &mut self,
        x: &SparseDesignMatrix,
        y: ArrayView1<f64>,
    ) -> Result<&FittedModel, TrainingError> {
        let model = estimate::fit(x, y, &self.config)?;
        Ok(&*self.model.insert(model))
    }

    pub fn fit_weighted(
        &mut self,
        x: &SparseDesignMatrix,
        y: ArrayView1<f64>,
        sample_weights: ArrayView1<f64>,
    ) -> Result<&FittedModel, TrainingError> {
        let model = estimate::fit_weighted(x, y, sample_weights, &self.config)?;
        Ok(&*self.model.insert(model))
    }

    pub fn predict(&self, x: &SparseDesignMatrix) -> Result<Array1<f64>, TrainingError> {
        let model = self.model.as_ref().ok_or(TrainingError::NotFitted)?;
        estimate::predict(model, x)
    }
}

#[cfg(feature = "classification")]
#[derive(Debug, Clone)]
pub struct FmClassification {
    config: FitConfig,
    model: Option<FittedModel>,
}

#[cfg(feature = "classification")]
impl FmClassification {
    pub fn new(config: FitConfig) -> Self {
        Self {
            config: FitConfig {
                task: Task::Classification,
                ..config
            },
            model: None,
        }
    }

    pub fn als(rank: usize, n_iterations: usize) -> Self {
        Self::new(FitConfig {
            solver: SolverKind::Als,
            rank,
            n_iterations,
            ..FitConfig::default()
        })
    }

    pub fn mcmc(rank: usize, n_iterations: usize, burn_in: usize) -> Self {
        Self::new(FitConfig {
            solver: SolverKind::Mcmc,
            rank,
            n_iterations,
            burn_in,
            ..FitConfig::default()
        })
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn model(&self) -> Option<&FittedModel> {
        self.model.as_ref()
    }

    pub fn fit(
        &mut self,
        x: &SparseDesignMatrix,
        y: ArrayView1<f64>,
    ) -> Result<&FittedModel, TrainingError> {
        let model = estimate::fit(x, y, &self.config)?;
        Ok(&*self.model.insert(model))
    }

    /// Labels in the configured encoding.
    pub fn predict(&self, x: &SparseDesignMatrix) -> Result<Array1<f64>, TrainingError> {
        let model = self.model.as_ref().ok_or(TrainingError::NotFitted)?;
        estimate::predict(model, x)
    }

    /// Probability of the positive class for every row.
    pub fn predict_proba(&self, x: &SparseDesignMatrix) -> Result<Array1<f64>, TrainingError> {
        let model = self.model.as_ref().ok_or(TrainingError::NotFitted)?;
        Ok(model.predict_proba(x)?)
    }
}
