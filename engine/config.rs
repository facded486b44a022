use crate::link::LabelEncoding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which training strategy estimates the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Alternating least squares coordinate descent.
    #[default]
    Als,
    /// Gibbs sampling with Normal-Gamma hyperpriors.
    Mcmc,
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverKind::Als => write!(f, "als"),
            SolverKind::Mcmc => write!(f, "mcmc"),
        }
    }
}

impl FromStr for SolverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "als" | "cd" => Ok(SolverKind::Als),
            "mcmc" => Ok(SolverKind::Mcmc),
            _ => Err(ConfigError::UnknownSolver(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Regression,
    Classification,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Regression => write!(f, "regression"),
            Task::Classification => write!(f, "classification"),
        }
    }
}

/// Independent L2 penalties. For MCMC the linear and factor values are the
/// initial precisions of the respective hyperpriors and the bias value is the
/// fixed prior precision of `w0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Regularization {
    pub bias: f64,
    pub linear: f64,
    pub factor: f64,
    /// Optional override of `factor`, one value per factor column.
    pub per_factor: Vec<f64>,
}

impl Default for Regularization {
    fn default() -> Self {
        Self {
            bias: 0.0,
            linear: 0.1,
            factor: 0.1,
            per_factor: Vec::new(),
        }
    }
}

impl Regularization {
    /// Penalty for factor column `f`.
    pub fn factor_penalty(&self, f: usize) -> f64 {
        self.per_factor.get(f).copied().unwrap_or(self.factor)
    }
}

/// Normal-Gamma hyperprior constants for the Gibbs sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McmcPriors {
    /// Shape and rate of the Gamma prior on the noise precision `α`.
    pub alpha_0: f64,
    pub beta_0: f64,
    /// Shape and rate of the Gamma prior on group precisions `λ`.
    pub alpha_lambda: f64,
    pub beta_lambda: f64,
    /// Pseudo-count and location of the Normal prior on group means `μ`.
    pub gamma_0: f64,
    pub mu_0: f64,
}

impl Default for McmcPriors {
    fn default() -> Self {
        Self {
            alpha_0: 1.0,
            beta_0: 1.0,
            alpha_lambda: 1.0,
            beta_lambda: 1.0,
            gamma_0: 1.0,
            mu_0: 0.0,
        }
    }
}

/// Everything a fit needs besides the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub solver: SolverKind,
    pub task: Task,
    /// Embedding rank `k`. Zero fits a linear model.
    pub rank: usize,
    pub n_iterations: usize,
    /// MCMC only: leading iterations excluded from the posterior mean.
    pub burn_in: usize,
    pub seed: Option<u64>,
    pub init_stdev: f64,
    /// ALS only: damping factor applied to every closed-form update.
    pub step_size: f64,
    /// ALS only: stop once the relative change of the training loss drops below this.
    pub tolerance: Option<f64>,
    pub label_encoding: LabelEncoding,
    pub fit_bias: bool,
    pub fit_linear: bool,
    pub regularization: Regularization,
    pub priors: McmcPriors,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            solver: SolverKind::Als,
            task: Task::Regression,
            rank: 8,
            n_iterations: 100,
            burn_in: 0,
            seed: Some(123),
            init_stdev: 0.1,
            step_size: 1.0,
            tolerance: None,
            label_encoding: LabelEncoding::ZeroOne,
            fit_bias: true,
            fit_linear: true,
            regularization: Regularization::default(),
            priors: McmcPriors::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("n_iterations must be greater than zero.")]
    ZeroIterations,
    #[error("burn_in ({burn_in}) must be smaller than n_iterations ({n_iterations}).")]
    BurnInTooLarge { burn_in: usize, n_iterations: usize },
    #[error("Regularization '{name}' is {value}; penalties must be finite and non-negative.")]
    NegativeRegularization { name: String, value: f64 },
    #[error(
        "MCMC uses regularization '{name}' as an initial precision, so it must be strictly positive (got {value})."
    )]
    NonPositivePrecision { name: String, value: f64 },
    #[error("per_factor has {found} entries but the rank is {rank}.")]
    PerFactorLength { found: usize, rank: usize },
    #[error("init_stdev must be finite and non-negative, got {0}.")]
    InvalidInitStdev(f64),
    #[error("step_size must lie in (0, 1], got {0}.")]
    InvalidStepSize(f64),
    #[error("tolerance must be finite and positive, got {0}.")]
    InvalidTolerance(f64),
    #[error("Prior constant '{name}' is {value}; it must be finite and positive.")]
    InvalidPrior { name: String, value: f64 },
    #[error("Unknown solver '{0}'. Expected 'als' or 'mcmc'.")]
    UnknownSolver(String),
    #[error("Sample weights are only supported by the ALS solver.")]
    WeightsUnsupported,
    #[error("Warm start model has rank {model_rank}, but the configuration asks for rank {rank}.")]
    WarmStartRank { model_rank: usize, rank: usize },
    #[error("Warm start model was trained for {model_task}, but the configuration asks for {task}.")]
    WarmStartTask { model_task: Task, task: Task },
    #[error("The {0} task is not available in this build.")]
    TaskUnavailable(Task),
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl FitConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// The seed actually used; `None` falls back to the default seed so that
    /// fits stay reproducible.
    pub fn effective_seed(&self) -> u64 {
        self.seed.unwrap_or(123)
    }

    /// Checks every option that can be checked without the data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.task {
            Task::Regression if !cfg!(feature = "regression") => {
                return Err(ConfigError::TaskUnavailable(self.task));
            }
            Task::Classification if !cfg!(feature = "classification") => {
                return Err(ConfigError::TaskUnavailable(self.task));
            }
            _ => {}
        }
        if self.n_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.solver == SolverKind::Mcmc && self.burn_in >= self.n_iterations {
            return Err(ConfigError::BurnInTooLarge {
                burn_in: self.burn_in,
                n_iterations: self.n_iterations,
            });
        }
        if !self.init_stdev.is_finite() || self.init_stdev < 0.0 {
            return Err(ConfigError::InvalidInitStdev(self.init_stdev));
        }
        if !(self.step_size > 0.0 && self.step_size <= 1.0) {
            return Err(ConfigError::InvalidStepSize(self.step_size));
        }
        if let Some(tol) = self.tolerance {
            if !tol.is_finite() || tol <= 0.0 {
                return Err(ConfigError::InvalidTolerance(tol));
            }
        }

        let reg = &self.regularization;
        if !reg.per_factor.is_empty() && reg.per_factor.len() != self.rank {
            return Err(ConfigError::PerFactorLength {
                found: reg.per_factor.len(),
                rank: self.rank,
            });
        }
        let mut penalties = vec![
            ("bias".to_string(), reg.bias),
            ("linear".to_string(), reg.linear),
            ("factor".to_string(), reg.factor),
        ];
        penalties.extend(
            reg.per_factor
                .iter()
                .enumerate()
                .map(|(f, &value)| (format!("per_factor[{f}]"), value)),
        );
        for (name, value) in &penalties {
            if !value.is_finite() || *value < 0.0 {
                return Err(ConfigError::NegativeRegularization {
                    name: name.clone(),
                    value: *value,
                });
            }
        }

        if self.solver == SolverKind::Mcmc {
            // The bias prior may be flat; the group precisions seed the sampler.
            for (name, value) in penalties.iter().skip(1) {
                if *value <= 0.0 {
                    return Err(ConfigError::NonPositivePrecision {
                        name: name.clone(),
                        value: *value,
                    });
                }
            }
            let p = &self.priors;
            let positive = [
                ("alpha_0", p.alpha_0),
                ("beta_0", p.beta_0),
                ("alpha_lambda", p.alpha_lambda),
                ("beta_lambda", p.beta_lambda),
                ("gamma_0", p.gamma_0),
            ];
            for (name, value) in positive {
                if !value.is_finite() || value <= 0.0 {
                    return Err(ConfigError::InvalidPrior {
                        name: name.to_string(),
                        value,
                    });
                }
            }
            if !p.mu_0.is_finite() {
                return Err(ConfigError::InvalidPrior {
                    name: "mu_0".to_string(),
                    value: p.mu_0,
                });
            }
        }
        Ok(())
    }
}
