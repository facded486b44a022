#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod als;
pub mod callback;
pub mod config;
pub mod data;
pub mod estimate;
pub mod estimator;
pub mod link;
pub mod matrix;
pub mod mcmc;
pub mod model;
pub mod predict;
pub mod sweep;

pub use config::{ConfigError, FitConfig, McmcPriors, Regularization, SolverKind, Task};
pub use estimate::{TrainingError, fit, fit_weighted, fit_with_observer, predict};
pub use estimator::{supports_classification, supports_regression};
#[cfg(feature = "classification")]
pub use estimator::FmClassification;
#[cfg(feature = "regression")]
pub use estimator::FmRegression;
pub use link::LabelEncoding;
pub use matrix::{ShapeError, SparseDesignMatrix};
pub use model::{FitStatus, FittedModel, LinkFunction, ModelState};
