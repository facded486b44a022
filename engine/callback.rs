//! Hooks invoked between solver iterations.
//!
//! An observer sees an [`IterationReport`] after every completed iteration and
//! may stop the fit by returning [`ControlFlow::Break`]. Iterations are never
//! interrupted part-way, so the model is always in a consistent state.

use std::ops::ControlFlow;

/// Progress after one completed iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationReport {
    /// 1-based index of the iteration that just finished.
    pub iteration: usize,
    pub n_iterations: usize,
    /// Training loss of the current parameters (the raw sample for MCMC).
    pub loss: f64,
    /// Number of MCMC samples folded into the posterior mean so far. Always 0 for ALS.
    pub retained_samples: usize,
}

pub trait FitObserver {
    fn on_iteration(&mut self, report: &IterationReport) -> ControlFlow<()>;
}

impl<F> FitObserver for F
where
    F: FnMut(&IterationReport) -> ControlFlow<()>,
{
    fn on_iteration(&mut self, report: &IterationReport) -> ControlFlow<()> {
        self(report)
    }
}

/// Observer that never stops a fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl FitObserver for NoopObserver {
    fn on_iteration(&mut self, _report: &IterationReport) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Stops a fit once the training loss has not improved by more than
/// `min_delta` for `patience` consecutive iterations.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best_loss: Option<f64>,
    best_iteration: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: None,
            best_iteration: 0,
        }
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    pub fn best_iteration(&self) -> usize {
        self.best_iteration
    }
}

impl FitObserver for EarlyStopping {
    fn on_iteration(&mut self, report: &IterationReport) -> ControlFlow<()> {
        let improved = match self.best_loss {
            None => true,
            Some(best) => report.loss < best - self.min_delta,
        };
        if improved {
            self.best_loss = Some(report.loss);
            self.best_iteration = report.iteration;
        }
        if report.iteration - self.best_iteration >= self.patience {
            log::info!(
                "Training loss has not improved for {} iterations (best {:.6} at iteration {}); stopping.",
                self.patience,
                self.best_loss.unwrap_or(report.loss),
                self.best_iteration
            );
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}
