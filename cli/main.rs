use clap::{Parser, Subcommand, ValueEnum};
use fmsolve::callback::{EarlyStopping, FitObserver, IterationReport};
use fmsolve::data::load_svmlight;
use fmsolve::estimate::fit_with_observer;
use fmsolve::{FitConfig, FittedModel, LabelEncoding, SolverKind, Task};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array1;
use std::ops::ControlFlow;
use std::process;

#[derive(Parser)]
#[command(
    name = "fmsolve",
    about = "Train and apply Factorization Machine models on sparse svmlight data",
    long_about = "Fits second-order Factorization Machines for regression or binary \
                 classification with ALS coordinate descent or MCMC Gibbs sampling."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LabelArg {
    /// Labels are 0 and 1
    ZeroOne,
    /// Labels are -1 and +1
    PlusMinusOne,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from an svmlight file
    #[command(about = "Train an FM model (outputs: model.toml)")]
    Train {
        /// Path to the training data in svmlight format
        training_data: String,

        /// TOML file with a full fit configuration; flags below override it
        #[arg(long, value_name = "FILE")]
        config: Option<String>,

        /// Solver: 'als' or 'mcmc'
        #[arg(long)]
        solver: Option<String>,

        /// Fit a binary classifier instead of a regression model
        #[arg(long)]
        classification: bool,

        /// Label encoding used by the training targets
        #[arg(long, value_enum)]
        labels: Option<LabelArg>,

        /// Embedding rank of the pairwise factors
        #[arg(long)]
        rank: Option<usize>,

        /// Number of iterations (sweeps or samples)
        #[arg(long)]
        iterations: Option<usize>,

        /// MCMC samples discarded before averaging
        #[arg(long)]
        burn_in: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Standard deviation of the initial factor draws
        #[arg(long)]
        init_stdev: Option<f64>,

        /// L2 penalty (ALS) or initial precision (MCMC) of the linear weights
        #[arg(long)]
        l2_linear: Option<f64>,

        /// L2 penalty (ALS) or initial precision (MCMC) of the factors
        #[arg(long)]
        l2_factor: Option<f64>,

        /// L2 penalty (ALS) or prior precision (MCMC) of the bias
        #[arg(long)]
        l2_bias: Option<f64>,

        /// Damping factor for ALS updates, in (0, 1]
        #[arg(long)]
        step_size: Option<f64>,

        /// Stop ALS once the relative loss change drops below this value
        #[arg(long)]
        tolerance: Option<f64>,

        /// Stop once the training loss has not improved for this many iterations
        #[arg(long)]
        patience: Option<usize>,

        /// Feature indices in the data start at 0 instead of 1
        #[arg(long)]
        zero_based: bool,

        /// Where to write the trained model
        #[arg(long, default_value = "model.toml")]
        output: String,
    },

    /// Apply a trained model to new data
    #[command(about = "Predict with a trained model (outputs: predictions.tsv)")]
    Predict {
        /// Path to the data in svmlight format (labels are read but ignored)
        test_data: String,

        /// Path to trained model file (.toml)
        #[arg(long)]
        model: String,

        /// Feature indices in the data start at 0 instead of 1
        #[arg(long)]
        zero_based: bool,

        /// Where to write the predictions
        #[arg(long, default_value = "predictions.tsv")]
        output: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train {
            training_data,
            config,
            solver,
            classification,
            labels,
            rank,
            iterations,
            burn_in,
            seed,
            init_stdev,
            l2_linear,
            l2_factor,
            l2_bias,
            step_size,
            tolerance,
            patience,
            zero_based,
            output,
        } => build_config(
            config.as_deref(),
            ConfigOverrides {
                solver,
                classification,
                labels,
                rank,
                iterations,
                burn_in,
                seed,
                init_stdev,
                l2_linear,
                l2_factor,
                l2_bias,
                step_size,
                tolerance,
            },
        )
        .and_then(|config| train_command(&training_data, &config, patience, zero_based, &output)),
        Commands::Predict {
            test_data,
            model,
            zero_based,
            output,
        } => predict_command(&test_data, &model, zero_based, &output),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

struct ConfigOverrides {
    solver: Option<String>,
    classification: bool,
    labels: Option<LabelArg>,
    rank: Option<usize>,
    iterations: Option<usize>,
    burn_in: Option<usize>,
    seed: Option<u64>,
    init_stdev: Option<f64>,
    l2_linear: Option<f64>,
    l2_factor: Option<f64>,
    l2_bias: Option<f64>,
    step_size: Option<f64>,
    tolerance: Option<f64>,
}

fn build_config(
    path: Option<&str>,
    overrides: ConfigOverrides,
) -> Result<FitConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => {
            log::info!("Loading fit configuration from: {}", path);
            FitConfig::load(path)?
        }
        None => FitConfig::default(),
    };

    if let Some(name) = overrides.solver {
        config.solver = name.parse::<SolverKind>()?;
    }
    if overrides.classification {
        config.task = Task::Classification;
    }
    if let Some(labels) = overrides.labels {
        config.label_encoding = match labels {
            LabelArg::ZeroOne => LabelEncoding::ZeroOne,
            LabelArg::PlusMinusOne => LabelEncoding::PlusMinusOne,
        };
    }
    if let Some(rank) = overrides.rank {
        config.rank = rank;
    }
    if let Some(n) = overrides.iterations {
        config.n_iterations = n;
    }
    if let Some(burn_in) = overrides.burn_in {
        config.burn_in = burn_in;
    }
    if let Some(seed) = overrides.seed {
        config.seed = Some(seed);
    }
    if let Some(stdev) = overrides.init_stdev {
        config.init_stdev = stdev;
    }
    if let Some(l2) = overrides.l2_linear {
        config.regularization.linear = l2;
    }
    if let Some(l2) = overrides.l2_factor {
        config.regularization.factor = l2;
    }
    if let Some(l2) = overrides.l2_bias {
        config.regularization.bias = l2;
    }
    if let Some(step) = overrides.step_size {
        config.step_size = step;
    }
    if overrides.tolerance.is_some() {
        config.tolerance = overrides.tolerance;
    }

    config.validate()?;
    Ok(config)
}

/// Drives a progress bar from iteration reports and optionally stops early.
struct ProgressObserver {
    bar: ProgressBar,
    early_stopping: Option<EarlyStopping>,
}

impl FitObserver for ProgressObserver {
    fn on_iteration(&mut self, report: &IterationReport) -> ControlFlow<()> {
        self.bar.set_position(report.iteration as u64);
        if report.retained_samples > 0 {
            self.bar.set_message(format!(
                "loss {:.4e}, {} samples kept",
                report.loss, report.retained_samples
            ));
        } else {
            self.bar.set_message(format!("loss {:.4e}", report.loss));
        }
        match self.early_stopping.as_mut() {
            Some(early) => early.on_iteration(report),
            None => ControlFlow::Continue(()),
        }
    }
}

fn train_command(
    training_data_path: &str,
    config: &FitConfig,
    patience: Option<usize>,
    zero_based: bool,
    output_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading training data from: {}", training_data_path);
    let data = load_svmlight(training_data_path, None, zero_based)?;
    println!(
        "Loaded {} samples with {} features ({} nonzeros)",
        data.x.rows(),
        data.x.cols(),
        data.x.nnz()
    );

    let bar = ProgressBar::new(config.n_iterations as u64);
    let style = ProgressStyle::with_template(
        ">  {prefix} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )?;
    bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
    bar.set_prefix(config.solver.to_string());
    let mut observer = ProgressObserver {
        bar,
        early_stopping: patience.map(|p| EarlyStopping::new(p, 0.0)),
    };

    let model = fit_with_observer(
        &data.x,
        data.y.view(),
        None,
        config,
        None,
        &mut observer,
    );
    observer.bar.finish_and_clear();
    let model = model?;

    let summary = model.summary();
    println!(
        "Training finished: {:?} after {} iterations, training loss {:.6e}",
        summary.status, summary.iterations, summary.final_loss
    );
    if let Some(posterior) = model.posterior() {
        println!(
            "Posterior mean over {} retained samples",
            posterior.retained_samples
        );
    }

    model.save(output_path)?;
    println!("Model saved to: {}", output_path);
    Ok(())
}

fn predict_command(
    test_data_path: &str,
    model_path: &str,
    zero_based: bool,
    output_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", model_path);
    let model = FittedModel::load(model_path)?;
    println!(
        "Model: {} task, {} solver, {} features, rank {}",
        model.task(),
        model.solver(),
        model.n_features(),
        model.rank()
    );

    println!("Loading data from: {}", test_data_path);
    let data = load_svmlight(test_data_path, Some(model.n_features()), zero_based)?;

    let predictions = model.predict(&data.x)?;
    let probabilities = match model.task() {
        Task::Classification => Some(model.predict_proba(&data.x)?),
        Task::Regression => None,
    };
    save_predictions(&predictions, probabilities.as_ref(), output_path)?;
    println!(
        "Predictions for {} rows saved to: {}",
        predictions.len(),
        output_path
    );
    Ok(())
}

/// Writes one TSV row per sample.
fn save_predictions(
    predictions: &Array1<f64>,
    probabilities: Option<&Array1<f64>>,
    output_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(output_path)?;
    match probabilities {
        Some(probabilities) => {
            writer.write_record(["prediction", "probability"])?;
            for (prediction, probability) in predictions.iter().zip(probabilities.iter()) {
                writer.write_record([format!("{prediction}"), format!("{probability:.6}")])?;
            }
        }
        None => {
            writer.write_record(["prediction"])?;
            for prediction in predictions.iter() {
                writer.write_record([format!("{prediction:.6}")])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}
