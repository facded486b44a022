#![cfg(feature = "classification")]

use fmsolve::link::LabelError;
use fmsolve::predict::predict_scores;
use fmsolve::{
    FitConfig, FmClassification, LabelEncoding, LinkFunction, ModelState, SolverKind,
    SparseDesignMatrix, Task, TrainingError, fit, predict,
};
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Labels are the sign of a planted rank-2 FM score, so the classes are
/// separable by the model family.
fn separable_problem(seed: u64) -> (SparseDesignMatrix, Array1<f64>) {
    let (n, p, k) = (200, 10, 2);
    let mut rng = StdRng::seed_from_u64(seed);
    let dense = Array2::from_shape_fn((n, p), |_| {
        if rng.r#gen::<f64>() < 0.4 {
            rng.gen_range(-1.0..1.0)
        } else {
            0.0
        }
    });
    let x = SparseDesignMatrix::from_dense(dense.view()).unwrap();
    let state = ModelState {
        w0: 0.0,
        w: Array1::from_shape_fn(p, |_| 1.5 * rng.sample::<f64, _>(StandardNormal)),
        v: Array2::from_shape_fn((p, k), |_| rng.sample::<f64, _>(StandardNormal)),
    };
    let labels = predict_scores(&state, &x).mapv(|s| if s > 0.0 { 1.0 } else { 0.0 });
    (x, labels)
}

fn accuracy(predicted: &Array1<f64>, truth: &Array1<f64>) -> f64 {
    let hits = predicted
        .iter()
        .zip(truth.iter())
        .filter(|(p, t)| p == t)
        .count();
    hits as f64 / truth.len() as f64
}

fn classification_config(solver: SolverKind, n_iterations: usize) -> FitConfig {
    FitConfig {
        solver,
        task: Task::Classification,
        rank: 2,
        n_iterations,
        burn_in: if solver == SolverKind::Mcmc {
            n_iterations / 2
        } else {
            0
        },
        ..FitConfig::default()
    }
}

#[test]
fn invalid_label_is_rejected_before_training() {
    let x = SparseDesignMatrix::from_dense(array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]].view())
        .unwrap();
    let config = classification_config(SolverKind::Als, 10);
    let err = fit(&x, array![0.0, 1.0, 2.0].view(), &config).unwrap_err();
    match err {
        TrainingError::Label(LabelError::InvalidLabel { row, value, .. }) => {
            assert_eq!(row, 2);
            assert_eq!(value, 2.0);
        }
        other => panic!("unexpected error: {other}"),
    }

    // A 0/1 target is not a valid -1/+1 label.
    let config = FitConfig {
        label_encoding: LabelEncoding::PlusMinusOne,
        ..config
    };
    assert!(matches!(
        fit(&x, array![1.0, -1.0, 0.0].view(), &config),
        Err(TrainingError::Label(LabelError::InvalidLabel { row: 2, .. }))
    ));
}

#[test]
fn als_logistic_separates_planted_classes() {
    let (x, y) = separable_problem(11);
    let model = fit(&x, y.view(), &classification_config(SolverKind::Als, 30)).unwrap();
    assert_eq!(model.link(), LinkFunction::Logit);

    let labels = predict(&model, &x).unwrap();
    assert!(labels.iter().all(|&l| l == 0.0 || l == 1.0));
    let acc = accuracy(&labels, &y);
    assert!(acc > 0.9, "training accuracy {acc}");
}

#[test]
fn mcmc_probit_separates_planted_classes() {
    let (x, y) = separable_problem(12);
    let model = fit(&x, y.view(), &classification_config(SolverKind::Mcmc, 200)).unwrap();
    assert_eq!(model.link(), LinkFunction::Probit);

    let acc = accuracy(&predict(&model, &x).unwrap(), &y);
    assert!(acc > 0.85, "training accuracy {acc}");

    let posterior = model.posterior().unwrap();
    assert_eq!(posterior.retained_samples, 100);
    assert!(
        posterior
            .training_predictions
            .iter()
            .all(|&p| (0.0..=1.0).contains(&p))
    );
    // Classification keeps the noise precision fixed.
    assert!(posterior.trace.iter().all(|record| record.alpha == 1.0));
}

#[test]
fn plus_minus_one_labels_come_back_in_the_same_encoding() {
    let (x, y01) = separable_problem(13);
    let y = y01.mapv(|l| if l == 1.0 { 1.0 } else { -1.0 });
    let config = FitConfig {
        label_encoding: LabelEncoding::PlusMinusOne,
        ..classification_config(SolverKind::Als, 30)
    };
    let model = fit(&x, y.view(), &config).unwrap();
    assert_eq!(model.label_encoding(), LabelEncoding::PlusMinusOne);

    let labels = predict(&model, &x).unwrap();
    assert!(labels.iter().all(|&l| l == 1.0 || l == -1.0));
    assert!(accuracy(&labels, &y) > 0.9);
}

#[test]
fn probabilities_agree_with_labels() {
    let (x, y) = separable_problem(14);
    let model = fit(&x, y.view(), &classification_config(SolverKind::Als, 20)).unwrap();
    let probabilities = model.predict_proba(&x).unwrap();
    let labels = model.predict(&x).unwrap();
    for (&p, &label) in probabilities.iter().zip(labels.iter()) {
        assert!((0.0..=1.0).contains(&p));
        assert_eq!(label, if p >= 0.5 { 1.0 } else { 0.0 });
    }
}

#[test]
fn classifier_facade_fits_and_predicts() {
    let (x, y) = separable_problem(15);
    let mut classifier = FmClassification::als(2, 30);
    assert!(matches!(
        classifier.predict_proba(&x),
        Err(TrainingError::NotFitted)
    ));

    let fitted = classifier.fit(&x, y.view()).unwrap();
    assert_eq!(fitted.task(), Task::Classification);

    let labels = classifier.predict(&x).unwrap();
    assert_eq!(labels.len(), x.rows());
    assert!(accuracy(&labels, &y) > 0.9);
    let probabilities = classifier.predict_proba(&x).unwrap();
    assert!(probabilities.iter().all(|p| (0.0..=1.0).contains(p)));
}
