#![cfg(feature = "regression")]

use approx::assert_abs_diff_eq;
use fmsolve::callback::IterationReport;
use fmsolve::estimate::{fit_from, fit_with_observer};
use fmsolve::predict::naive_score;
use fmsolve::{
    FitConfig, FitStatus, FittedModel, ModelState, Regularization, ShapeError, SparseDesignMatrix,
    TrainingError, fit, fit_weighted, predict,
};
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::ControlFlow;

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

fn planted_state() -> ModelState {
    ModelState {
        w0: 0.5,
        w: array![0.3, -0.2, 0.4],
        v: array![[0.5, -0.3], [0.2, 0.4], [-0.4, 0.1]],
    }
}

fn planted_targets(x: &SparseDesignMatrix, state: &ModelState) -> Array1<f64> {
    let dense = x.to_dense();
    Array1::from_iter((0..x.rows()).map(|i| naive_score(state, dense.row(i))))
}

fn mse(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    (a - b).mapv(|d| d * d).mean().unwrap()
}

#[test]
fn reference_model_predicts_known_scores() {
    let x = example_matrix();
    let state = ModelState {
        w0: 2.0,
        w: array![9.0, 8.0, 7.0],
        v: array![[6.0, 5.0], [0.0, 1.0], [2.0, 0.0]],
    };
    let scores = fmsolve::predict::predict_scores(&state, &x);
    assert_eq!(scores, array![37.0, 26.0, 148.0, 178.0]);
}

#[test]
fn als_fits_planted_model_on_small_example() {
    let x = example_matrix();
    let y = planted_targets(&x, &planted_state());
    let config = FitConfig {
        rank: 2,
        n_iterations: 50,
        ..FitConfig::default()
    };
    let model = fit(&x, y.view(), &config).unwrap();
    assert_eq!(model.summary().status, FitStatus::MaxIterationsReached);
    assert_eq!(model.summary().iterations, 50);

    let predictions = predict(&model, &x).unwrap();
    assert!(mse(&predictions, &y) < 0.05, "training MSE too high");
    assert_abs_diff_eq!(model.summary().final_loss, mse(&predictions, &y), epsilon = 1e-6);
}

#[test]
fn als_fits_small_example_targets() {
    let x = example_matrix();
    let y = array![1.0, 2.0, 1.5, 3.0];
    let config = FitConfig {
        rank: 2,
        n_iterations: 50,
        ..FitConfig::default()
    };
    let model = fit(&x, y.view(), &config).unwrap();
    let predictions = predict(&model, &x).unwrap();
    assert!(mse(&predictions, &y) < 0.05, "training MSE too high");
}

#[test]
fn unseen_feature_is_shrunk_to_zero() {
    // Feature 2 never occurs in the training rows.
    let x = SparseDesignMatrix::from_dense(
        array![
            [1.0, 2.0, 0.0],
            [0.0, 3.0, 0.0],
            [4.0, 0.0, 0.0],
            [4.0, 5.0, 0.0]
        ]
        .view(),
    )
    .unwrap();
    let y = array![1.0, 2.0, 1.5, 3.0];
    let config = FitConfig {
        rank: 2,
        n_iterations: 50,
        ..FitConfig::default()
    };
    let model = fit(&x, y.view(), &config).unwrap();
    assert_eq!(model.linear_weights()[2], 0.0);
    assert_eq!(model.factors()[[2, 0]], 0.0);
    assert_eq!(model.factors()[[2, 1]], 0.0);

    // A row that only adds the unseen feature scores like the row without it.
    let with_unseen =
        SparseDesignMatrix::from_dense(array![[1.0, 2.0, 0.0], [1.0, 2.0, 7.0]].view()).unwrap();
    let scores = predict(&model, &with_unseen).unwrap();
    assert_eq!(scores[0], scores[1]);
}

#[test]
fn rank_zero_recovers_linear_generating_model() {
    let mut rng = StdRng::seed_from_u64(2024);
    let true_w = array![0.8, -1.2, 0.0, 2.5, -0.4];
    let dense = Array2::from_shape_fn((60, 5), |_| {
        if rng.r#gen::<f64>() < 0.6 {
            rng.gen_range(-2.0..2.0)
        } else {
            0.0
        }
    });
    let y = dense.dot(&true_w) - 1.5;
    let x = SparseDesignMatrix::from_dense(dense.view()).unwrap();
    let config = FitConfig {
        rank: 0,
        n_iterations: 300,
        regularization: Regularization {
            bias: 0.0,
            linear: 0.0,
            factor: 0.0,
            per_factor: Vec::new(),
        },
        ..FitConfig::default()
    };
    let model = fit(&x, y.view(), &config).unwrap();
    assert_eq!(model.rank(), 0);
    assert_abs_diff_eq!(model.bias(), -1.5, epsilon = 1e-6);
    for (fitted, truth) in model.linear_weights().iter().zip(true_w.iter()) {
        assert_abs_diff_eq!(*fitted, *truth, epsilon = 1e-6);
    }
}

#[test]
fn prediction_is_idempotent_and_empty_rows_score_bias() {
    let x = example_matrix();
    let y = planted_targets(&x, &planted_state());
    let config = FitConfig {
        rank: 2,
        n_iterations: 20,
        ..FitConfig::default()
    };
    let model = fit(&x, y.view(), &config).unwrap();

    let first = predict(&model, &x).unwrap();
    let second = predict(&model, &x).unwrap();
    assert_eq!(first, second);

    let empty = SparseDesignMatrix::from_triplets(2, 3, Vec::new()).unwrap();
    let scores = predict(&model, &empty).unwrap();
    assert_eq!(scores, array![model.bias(), model.bias()]);
}

#[test]
fn zero_weight_rows_are_ignored() {
    let dense = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0]];
    let x = SparseDesignMatrix::from_dense(dense.view()).unwrap();
    let clean = array![1.0, 2.0, 3.0, 1.0];
    let mut corrupted = clean.clone();
    corrupted[3] = 500.0;

    let config = FitConfig {
        rank: 0,
        n_iterations: 200,
        regularization: Regularization {
            bias: 0.0,
            linear: 0.0,
            factor: 0.0,
            per_factor: Vec::new(),
        },
        ..FitConfig::default()
    };
    let weights = array![1.0, 1.0, 1.0, 0.0];
    let weighted = fit_weighted(&x, corrupted.view(), weights.view(), &config).unwrap();
    let reference = fit(
        &SparseDesignMatrix::from_dense(dense.slice(ndarray::s![0..3, ..])).unwrap(),
        clean.slice(ndarray::s![0..3]),
        &config,
    )
    .unwrap();
    assert_abs_diff_eq!(weighted.bias(), reference.bias(), epsilon = 1e-8);
    for (a, b) in weighted
        .linear_weights()
        .iter()
        .zip(reference.linear_weights().iter())
    {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
    }
}

#[test]
fn observer_stops_at_iteration_boundary() {
    let x = example_matrix();
    let y = planted_targets(&x, &planted_state());
    let config = FitConfig {
        rank: 2,
        n_iterations: 50,
        ..FitConfig::default()
    };
    let mut losses = Vec::new();
    let mut observer = |report: &IterationReport| {
        losses.push(report.loss);
        if report.iteration == 7 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };
    let model = fit_with_observer(&x, y.view(), None, &config, None, &mut observer).unwrap();
    assert_eq!(model.summary().status, FitStatus::Cancelled);
    assert_eq!(model.summary().iterations, 7);
    assert_eq!(losses.len(), 7);
    assert_eq!(model.summary().final_loss, losses[6]);
}

#[test]
fn warm_start_continues_training() {
    let x = example_matrix();
    let y = planted_targets(&x, &planted_state());
    let short = FitConfig {
        rank: 2,
        n_iterations: 25,
        ..FitConfig::default()
    };
    let first = fit(&x, y.view(), &short).unwrap();
    let continued = fit_from(&first, &x, y.view(), &short).unwrap();

    let long = FitConfig {
        n_iterations: 50,
        ..short
    };
    let direct = fit(&x, y.view(), &long).unwrap();
    let a = predict(&continued, &x).unwrap();
    let b = predict(&direct, &x).unwrap();
    for (p, q) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(*p, *q, epsilon = 1e-9);
    }
}

#[test]
fn column_mismatch_is_a_shape_error() {
    let x = example_matrix();
    let y = planted_targets(&x, &planted_state());
    let config = FitConfig {
        rank: 2,
        n_iterations: 5,
        ..FitConfig::default()
    };
    let model = fit(&x, y.view(), &config).unwrap();
    let narrow = SparseDesignMatrix::from_triplets(1, 2, vec![(0, 1, 1.0)]).unwrap();
    assert!(matches!(
        predict(&model, &narrow),
        Err(TrainingError::Shape(ShapeError::FeatureCountMismatch {
            expected: 3,
            found: 2
        }))
    ));
}

#[test]
fn saved_model_round_trips_through_toml() {
    let x = example_matrix();
    let y = planted_targets(&x, &planted_state());
    let config = FitConfig {
        rank: 2,
        n_iterations: 10,
        ..FitConfig::default()
    };
    let model = fit(&x, y.view(), &config).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fm.toml");
    let path = path.to_str().unwrap();
    model.save(path).unwrap();
    let loaded = FittedModel::load(path).unwrap();
    assert_eq!(loaded, model);
    assert_eq!(predict(&loaded, &x).unwrap(), predict(&model, &x).unwrap());
}
