use matconv::approx::approx_eq;
use matconv::conv::*;
use matconv::matrix;
use matconv::matrix::*;

fn relu(x: f64, _: &Matrix) -> f64 {
    x.max(0.0)
}

fn identity(x: f64, _: &Matrix) -> f64 {
    x
}

// activation that needs the full pre-activation map
fn mean_shift(x: f64, vals: &Matrix) -> f64 {
    x - vals.average()
}

fn passthrough_gradient(_: Activation, errors: &Matrix, _: &Matrix) -> Matrix {
    errors.clone()
}

fn relu_gradient(_: Activation, errors: &Matrix, predicted: &Matrix) -> Matrix {
    Matrix::from_fn(errors.rows(), errors.cols(), |y, x| {
        if predicted.get(y, x) > 0.0 {
            errors.get(y, x)
        } else {
            0.0
        }
    })
}

/// Optimizer that passes the raw gradient through untouched.
fn plain_sgd(p: &Matrix, rms: &Matrix, gradient: &Matrix, _: u64) -> (Matrix, Matrix, Matrix) {
    (p.clone(), rms.clone(), gradient.clone())
}

/// Adam with the usual hardcoded hyperparameters (beta1 = 0.9,
/// beta2 = 0.999, eps = 1e-8), shaped to the pluggable optimizer contract.
fn adam(p: &Matrix, rms: &Matrix, gradient: &Matrix, iteration: u64) -> (Matrix, Matrix, Matrix) {
    const BETA1: f64 = 0.9;
    const BETA2: f64 = 0.999;
    const EPS: f64 = 1e-8;

    let (rows, cols) = gradient.size();
    let p_new = Matrix::from_fn(rows, cols, |y, x| {
        BETA1 * p.get(y, x) + (1.0 - BETA1) * gradient.get(y, x)
    });
    let rms_new = Matrix::from_fn(rows, cols, |y, x| {
        BETA2 * rms.get(y, x) + (1.0 - BETA2) * gradient.get(y, x).powi(2)
    });
    let adjusted = Matrix::from_fn(rows, cols, |y, x| {
        let m_hat = p_new.get(y, x) / (1.0 - BETA1.powi(iteration as i32));
        let v_hat = rms_new.get(y, x) / (1.0 - BETA2.powi(iteration as i32));
        m_hat / (v_hat.sqrt() + EPS)
    });
    (p_new, rms_new, adjusted)
}

#[test]
fn test_full_window_yields_single_patch() {
    let m = matrix!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]);
    let patches = kernel(&m, 3, 3, 1, 1);
    assert_eq!(patches.size(), (1, 9));
    assert_eq!(patches.row(0), m.flattened().row(0));
}

#[test]
fn test_patches_scan_row_major() {
    let m = Matrix::from_fn(4, 4, |y, x| (y * 4 + x + 1) as f64);
    let patches = kernel(&m, 2, 2, 2, 2);
    assert_eq!(patches.size(), (4, 4));
    assert_eq!(patches.row(0), &[1.0, 2.0, 5.0, 6.0]);
    assert_eq!(patches.row(1), &[3.0, 4.0, 7.0, 8.0]);
    assert_eq!(patches.row(2), &[9.0, 10.0, 13.0, 14.0]);
    assert_eq!(patches.row(3), &[11.0, 12.0, 15.0, 16.0]);
}

#[test]
fn test_trailing_unaligned_corners_are_skipped() {
    // corners 0..=3 at row step 2 keep {0, 2}; corner 3 is dropped silently
    let m = Matrix::from_fn(6, 3, |y, x| (y * 3 + x) as f64);
    let patches = kernel(&m, 3, 3, 2, 1);
    assert_eq!(patches.size(), (2, 9));
    assert_eq!(
        patches.row(0),
        &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
    );
    assert_eq!(
        patches.row(1),
        &[6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0]
    );
}

#[test]
fn test_patch_count_always_matches_output_grid() {
    // the skip policy and the ceiling-divided reshape stay in lockstep, so
    // weighted_kernel's reshape cannot fail on count alone
    for size in 3..=8usize {
        for window in 1..=3usize {
            for step in 1..=3usize {
                let input = Matrix::zeros(size, size);
                let patches = kernel(&input, window, window, step, step);
                let per_axis = (size - window + 1).div_ceil(step);
                assert_eq!(
                    patches.rows(),
                    per_axis * per_axis,
                    "size {size} window {window} step {step}"
                );
            }
        }
    }
}

#[test]
fn test_dilate_stride_one_only_pads() {
    let gradient = matrix!([[1.0, 2.0], [3.0, 4.0]]);
    let dilated = dilate(&gradient, 3, 3, 1, 1);
    assert_eq!(dilated.size(), (6, 6));
    // interior untouched, no zeros between elements
    assert_eq!(dilated.submatrix(2, 4, 2, 4), gradient);
    assert_eq!(dilated.row(0), &[0.0; 6]);
    assert_eq!(dilated.get(5, 5), 0.0);
}

#[test]
fn test_dilate_strided_layout() {
    let gradient = matrix!([[1.0, 2.0], [3.0, 4.0]]);
    let dilated = dilate(&gradient, 2, 2, 2, 2);
    assert_eq!(dilated.size(), (5, 5));
    assert_eq!(dilated.row(0), &[0.0, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(dilated.row(1), &[0.0, 1.0, 0.0, 2.0, 0.0]);
    assert_eq!(dilated.row(2), &[0.0, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(dilated.row(3), &[0.0, 3.0, 0.0, 4.0, 0.0]);
    assert_eq!(dilated.row(4), &[0.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_weighted_kernel_uniform_input() {
    let input = Matrix::filled(5, 5, 2.0);
    let filter = Matrix::filled(3, 3, 0.5);
    let convolved = weighted_kernel(&input, &filter, 2, 2).unwrap();
    assert_eq!(convolved, Matrix::filled(2, 2, 9.0));
}

#[test]
fn test_predict_end_to_end() {
    // 3x3 filter of 0.5 over a 5x5 input of 2 at stride 2: every patch sum
    // is 9 * (0.5 * 2) = 9, plus bias 1, through ReLU -> a 2x2 map of 10s
    let layer = Convolutional::new(
        Matrix::filled(3, 3, 0.5),
        1.0,
        2,
        2,
        relu,
        passthrough_gradient,
    );
    let prediction = layer.predict(&Matrix::filled(5, 5, 2.0)).unwrap();
    assert_eq!(prediction, Matrix::filled(2, 2, 10.0));
    // predict never touches layer state
    assert_eq!(layer.iteration(), 0);
}

#[test]
fn test_predict_activation_sees_whole_preactivation() {
    let layer = Convolutional::new(
        Matrix::filled(3, 3, 0.5),
        1.0,
        2,
        2,
        mean_shift,
        passthrough_gradient,
    );
    // uniform pre-activation map minus its own mean is all zeros
    let prediction = layer.predict(&Matrix::filled(5, 5, 2.0)).unwrap();
    assert_eq!(prediction, Matrix::zeros(2, 2));
}

#[test]
fn test_train_hand_computed_step() {
    let mut layer = Convolutional::new(
        Matrix::filled(2, 2, 0.5),
        1.0,
        1,
        1,
        identity,
        passthrough_gradient,
    );
    let input = Matrix::from_fn(3, 3, |y, x| (y * 3 + x + 1) as f64);
    let predicted = Matrix::zeros(2, 2);
    let errors = matrix!([[1.0, 0.0], [0.0, 0.0]]);

    let h_error = layer
        .train(&input, &predicted, &errors, plain_sgd, 0.5)
        .unwrap();

    // weight gradient is the first input patch folded back to 2x2
    assert_eq!(layer.weights(), &matrix!([[0.0, -0.5], [-1.5, -2.0]]));
    // bias shrinks by lr * (sum of the adjustment map) = 0.5 * 1
    assert_eq!(layer.bias(), 0.5);
    assert_eq!(layer.iteration(), 1);

    // propagated gradient: updated weights flipped 180°, full convolution
    // over the padded error map, back in the input's 3x3 shape
    assert_eq!(
        h_error,
        matrix!([[0.0, -0.5, 0.0], [-1.5, -2.0, 0.0], [0.0, 0.0, 0.0]])
    );
}

#[test]
fn test_train_recovers_input_shape() {
    let mut layer = Convolutional::new(
        Matrix::filled(3, 3, 0.5),
        1.0,
        2,
        2,
        relu,
        relu_gradient,
    );
    let input = Matrix::from_fn(5, 5, |y, x| ((y * 5 + x) % 3) as f64);
    let predicted = layer.predict(&input).unwrap();
    let errors = Matrix::filled(predicted.rows(), predicted.cols(), 0.1);

    let h_error = layer
        .train(&input, &predicted, &errors, adam, DEFAULT_LEARN_RATE)
        .unwrap();
    assert_eq!(h_error.size(), input.size());
}

#[test]
fn test_adam_state_threading_and_reinit() {
    let mut layer = Convolutional::new(
        Matrix::filled(3, 3, 0.5),
        1.0,
        2,
        2,
        relu,
        relu_gradient,
    );
    let input = Matrix::filled(5, 5, 2.0);

    for _ in 0..2 {
        let predicted = layer.predict(&input).unwrap();
        let errors = Matrix::filled(2, 2, 0.5);
        layer
            .train(&input, &predicted, &errors, adam, DEFAULT_LEARN_RATE)
            .unwrap();
    }

    assert_eq!(layer.iteration(), 2);
    let (p_weights, rms_weights) = layer.moments();
    assert!(p_weights.data().iter().any(|&v| v != 0.0));
    assert!(rms_weights.data().iter().any(|&v| v != 0.0));
    assert_eq!(p_weights.size(), layer.weights().size());

    let (p_bias, rms_bias) = layer.bias_moments().expect("allocated on first train");
    assert_eq!(p_bias.size(), (2, 2));
    assert!(rms_bias.data().iter().any(|&v| v != 0.0));
    assert!(layer.bias() != 1.0);

    // reinit drops accumulators and the counter, never weights or bias
    let weights = layer.weights().clone();
    let bias = layer.bias();
    layer.reinit();
    assert_eq!(layer.iteration(), 0);
    assert_eq!(layer.moments().0, &Matrix::zeros(3, 3));
    assert_eq!(layer.moments().1, &Matrix::zeros(3, 3));
    assert!(layer.bias_moments().is_none());
    assert_eq!(layer.weights(), &weights);
    assert_eq!(layer.bias(), bias);
}

#[test]
fn test_train_propagates_shape_errors() {
    let mut layer = Convolutional::new(
        Matrix::filled(2, 2, 0.5),
        1.0,
        1,
        1,
        identity,
        passthrough_gradient,
    );
    let input = Matrix::zeros(3, 3);
    // gradient map of the wrong shape surfaces as a multiply error
    let wrong = Matrix::zeros(3, 3);
    let result = layer.train(&input, &Matrix::zeros(2, 2), &wrong, plain_sgd, 0.5);
    assert!(matches!(result, Err(MatrixError::Dimension { .. })));
}

#[test]
fn test_training_reduces_uniform_error() {
    // regression driven to a constant target: the prediction should move
    // toward the target over a few adaptive steps
    let mut layer = Convolutional::new(
        Matrix::filled(3, 3, 0.5),
        1.0,
        2,
        2,
        relu,
        relu_gradient,
    );
    let input = Matrix::filled(5, 5, 2.0);
    let target = Matrix::filled(2, 2, 1.0);

    let first = layer.predict(&input).unwrap();
    let start_gap = subtract(&first, &target).unwrap().map(f64::abs).average();

    for _ in 0..40 {
        let predicted = layer.predict(&input).unwrap();
        let errors = subtract(&predicted, &target).unwrap();
        layer.train(&input, &predicted, &errors, adam, 0.05).unwrap();
    }

    let last = layer.predict(&input).unwrap();
    let end_gap = subtract(&last, &target).unwrap().map(f64::abs).average();
    assert!(
        end_gap < start_gap / 2.0,
        "gap did not shrink: {start_gap} -> {end_gap}"
    );
}

#[test]
fn test_layer_save_and_load() {
    use matconv::modelio::{load_layer, save_layer};

    let mut layer = Convolutional::new(
        Matrix::filled(3, 3, 0.5),
        1.0,
        2,
        2,
        relu,
        relu_gradient,
    );
    let input = Matrix::filled(5, 5, 2.0);
    let predicted = layer.predict(&input).unwrap();
    let errors = Matrix::filled(2, 2, 0.25);
    layer
        .train(&input, &predicted, &errors, adam, DEFAULT_LEARN_RATE)
        .unwrap();

    save_layer("test_layer.cmat", &layer).unwrap();
    let restored = load_layer("test_layer.cmat", relu, relu_gradient).unwrap();

    assert_eq!(restored.weights(), layer.weights());
    assert_eq!(restored.bias(), layer.bias());
    assert_eq!(restored.iteration(), layer.iteration());
    assert_eq!(restored.step_sizes(), layer.step_sizes());
    assert_eq!(restored.moments().0, layer.moments().0);
    assert_eq!(restored.moments().1, layer.moments().1);
    assert_eq!(restored.bias_moments(), layer.bias_moments());
    assert_eq!(restored.state(), layer.state());

    // the restored layer predicts identically
    let original = layer.predict(&input).unwrap();
    let reloaded = restored.predict(&input).unwrap();
    assert!(approx_eq(&original, &reloaded));
}

#[test]
fn test_fresh_layer_round_trips_without_bias_moments() {
    use matconv::modelio::{load_layer, save_layer};

    let layer = Convolutional::new(
        matrix!([[1.0, -2.0], [0.25, 4.0]]),
        -0.5,
        1,
        2,
        identity,
        passthrough_gradient,
    );
    save_layer("test_layer_fresh.cmat", &layer).unwrap();
    let restored = load_layer("test_layer_fresh.cmat", identity, passthrough_gradient).unwrap();

    assert_eq!(restored.weights(), layer.weights());
    assert_eq!(restored.bias(), -0.5);
    assert_eq!(restored.iteration(), 0);
    assert!(restored.bias_moments().is_none());
}

#[test]
fn test_load_rejects_bad_magic() {
    use matconv::modelio::load_layer;

    std::fs::write("test_layer_bad.cmat", b"nope, not a layer").unwrap();
    assert!(load_layer("test_layer_bad.cmat", relu, relu_gradient).is_err());
}
