//! 2D convolution primitives and the convolutional layer.
//!
//! # Convolution by Patch Extraction
//!
//! Convolution here is expressed as matrix arithmetic: [`kernel`] unfolds the
//! input into one flattened row per window position, [`weighted_kernel`]
//! multiplies that patch matrix against the flattened filter and folds the
//! result back into a 2D output map. The backward pass reuses the same two
//! primitives on a [`dilate`]d gradient against the 180°-rotated filter, the
//! standard trick for recovering input gradients from a strided convolution.
//!
//! ## The Layer
//!
//! [`Convolutional`] owns the filter weights, the shared scalar bias, the
//! stride configuration, and the optimizer's first/second moment
//! accumulators. Forward ([`Convolutional::predict`]) and backward
//! ([`Convolutional::train`]) compose the free functions above; the
//! activation, activation gradient, and optimizer are pluggable
//! collaborators with fixed signatures.
//!
//! ## Usage Guidelines
//!
//! - Operations return [`MatrixError`] on shape violations; nothing is
//!   retried or silently recovered.
//! - Strided patch extraction skips trailing window corners that are not
//!   stride-aligned rather than erroring; see [`kernel`].
//! - Single-threaded contract: a layer instance is plain owned state with no
//!   interior mutability.

use crate::matrix::{self, Matrix, MatrixError};

/// Activation collaborator: `(pre-activation value, full pre-activation
/// matrix) -> activated value`.
///
/// The second argument carries the whole pre-activation map so that
/// softmax-style activations can normalize across elements.
pub type Activation = fn(f64, &Matrix) -> f64;

/// Activation-gradient collaborator: converts the loss gradient w.r.t. the
/// layer output into the loss gradient w.r.t. the pre-activation.
///
/// Arguments are `(activation, raw error matrix, predicted matrix)`; the
/// result must share the raw error matrix's shape.
pub type ActivationGradient = fn(Activation, &Matrix, &Matrix) -> Matrix;

/// Optimizer collaborator: `(first moment, second moment, raw gradient,
/// iteration) -> (new first moment, new second moment, adjusted gradient)`.
///
/// Called once per train step for the weights and once for the bias; the
/// state matrices always share the gradient's shape, whichever that is.
pub type Optimizer = fn(&Matrix, &Matrix, &Matrix, u64) -> (Matrix, Matrix, Matrix);

/// Learning rate applied when the caller has no preference.
pub const DEFAULT_LEARN_RATE: f64 = 0.5;

/// Extracts sliding-window patches, one flattened row per window position.
///
/// Window top-left corners scan row-major over `0..=rows - kernel_rows` by
/// `0..=cols - kernel_cols`; a corner is included only when both of its
/// coordinates are multiples of the matching step size. Trailing in-range
/// corners that are not stride-aligned are skipped, not an error.
///
/// The result has one row of `kernel_rows * kernel_cols` elements per
/// included corner.
///
/// # Panics
/// Panics if the window is larger than the input or a step size is zero.
pub fn kernel(
    input: &Matrix,
    kernel_rows: usize,
    kernel_cols: usize,
    step_rows: usize,
    step_cols: usize,
) -> Matrix {
    let (rows, cols) = input.size();
    assert!(
        kernel_rows <= rows && kernel_cols <= cols,
        "{kernel_rows}x{kernel_cols} window does not fit a {rows}x{cols} matrix"
    );
    assert!(step_rows >= 1 && step_cols >= 1, "step sizes must be >= 1");

    let mut data = Vec::new();
    let mut patches = 0;
    for row_num in 0..=(rows - kernel_rows) {
        for col_num in 0..=(cols - kernel_cols) {
            if row_num % step_rows == 0 && col_num % step_cols == 0 {
                let patch = input.submatrix(
                    row_num,
                    row_num + kernel_rows,
                    col_num,
                    col_num + kernel_cols,
                );
                data.extend_from_slice(patch.data());
                patches += 1;
            }
        }
    }

    Matrix::new(patches, kernel_rows * kernel_cols, data)
}

/// Convolves `input` with `filter` at the given strides.
///
/// Patch-extracts with the filter's own size, multiplies the patch matrix by
/// the filter flattened to a column, and reshapes the resulting column into
/// the `ceil((rows - k + 1) / step)` output grid.
///
/// # Errors
/// Propagates the matrix engine's shape errors; the patch count and the
/// ceiling-divided output size are intentionally left coupled rather than
/// patched around.
pub fn weighted_kernel(
    input: &Matrix,
    filter: &Matrix,
    step_rows: usize,
    step_cols: usize,
) -> Result<Matrix, MatrixError> {
    let (kernel_rows, kernel_cols) = filter.size();

    let patches = kernel(input, kernel_rows, kernel_cols, step_rows, step_cols);
    let weighted = matrix::multiply_matrices(&patches, &filter.flattened().transposed())?;

    let out_rows = (input.rows() - kernel_rows + 1).div_ceil(step_rows);
    let out_cols = (input.cols() - kernel_cols + 1).div_ceil(step_cols);

    weighted.reshaped(out_rows, out_cols)
}

/// Dilates a gradient matrix for the backward "full" convolution.
///
/// Inserts `step_cols - 1` zero columns between adjacent elements within a
/// row and `step_rows - 1` all-zero rows between adjacent rows, then
/// zero-pads by `kernel_rows - 1` above/below and `kernel_cols - 1` on each
/// side. Convolving the result against the flipped filter at stride 1
/// recovers a gradient matching the forward input's shape.
///
/// # Panics
/// Panics if a step size is zero.
pub fn dilate(
    gradient: &Matrix,
    kernel_rows: usize,
    kernel_cols: usize,
    step_rows: usize,
    step_cols: usize,
) -> Matrix {
    assert!(step_rows >= 1 && step_cols >= 1, "step sizes must be >= 1");
    let (rows, cols) = gradient.size();
    let out_cols = (cols - 1) * (step_cols - 1) + cols;

    let mut spread = Vec::new();
    for y in 0..rows {
        if y != 0 {
            for _ in 0..step_rows - 1 {
                spread.push(vec![0.0; out_cols]);
            }
        }
        let mut row = Vec::with_capacity(out_cols);
        for x in 0..cols {
            if x != 0 {
                for _ in 0..step_cols - 1 {
                    row.push(0.0);
                }
            }
            row.push(gradient.get(y, x));
        }
        spread.push(row);
    }

    let out_rows = spread.len();
    let mut data = Vec::with_capacity(out_rows * out_cols);
    for row in spread {
        data.extend(row);
    }

    Matrix::new(out_rows, out_cols, data).padded(
        kernel_rows - 1,
        kernel_rows - 1,
        kernel_cols - 1,
        kernel_cols - 1,
    )
}

/// A 2D convolutional layer trained by gradient descent.
///
/// Owns the filter weights, the scalar bias shared across the output map,
/// the stride configuration, and the optimizer accumulator state threaded
/// through successive [`Convolutional::train`] calls.
///
/// The weight accumulators always share the weights' shape; the bias
/// accumulators are allocated on the first train call to match the output
/// map. [`Convolutional::reinit`] discards all accumulator state without
/// touching weights or bias.
pub struct Convolutional {
    weights: Matrix,
    bias: f64,
    kernel_rows: usize,
    kernel_cols: usize,
    step_rows: usize,
    step_cols: usize,
    activation: Activation,
    activation_gradient: ActivationGradient,
    p_weights: Matrix,
    rms_weights: Matrix,
    p_bias: Option<Matrix>,
    rms_bias: Option<Matrix>,
    iteration: u64,
}

impl Convolutional {
    /// Creates a fresh layer with explicit weights and bias.
    ///
    /// # Panics
    /// Panics if a step size is zero.
    pub fn new(
        weights: Matrix,
        bias: f64,
        step_rows: usize,
        step_cols: usize,
        activation: Activation,
        activation_gradient: ActivationGradient,
    ) -> Self {
        assert!(step_rows >= 1 && step_cols >= 1, "step sizes must be >= 1");
        let (kernel_rows, kernel_cols) = weights.size();
        let p_weights = Matrix::zeros(kernel_rows, kernel_cols);
        let rms_weights = Matrix::zeros(kernel_rows, kernel_cols);

        Self {
            weights,
            bias,
            kernel_rows,
            kernel_cols,
            step_rows,
            step_cols,
            activation,
            activation_gradient,
            p_weights,
            rms_weights,
            p_bias: None,
            rms_bias: None,
            iteration: 0,
        }
    }

    /// Reconstructs a layer from previously exported state.
    ///
    /// The counterpart of [`Convolutional::state`], used by
    /// [`crate::modelio::load_layer`].
    ///
    /// # Panics
    /// Panics if the moment matrices do not share the weights' shape or a
    /// step size is zero.
    #[allow(clippy::too_many_arguments)]
    pub fn with_state(
        weights: Matrix,
        bias: f64,
        step_rows: usize,
        step_cols: usize,
        activation: Activation,
        activation_gradient: ActivationGradient,
        p_weights: Matrix,
        rms_weights: Matrix,
        p_bias: Option<Matrix>,
        rms_bias: Option<Matrix>,
        iteration: u64,
    ) -> Self {
        assert_eq!(weights.size(), p_weights.size(), "first moment shape");
        assert_eq!(weights.size(), rms_weights.size(), "second moment shape");

        let mut layer = Self::new(
            weights,
            bias,
            step_rows,
            step_cols,
            activation,
            activation_gradient,
        );
        layer.p_weights = p_weights;
        layer.rms_weights = rms_weights;
        layer.p_bias = p_bias;
        layer.rms_bias = rms_bias;
        layer.iteration = iteration;
        layer
    }

    /// Runs the forward pass without mutating any layer state.
    ///
    /// Convolves the input with the weights, broadcasts the bias over the
    /// output map, and applies the activation elementwise. The activation
    /// receives each scalar together with a snapshot of the full
    /// pre-activation matrix.
    ///
    /// # Errors
    /// Propagates the matrix engine's shape errors.
    pub fn predict(&self, input: &Matrix) -> Result<Matrix, MatrixError> {
        let convolved = weighted_kernel(input, &self.weights, self.step_rows, self.step_cols)?;
        let (out_rows, out_cols) = convolved.size();

        let preactivation =
            matrix::add(&convolved, &Matrix::filled(out_rows, out_cols, self.bias))?;

        let snapshot = preactivation.clone();
        let activation = self.activation;
        Ok(preactivation.map(|value| activation(value, &snapshot)))
    }

    /// Runs one backward pass and parameter update.
    ///
    /// Steps, in order:
    /// 1. increment the iteration counter;
    /// 2. convert `raw_errors` into pre-activation gradients via the
    ///    activation-gradient collaborator;
    /// 3. compute raw weight gradients from the input patches;
    /// 4. thread the weight gradients through `optimizer`, scale by
    ///    `learn_rate`, and subtract from the weights;
    /// 5. repeat the optimizer step for the bias, collapsing the adjusted
    ///    map into the single bias scalar;
    /// 6. dilate the gradients and convolve them against the 180°-rotated
    ///    weights at stride 1.
    ///
    /// Returns the input-side gradient to propagate to the previous layer.
    ///
    /// # Errors
    /// Propagates the matrix engine's shape errors.
    pub fn train(
        &mut self,
        input: &Matrix,
        predicted: &Matrix,
        raw_errors: &Matrix,
        optimizer: Optimizer,
        learn_rate: f64,
    ) -> Result<Matrix, MatrixError> {
        self.iteration += 1;

        let errors = (self.activation_gradient)(self.activation, raw_errors, predicted);

        // Weight gradients: patches^T (kh*kw x n) * errors column (n x 1),
        // folded back to the filter's shape.
        let patches_transposed = kernel(
            input,
            self.kernel_rows,
            self.kernel_cols,
            self.step_rows,
            self.step_cols,
        )
        .transposed();
        let raw_adjustments =
            matrix::multiply_matrices(&patches_transposed, &errors.flattened().transposed())?
                .reshaped(self.kernel_rows, self.kernel_cols)?;

        let (p_weights, rms_weights, adjustments) = optimizer(
            &self.p_weights,
            &self.rms_weights,
            &raw_adjustments,
            self.iteration,
        );
        self.p_weights = p_weights;
        self.rms_weights = rms_weights;
        self.weights = matrix::subtract(
            &self.weights,
            &matrix::multiply_scalar(&adjustments, learn_rate),
        )?;

        // Bias accumulators track the output map's shape; first train call
        // (or an input size change) starts them from zero.
        let (out_rows, out_cols) = errors.size();
        let (p_bias, rms_bias) = match (self.p_bias.take(), self.rms_bias.take()) {
            (Some(p), Some(rms)) if p.size() == errors.size() => (p, rms),
            _ => (
                Matrix::zeros(out_rows, out_cols),
                Matrix::zeros(out_rows, out_cols),
            ),
        };
        let (p_bias, rms_bias, bias_adjustments) =
            optimizer(&p_bias, &rms_bias, &errors, self.iteration);
        self.p_bias = Some(p_bias);
        self.rms_bias = Some(rms_bias);

        let bias_step: f64 = matrix::matrix_sum(&bias_adjustments).row(0).iter().sum();
        self.bias -= learn_rate * bias_step;

        // Full convolution of the dilated gradient against the flipped
        // filter recovers a gradient in the forward input's shape.
        let flipped = self.weights.rotated();
        let dilated = dilate(
            &errors,
            self.kernel_rows,
            self.kernel_cols,
            self.step_rows,
            self.step_cols,
        );
        weighted_kernel(&dilated, &flipped, 1, 1)
    }

    /// Resets the optimizer accumulators and the iteration counter, leaving
    /// weights and bias untouched.
    pub fn reinit(&mut self) {
        self.p_weights = Matrix::zeros(self.kernel_rows, self.kernel_cols);
        self.rms_weights = Matrix::zeros(self.kernel_rows, self.kernel_cols);
        self.p_bias = None;
        self.rms_bias = None;
        self.iteration = 0;
    }

    /// Returns the filter weights.
    pub fn weights(&self) -> &Matrix {
        &self.weights
    }

    /// Returns the scalar bias.
    pub fn bias(&self) -> f64 {
        self.bias
    }

    /// Returns the `(row, column)` step sizes.
    pub fn step_sizes(&self) -> (usize, usize) {
        (self.step_rows, self.step_cols)
    }

    /// Returns the number of completed train calls.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Returns the weight accumulators as `(first moment, second moment)`.
    pub fn moments(&self) -> (&Matrix, &Matrix) {
        (&self.p_weights, &self.rms_weights)
    }

    /// Returns the bias accumulators, if any train call has allocated them.
    pub fn bias_moments(&self) -> Option<(&Matrix, &Matrix)> {
        match (&self.p_bias, &self.rms_bias) {
            (Some(p), Some(rms)) => Some((p, rms)),
            _ => None,
        }
    }

    /// Exports the full trainable state of the layer.
    ///
    /// Returned as `(weights, first moment, second moment, bias, bias
    /// moments)`; feed it back through [`Convolutional::with_state`] to
    /// resume training.
    pub fn state(&self) -> (&Matrix, &Matrix, &Matrix, f64, Option<(&Matrix, &Matrix)>) {
        (
            &self.weights,
            &self.p_weights,
            &self.rms_weights,
            self.bias,
            self.bias_moments(),
        )
    }
}
