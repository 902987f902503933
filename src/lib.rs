//! matconv: a minimal matrix engine and 2D convolutional layer in Rust.
//!
//! Implements one neural-network primitive from scratch: a strided 2D
//! convolutional layer trained by gradient descent with a pluggable
//! adaptive optimizer, on top of a dense `f64` matrix engine.
//!
//! # Features
//!
//! - Dense 2D matrix arithmetic and shape transforms with explicit shape
//!   errors.
//! - Convolution expressed as patch extraction plus matrix multiply; the
//!   backward pass via gradient dilation and 180° filter rotation.
//! - Optimizer, activation, and activation-gradient collaborators plugged
//!   in as plain function references.
//! - Layer state serialization for pausing and resuming training.
//!
//! # Goals
//!
//! - Keep every shape rule explicit and testable rather than hidden behind
//!   broadcasting.
//! - Prioritize correctness and explicitness over black-box abstraction.
//! - Stay single-sample and 2D: no batching, no rank-N tensors, no
//!   autodiff graph.
//!
//! # Modules
//!
//! - [`matrix`] — Core matrix data structure and arithmetic.
//! - [`conv`] — Convolution primitives and the [`conv::Convolutional`] layer.
//! - [`modelio`] — Saving/loading of layer state with integrity checks.
//! - [`approx`] — Approximate float comparison for tests and callers.
//!
//! # Example
//!
//! ```rust
//! use matconv::conv::Convolutional;
//! use matconv::matrix::Matrix;
//!
//! fn relu(x: f64, _: &Matrix) -> f64 { x.max(0.0) }
//! fn relu_gradient(_: matconv::conv::Activation, errors: &Matrix, predicted: &Matrix) -> Matrix {
//!     Matrix::from_fn(errors.rows(), errors.cols(), |y, x| {
//!         if predicted.get(y, x) > 0.0 { errors.get(y, x) } else { 0.0 }
//!     })
//! }
//!
//! let layer = Convolutional::new(Matrix::filled(3, 3, 0.5), 1.0, 2, 2, relu, relu_gradient);
//! let prediction = layer.predict(&Matrix::filled(5, 5, 2.0)).unwrap();
//! assert_eq!(prediction.size(), (2, 2));
//! ```

pub mod approx;
pub mod conv;
pub mod matrix;
pub mod modelio;
