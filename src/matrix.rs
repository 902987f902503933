//! Core matrix data structure and arithmetic.
//!
//! # Dense 2D Matrix Engine
//!
//! This module defines the rectangular `f64` matrix that every other part of
//! the crate computes with, plus the free functions for elementwise and
//! matrix arithmetic.
//!
//! It supports:
//! - Construction from literal arrays (`matrix!`), dimensions plus a fill
//!   value, or dimensions plus a per-cell initializer
//! - Shape transforms: flatten, reshape, transpose, 180° rotation, zero
//!   padding, sub-matrix extraction
//! - Arithmetic free functions: add, subtract, scalar multiply, matrix
//!   multiply, column summation, vector dot product
//!
//! ## Design Highlights
//! - Storage is a flat row-major `Vec<f64>` behind a `(rows, cols)` shape
//! - Every transform is value-semantic: `&self` in, new `Matrix` out, so two
//!   computations can never alias one backing buffer
//! - Shape violations surface as [`MatrixError`] values, never as silent
//!   recovery
//!
//! ## Limitations
//! - 2D only; no rank-N tensors, broadcasting, or views
//! - `f64` elements only
//!
//! ## Example
//!
//! ```rust
//! use matconv::matrix;
//! let m = matrix!([[1.0, 2.0], [3.0, 4.0]]);
//! assert_eq!(m.size(), (2, 2));
//! assert_eq!(m.transposed().row(0), &[1.0, 3.0]);
//! ```

use rayon::prelude::*;
use std::error::Error;
use std::fmt;

/// Shape and construction failures raised by the matrix engine.
///
/// All variants are caller errors: the engine performs no retries and no
/// silent recovery, it reports the incompatibility and returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixError {
    /// Operand shapes differ where identical `(rows, cols)` is required.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Inner dimensions disagree for matrix multiplication.
    Dimension { left_cols: usize, right_rows: usize },
    /// Vector dot operands differ in length.
    LengthMismatch { left: usize, right: usize },
    /// Requested reshape does not preserve the element count.
    ReshapeSize {
        rows: usize,
        cols: usize,
        elements: usize,
    },
    /// A literal array argument was empty or ragged.
    Construction(&'static str),
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixError::ShapeMismatch { left, right } => write!(
                f,
                "matrices must be the same size: {}x{} vs {}x{}",
                left.0, left.1, right.0, right.1
            ),
            MatrixError::Dimension {
                left_cols,
                right_rows,
            } => write!(
                f,
                "left operand columns ({left_cols}) must equal right operand rows ({right_rows})"
            ),
            MatrixError::LengthMismatch { left, right } => {
                write!(f, "vectors are not of the same length: {left} vs {right}")
            }
            MatrixError::ReshapeSize {
                rows,
                cols,
                elements,
            } => write!(
                f,
                "cannot reshape {elements} elements into {rows}x{cols}"
            ),
            MatrixError::Construction(what) => write!(f, "invalid matrix literal: {what}"),
        }
    }
}

impl Error for MatrixError {}

/// A rectangular 2D matrix of `f64` values.
///
/// - `rows`/`cols` are both at least 1.
/// - Data is stored flat in row-major order and is exclusively owned by the
///   instance; clone explicitly when a snapshot is needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Creates a matrix from a flat row-major buffer.
    ///
    /// This is the trusted constructor used when the caller has already
    /// produced a correctly sized buffer.
    ///
    /// # Panics
    /// Panics if either dimension is zero or `data.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert!(rows >= 1 && cols >= 1, "matrix dimensions must be >= 1");
        assert_eq!(
            rows * cols,
            data.len(),
            "{}x{} is incompatible with {} data elements",
            rows,
            cols,
            data.len()
        );
        Self { rows, cols, data }
    }

    /// Creates a `rows x cols` matrix with every cell set to `value`.
    ///
    /// # Panics
    /// Panics if either dimension is zero.
    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self::new(rows, cols, vec![value; rows * cols])
    }

    /// Creates a `rows x cols` matrix, calling `init(row, col)` per cell.
    ///
    /// # Panics
    /// Panics if either dimension is zero.
    pub fn from_fn(rows: usize, cols: usize, mut init: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for y in 0..rows {
            for x in 0..cols {
                data.push(init(y, x));
            }
        }
        Self::new(rows, cols, data)
    }

    /// Creates a `rows x cols` matrix of zeros.
    ///
    /// # Panics
    /// Panics if either dimension is zero.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    /// Creates a matrix from a nested literal array.
    ///
    /// # Errors
    /// Returns [`MatrixError::Construction`] if the outer array is empty,
    /// any row is empty, or the rows have differing lengths.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, MatrixError> {
        let Some(first) = rows.first() else {
            return Err(MatrixError::Construction("no rows"));
        };
        let cols = first.len();
        if cols == 0 {
            return Err(MatrixError::Construction("empty row"));
        }
        if rows.iter().any(|row| row.len() != cols) {
            return Err(MatrixError::Construction("ragged rows"));
        }

        let row_count = rows.len();
        let mut data = Vec::with_capacity(row_count * cols);
        for row in rows {
            data.extend(row);
        }
        Ok(Self::new(row_count, cols, data))
    }

    /// Creates a matrix from a flat 1D array, auto-wrapped to `1 x N`.
    ///
    /// # Errors
    /// Returns [`MatrixError::Construction`] if the array is empty.
    pub fn from_vec(values: Vec<f64>) -> Result<Self, MatrixError> {
        if values.is_empty() {
            return Err(MatrixError::Construction("no elements"));
        }
        let cols = values.len();
        Ok(Self::new(1, cols, values))
    }

    /// Returns the shape as `(rows, cols)`.
    pub fn size(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Returns the row count.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Returns the column count.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Returns one row as a slice.
    ///
    /// # Panics
    /// Panics if `index >= self.rows()`.
    pub fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    /// Returns the element at `(row, col)`.
    ///
    /// # Panics
    /// Panics if the position is out of bounds.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        assert!(col < self.cols, "column {} out of bounds", col);
        self.data[row * self.cols + col]
    }

    /// Returns the flat row-major backing data.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Returns the matrix flattened to a single `1 x (rows*cols)` row,
    /// concatenating rows top-to-bottom. Idempotent on a flat matrix.
    pub fn flattened(&self) -> Matrix {
        Matrix::new(1, self.rows * self.cols, self.data.clone())
    }

    /// Returns the matrix reshaped to `new_rows x new_cols`.
    ///
    /// The element order is preserved: flatten, reverse, then refill
    /// row-major by popping from the tail. Popping the tail of the reversed
    /// sequence walks the original left-to-right order, so the round trip
    /// through any shape of equal element count is exact.
    ///
    /// # Errors
    /// Returns [`MatrixError::ReshapeSize`] if `new_rows * new_cols` does
    /// not equal the current element count.
    pub fn reshaped(&self, new_rows: usize, new_cols: usize) -> Result<Matrix, MatrixError> {
        let elements = self.rows * self.cols;
        if new_rows * new_cols != elements {
            return Err(MatrixError::ReshapeSize {
                rows: new_rows,
                cols: new_cols,
                elements,
            });
        }

        let flat = self.flattened();
        let mut reversed: Vec<f64> = flat.data.iter().rev().copied().collect();

        let mut data = Vec::with_capacity(elements);
        while let Some(value) = reversed.pop() {
            data.push(value);
        }

        Ok(Matrix::new(new_rows, new_cols, data))
    }

    /// Returns the transpose: `new[x][y] = old[y][x]`.
    pub fn transposed(&self) -> Matrix {
        let mut data = vec![0.0; self.rows * self.cols];
        for y in 0..self.rows {
            for x in 0..self.cols {
                data[x * self.rows + y] = self.data[y * self.cols + x];
            }
        }
        Matrix::new(self.cols, self.rows, data)
    }

    /// Returns the matrix rotated by pi radians: every row reversed, then
    /// the row order reversed. Used to flip a convolution filter for the
    /// backward pass.
    pub fn rotated(&self) -> Matrix {
        let mut data = Vec::with_capacity(self.rows * self.cols);
        for index in (0..self.rows).rev() {
            let mut row = self.row(index).to_vec();
            row.reverse();
            data.extend(row);
        }
        Matrix::new(self.rows, self.cols, data)
    }

    /// Returns the matrix surrounded by a zero border of the given widths.
    pub fn padded(&self, up: usize, down: usize, left: usize, right: usize) -> Matrix {
        let out_rows = self.rows + up + down;
        let out_cols = self.cols + left + right;
        let mut data = vec![0.0; out_rows * out_cols];
        for y in 0..self.rows {
            let offset = (y + up) * out_cols + left;
            data[offset..offset + self.cols].copy_from_slice(self.row(y));
        }
        Matrix::new(out_rows, out_cols, data)
    }

    /// Returns the sub-matrix covering rows `row_start..row_end` and
    /// columns `col_start..col_end`.
    ///
    /// # Panics
    /// Panics if the range is empty or out of bounds.
    pub fn submatrix(
        &self,
        row_start: usize,
        row_end: usize,
        col_start: usize,
        col_end: usize,
    ) -> Matrix {
        assert!(
            row_start < row_end && row_end <= self.rows,
            "row range {row_start}..{row_end} out of bounds for {} rows",
            self.rows
        );
        assert!(
            col_start < col_end && col_end <= self.cols,
            "column range {col_start}..{col_end} out of bounds for {} columns",
            self.cols
        );

        let mut data = Vec::with_capacity((row_end - row_start) * (col_end - col_start));
        for y in row_start..row_end {
            data.extend_from_slice(&self.row(y)[col_start..col_end]);
        }
        Matrix::new(row_end - row_start, col_end - col_start, data)
    }

    /// Returns a matrix with `func` applied elementwise.
    ///
    /// The closure may carry auxiliary per-call context, e.g. a snapshot of
    /// the full pre-activation matrix for normalized activations.
    pub fn map(&self, func: impl Fn(f64) -> f64) -> Matrix {
        Matrix::new(
            self.rows,
            self.cols,
            self.data.iter().map(|&value| func(value)).collect(),
        )
    }

    /// Returns the mean of all elements.
    pub fn average(&self) -> f64 {
        self.data.iter().sum::<f64>() / self.data.len() as f64
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for y in 0..self.rows {
            if y > 0 {
                writeln!(f)?;
            }
            write!(f, "{:?}", self.row(y))?;
        }
        Ok(())
    }
}

/// Takes the dot product of two vectors.
///
/// Accepts flat slices; pass `matrix.row(0)` for a single-row matrix.
///
/// # Errors
/// Returns [`MatrixError::LengthMismatch`] if the operands differ in length.
pub fn dot(vector1: &[f64], vector2: &[f64]) -> Result<f64, MatrixError> {
    if vector1.len() != vector2.len() {
        return Err(MatrixError::LengthMismatch {
            left: vector1.len(),
            right: vector2.len(),
        });
    }
    Ok(vector1
        .iter()
        .zip(vector2)
        .map(|(value1, value2)| value1 * value2)
        .sum())
}

/// Adds two matrices elementwise, returning a new matrix.
///
/// # Errors
/// Returns [`MatrixError::ShapeMismatch`] if the shapes differ.
pub fn add(matrix1: &Matrix, matrix2: &Matrix) -> Result<Matrix, MatrixError> {
    if matrix1.size() != matrix2.size() {
        return Err(MatrixError::ShapeMismatch {
            left: matrix1.size(),
            right: matrix2.size(),
        });
    }
    Ok(Matrix::new(
        matrix1.rows,
        matrix1.cols,
        matrix1
            .data
            .iter()
            .zip(&matrix2.data)
            .map(|(value1, value2)| value1 + value2)
            .collect(),
    ))
}

/// Subtracts `matrix2` from `matrix1` elementwise, returning a new matrix.
///
/// # Errors
/// Returns [`MatrixError::ShapeMismatch`] if the shapes differ.
pub fn subtract(matrix1: &Matrix, matrix2: &Matrix) -> Result<Matrix, MatrixError> {
    if matrix1.size() != matrix2.size() {
        return Err(MatrixError::ShapeMismatch {
            left: matrix1.size(),
            right: matrix2.size(),
        });
    }
    Ok(Matrix::new(
        matrix1.rows,
        matrix1.cols,
        matrix1
            .data
            .iter()
            .zip(&matrix2.data)
            .map(|(value1, value2)| value1 - value2)
            .collect(),
    ))
}

/// Scales every element by `factor`, returning a new matrix.
pub fn multiply_scalar(matrix: &Matrix, factor: f64) -> Matrix {
    matrix.map(|value| factor * value)
}

/// Performs matrix multiplication `matrix1 (m x k) * matrix2 (k x n)`.
///
/// Rows of the output are computed in parallel with `rayon`; the result is
/// deterministic since each output cell depends only on its own row/column
/// pair.
///
/// # Errors
/// Returns [`MatrixError::Dimension`] if `matrix1.cols() != matrix2.rows()`.
pub fn multiply_matrices(matrix1: &Matrix, matrix2: &Matrix) -> Result<Matrix, MatrixError> {
    if matrix1.cols != matrix2.rows {
        return Err(MatrixError::Dimension {
            left_cols: matrix1.cols,
            right_rows: matrix2.rows,
        });
    }

    let (m, k) = matrix1.size();
    let n = matrix2.cols;
    let mut data = vec![0.0; m * n];

    data.par_chunks_mut(n).enumerate().for_each(|(y, row)| {
        for (x, cell) in row.iter_mut().enumerate() {
            let mut sum = 0.0;
            for i in 0..k {
                sum += matrix1.data[y * k + i] * matrix2.data[i * n + x];
            }
            *cell = sum;
        }
    });

    Ok(Matrix::new(m, n, data))
}

/// Reduces each column by addition, returning a `1 x cols` matrix.
///
/// Collapsing a whole gradient map into the single shared bias scalar takes
/// the sum of these column totals.
pub fn matrix_sum(matrix: &Matrix) -> Matrix {
    let mut totals = vec![0.0; matrix.cols];
    for y in 0..matrix.rows {
        for (total, value) in totals.iter_mut().zip(matrix.row(y)) {
            *total += value;
        }
    }
    Matrix::new(1, matrix.cols, totals)
}

/// Defines a matrix from a literal array.
///
/// A nested array becomes a `rows x cols` matrix; a flat array is
/// auto-wrapped to `1 x N`.
///
/// # Example
/// ```
/// use matconv::matrix;
/// let m = matrix!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(m.size(), (2, 2));
/// let v = matrix!([1.0, 2.0, 3.0]);
/// assert_eq!(v.size(), (1, 3));
/// ```
#[macro_export]
macro_rules! matrix {
    ([ $( [ $($value:expr),+ $(,)? ] ),+ $(,)? ]) => {{
        let rows = vec![ $( vec![ $($value),+ ] ),+ ];
        $crate::matrix::Matrix::from_rows(rows)
            .expect("ragged matrix literal (rows have mismatched lengths)")
    }};

    ([ $($value:expr),+ $(,)? ]) => {
        $crate::matrix::Matrix::from_vec(vec![ $($value),+ ])
            .expect("empty matrix literal")
    };
}
