//! Saving/loading of convolutional layer state.
//!
//! # `.cmat` Layer Serialization Format
//!
//! This module provides minimal utilities for persisting a
//! [`Convolutional`] layer mid-training: weights, bias, optimizer moments,
//! stride configuration, and the iteration counter all round-trip, so a
//! reloaded layer resumes exactly where the saved one stopped.
//!
//! # Format Overview
//!
//! A `.cmat` file stores one layer in the following layout:
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────────┐
//! │ Header       │ Scalars          │ Matrices             │
//! ├──────────────┼──────────────────┼──────────────────────┤
//! │ "cmat"[4]    │ f64: bias        │ weights              │
//! │ u8: flags    │ u64: step rows   │ first moment         │
//! │              │ u64: step cols   │ second moment        │
//! │              │ u64: iteration   │ [bias moments x2]    │
//! └──────────────┴──────────────────┴──────────────────────┘
//! ```
//!
//! Each matrix is `u64` rows, `u64` cols, then `rows * cols` little-endian
//! `f64` values. Flag bit 0 records whether the lazily allocated bias
//! moments were present; when set, two more matrices follow.
//!
//! The activation and activation-gradient collaborators are function
//! references and are not serializable; the loader takes them as arguments.
//!
//! # Design Principles
//! - Fully self-contained, no compression
//! - Deterministic, reproducible byte layout
//! - Little-endian on all platforms
//!
//! # Example
//!
//! ```rust,no_run
//! use matconv::conv::Convolutional;
//! use matconv::matrix::Matrix;
//! use matconv::modelio::{save_layer, load_layer};
//!
//! fn relu(x: f64, _: &Matrix) -> f64 { x.max(0.0) }
//! fn grad(_: matconv::conv::Activation, e: &Matrix, _: &Matrix) -> Matrix { e.clone() }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let layer = Convolutional::new(Matrix::filled(3, 3, 0.5), 1.0, 2, 2, relu, grad);
//!     save_layer("layer.cmat", &layer)?;
//!     let restored = load_layer("layer.cmat", relu, grad)?;
//!     assert_eq!(restored.weights(), layer.weights());
//!     Ok(())
//! }
//! ```

use std::error::Error;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use briny::prelude::*;

use crate::conv::{Activation, ActivationGradient, Convolutional};
use crate::matrix::Matrix;

const CMAT_MAGIC: &[u8; 4] = b"cmat";
const FLAG_BIAS_MOMENTS: u8 = 0b0000_0001;

/// Internal representation of a packed matrix.
struct PackedMatrix {
    rows: u64,
    cols: u64,
    data: Vec<f64>,
}

impl Validate for PackedMatrix {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(ValidationError);
        }
        let expected = (self.rows * self.cols) as usize;
        if self.data.len() != expected {
            return Err(ValidationError);
        }
        Ok(())
    }
}

fn write_matrix(file: &mut impl Write, matrix: &Matrix) -> Result<(), Box<dyn Error>> {
    let (rows, cols) = matrix.size();
    file.write_all(&(rows as u64).to_le_bytes())?;
    file.write_all(&(cols as u64).to_le_bytes())?;
    for &value in matrix.data() {
        file.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_matrix(file: &mut impl Read) -> Result<Matrix, Box<dyn Error>> {
    let mut buf8 = [0u8; 8];

    file.read_exact(&mut buf8)?;
    let rows = u64::from_le_bytes(buf8);
    file.read_exact(&mut buf8)?;
    let cols = u64::from_le_bytes(buf8);

    let size = (rows * cols) as usize;
    let mut data = Vec::with_capacity(size);
    for _ in 0..size {
        file.read_exact(&mut buf8)?;
        data.push(f64::from_le_bytes(buf8));
    }

    let raw = PackedMatrix { rows, cols, data };
    let trusted = TrustedData::new(raw)?;
    let inner = trusted.into_inner();
    Ok(Matrix::new(
        inner.rows as usize,
        inner.cols as usize,
        inner.data,
    ))
}

/// Save a layer's trainable state to a `.cmat` file.
///
/// # Arguments
/// - `path`: Output file path.
/// - `layer`: The layer to persist.
///
/// # Errors
/// Returns an error if file I/O or a write fails.
pub fn save_layer(path: &str, layer: &Convolutional) -> Result<(), Box<dyn Error>> {
    let mut file = BufWriter::new(File::create(path)?);

    let bias_moments = layer.bias_moments();
    let flags = if bias_moments.is_some() {
        FLAG_BIAS_MOMENTS
    } else {
        0
    };

    // magic header and flags
    file.write_all(CMAT_MAGIC)?;
    file.write_all(&[flags])?;

    let (step_rows, step_cols) = layer.step_sizes();
    file.write_all(&layer.bias().to_le_bytes())?;
    file.write_all(&(step_rows as u64).to_le_bytes())?;
    file.write_all(&(step_cols as u64).to_le_bytes())?;
    file.write_all(&layer.iteration().to_le_bytes())?;

    let (p_weights, rms_weights) = layer.moments();
    write_matrix(&mut file, layer.weights())?;
    write_matrix(&mut file, p_weights)?;
    write_matrix(&mut file, rms_weights)?;

    if let Some((p_bias, rms_bias)) = bias_moments {
        write_matrix(&mut file, p_bias)?;
        write_matrix(&mut file, rms_bias)?;
    }

    Ok(())
}

/// Load a `.cmat` file back into a [`Convolutional`] layer.
///
/// The activation and activation-gradient collaborators are supplied by the
/// caller since function references cannot be serialized.
///
/// # Errors
/// Fails if the file does not start with `cmat`, is truncated, or contains
/// a matrix whose size disagrees with its declared shape.
pub fn load_layer(
    path: &str,
    activation: Activation,
    activation_gradient: ActivationGradient,
) -> Result<Convolutional, Box<dyn Error>> {
    let mut file = BufReader::new(File::open(path)?);
    let mut buf8 = [0u8; 8];

    // magic header
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != CMAT_MAGIC {
        return Err("invalid magic header".into());
    }

    let mut flags = [0u8; 1];
    file.read_exact(&mut flags)?;
    let flags = flags[0];

    file.read_exact(&mut buf8)?;
    let bias = f64::from_le_bytes(buf8);
    file.read_exact(&mut buf8)?;
    let step_rows = u64::from_le_bytes(buf8) as usize;
    file.read_exact(&mut buf8)?;
    let step_cols = u64::from_le_bytes(buf8) as usize;
    file.read_exact(&mut buf8)?;
    let iteration = u64::from_le_bytes(buf8);

    let weights = read_matrix(&mut file)?;
    let p_weights = read_matrix(&mut file)?;
    let rms_weights = read_matrix(&mut file)?;
    if weights.size() != p_weights.size() || weights.size() != rms_weights.size() {
        return Err("moment matrices do not match the weights' shape".into());
    }

    let (p_bias, rms_bias) = if flags & FLAG_BIAS_MOMENTS != 0 {
        (Some(read_matrix(&mut file)?), Some(read_matrix(&mut file)?))
    } else {
        (None, None)
    };

    Ok(Convolutional::with_state(
        weights,
        bias,
        step_rows,
        step_cols,
        activation,
        activation_gradient,
        p_weights,
        rms_weights,
        p_bias,
        rms_bias,
        iteration,
    ))
}
