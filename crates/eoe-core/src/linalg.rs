//! Dense linear algebra helpers that candle does not provide.
//!
//! Decompositions run on the host in `f64` through nalgebra; results are
//! moved back to the caller's device as `f32`.

use candle_core::{DType, Tensor};
use nalgebra::{DMatrix, SymmetricEigen};

use crate::error::{EoeError, EoeResult};

/// Pseudo-inverse of a symmetric (Hermitian) matrix.
///
/// Eigenvalues whose magnitude is below `n * f32::EPSILON * max|λ|` are treated
/// as zero, matching the default cutoff of a Hermitian `pinv` on `f32` input.
/// The input is symmetrised before decomposition. An all-zero matrix yields an
/// all-zero pseudo-inverse.
///
/// # Errors
/// - `EoeError::DimensionMismatch` if the tensor is not square
/// - `EoeError::TensorError` on device transfer failure
pub fn pinv_hermitian(matrix: &Tensor) -> EoeResult<Tensor> {
    let (rows, cols) = matrix.dims2().map_err(map_candle)?;
    if rows != cols {
        return Err(EoeError::dims("pinv_hermitian", &[rows, rows], &[rows, cols]));
    }

    let host = matrix
        .to_dtype(DType::F64)
        .map_err(map_candle)?
        .to_vec2::<f64>()
        .map_err(map_candle)?;

    let a = DMatrix::from_fn(rows, cols, |i, j| 0.5 * (host[i][j] + host[j][i]));
    let eigen = SymmetricEigen::new(a);

    let max_abs = eigen
        .eigenvalues
        .iter()
        .fold(0.0f64, |acc, v| acc.max(v.abs()));
    let cutoff = rows as f64 * f32::EPSILON as f64 * max_abs;

    let inv_diag = DMatrix::from_fn(rows, rows, |i, j| {
        let lambda = eigen.eigenvalues[i];
        if i == j && max_abs > 0.0 && lambda.abs() > cutoff {
            1.0 / lambda
        } else {
            0.0
        }
    });

    let v = &eigen.eigenvectors;
    let pinv = v * inv_diag * v.transpose();

    let flat: Vec<f32> = (0..rows)
        .flat_map(|i| (0..cols).map(move |j| (i, j)))
        .map(|(i, j)| pinv[(i, j)] as f32)
        .collect();

    Tensor::from_vec(flat, (rows, cols), matrix.device()).map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> EoeError {
    EoeError::TensorError {
        message: format!("Pseudo-inverse error: {}", e),
    }
}
