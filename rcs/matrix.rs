//! Small dense linear-algebra helpers shared by the solver and the Wald tests.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{EigValsh, UPLO};

/// Computes `X' diag(w) X` without materializing the diagonal matrix.
pub fn weighted_crossprod(x: ArrayView2<f64>, weights: ArrayView1<f64>) -> Array2<f64> {
    let scaled = &x * &weights.insert_axis(Axis(1));
    x.t().dot(&scaled)
}

/// Smallest eigenvalue of a symmetric matrix after rescaling it to unit diagonal.
///
/// Equilibration makes the value comparable across columns measured on very
/// different scales (an exposure in mg/day next to an intercept). A non-positive
/// diagonal entry yields `0.0`, which every caller treats as singular.
pub fn min_equilibrated_eigenvalue(matrix: ArrayView2<f64>) -> Result<f64, LinalgError> {
    let n = matrix.nrows();
    if n == 0 {
        return Ok(f64::INFINITY);
    }
    let diag = matrix.diag();
    if diag.iter().any(|&d| d <= 0.0 || !d.is_finite()) {
        return Ok(0.0);
    }
    let inv_sqrt = diag.mapv(|d| 1.0 / d.sqrt());
    let scaled = Array2::from_shape_fn((n, n), |(i, j)| {
        matrix[[i, j]] * inv_sqrt[i] * inv_sqrt[j]
    });
    let eigenvalues = scaled.eigvalsh(UPLO::Lower)?;
    Ok(eigenvalues.iter().fold(f64::INFINITY, |acc, &v| acc.min(v)))
}

/// Returns `(A + A') / 2`, removing rounding asymmetry from sandwich products.
pub fn symmetrize(matrix: &Array2<f64>) -> Array2<f64> {
    (matrix + &matrix.t()) * 0.5
}

/// Computes `v' M v`.
pub fn quadratic_form(matrix: ArrayView2<f64>, vector: ArrayView1<f64>) -> f64 {
    vector.dot(&matrix.dot(&vector))
}

/// Adds `scale * d d'` to `target` in place.
pub fn add_scaled_outer(target: &mut Array2<f64>, d: ArrayView1<f64>, scale: f64) {
    let p = d.len();
    for a in 0..p {
        let da = d[a] * scale;
        if da == 0.0 {
            continue;
        }
        for b in 0..p {
            target[[a, b]] += da * d[b];
        }
    }
}

/// Extracts the sub-vector at `indices`.
pub fn select_vector(vector: ArrayView1<f64>, indices: &[usize]) -> Array1<f64> {
    vector.select(Axis(0), indices)
}

/// Extracts the square sub-matrix at `indices` (rows and columns).
pub fn select_square(matrix: ArrayView2<f64>, indices: &[usize]) -> Array2<f64> {
    matrix.select(Axis(0), indices).select(Axis(1), indices)
}
