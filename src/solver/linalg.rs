//! Dense linear algebra for the reference solver.
//!
//! Purpose
//! -------
//! Bridge `ndarray` weight blocks into `nalgebra`, factor weights into
//! square roots, solve damped normal equations, invert the small per-observation
//! blocks and form eigenvalue-truncated pseudoinverses for the parameter
//! covariance.
//!
//! Conventions
//! -----------
//! - Eigenvalues at or below [`EIGEN_EPS`] times the largest eigenvalue are
//!   treated as zero; the count of such eigenvalues is the rank deficiency.
//! - Inputs are assumed symmetric; no symmetrization happens here.
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

/// Relative cut-off below which eigenvalues are treated as zero.
pub const EIGEN_EPS: f64 = 1e-12;

/// Copy a square `ndarray` block into a `nalgebra::DMatrix`.
pub fn to_dmatrix(block: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(block.nrows(), block.ncols(), |i, j| block[[i, j]])
}

/// Square root `U` of a symmetric positive semi-definite weight `W`, with
/// `W = UᵀU`.
///
/// Diagonal blocks are handled entrywise; full blocks use the symmetric
/// eigendecomposition `W = Q Λ Qᵀ` and return `U = Λ^{1/2} Qᵀ` with negative
/// eigenvalues clipped to zero.
pub fn weight_root(block: &Array2<f64>) -> DMatrix<f64> {
    let q = block.nrows();
    let diagonal = (0..q).all(|a| (0..q).all(|b| a == b || block[[a, b]] == 0.0));
    if diagonal {
        return DMatrix::from_fn(q, q, |a, b| if a == b { block[[a, a]].max(0.0).sqrt() } else { 0.0 });
    }
    let eigen = to_dmatrix(block).symmetric_eigen();
    let mut root = eigen.eigenvectors.transpose();
    for (k, lambda) in eigen.eigenvalues.iter().enumerate() {
        let scale = lambda.max(0.0).sqrt();
        root.row_mut(k).scale_mut(scale);
    }
    root
}

/// Solve `(A + λ·diag(D)) s = −g` by Cholesky.
///
/// Returns `None` when the damped matrix is not numerically positive
/// definite; callers increase `λ` and retry.
pub fn solve_damped(a: &DMatrix<f64>, g: &DVector<f64>, lambda: f64, scale: &DVector<f64>) -> Option<DVector<f64>> {
    let mut damped = a.clone();
    for (k, d) in scale.iter().enumerate() {
        damped[(k, k)] += lambda * d;
    }
    let chol = damped.cholesky()?;
    let step = chol.solve(&(-g));
    step.iter().all(|v| v.is_finite()).then_some(step)
}

/// Inverse of a symmetric positive semi-definite block: Cholesky when it
/// factors, the truncated pseudoinverse otherwise.
pub fn spd_inverse(a: &DMatrix<f64>) -> DMatrix<f64> {
    if a.nrows() == 0 {
        return a.clone();
    }
    match a.clone().cholesky() {
        Some(chol) => chol.inverse(),
        None => pseudo_inverse(a.clone()).0,
    }
}

/// Eigenvalue-truncated pseudoinverse of a symmetric matrix.
///
/// Returns
/// -------
/// - the pseudoinverse `Σ_{λ_k > cut} q_k q_kᵀ / λ_k`,
/// - the number of eigenvalues treated as zero.
pub fn pseudo_inverse(a: DMatrix<f64>) -> (DMatrix<f64>, usize) {
    let n = a.nrows();
    if n == 0 {
        return (a, 0);
    }
    let eigen = a.symmetric_eigen();
    let q = eigen.eigenvectors;
    let eigenvals = eigen.eigenvalues;
    let cut = EIGEN_EPS * eigenvals.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));

    let mut inverse = DMatrix::<f64>::zeros(n, n);
    let mut deficiency = 0;
    for (k, &lambda) in eigenvals.iter().enumerate() {
        if lambda <= cut {
            deficiency += 1;
            continue;
        }
        for j in 0..n {
            let coeff = q[(j, k)] / lambda;
            for i in 0..n {
                inverse[(i, j)] += coeff * q[(i, k)];
            }
        }
    }
    (inverse, deficiency)
}

/// `sqrt(λ_min / λ_max)` of a symmetric positive semi-definite matrix, or 0
/// for an empty or zero matrix.
pub fn inverse_condition(a: &DMatrix<f64>) -> f64 {
    if a.nrows() == 0 {
        return 0.0;
    }
    let eigenvals = a.clone().symmetric_eigenvalues();
    let max = eigenvals.iter().fold(0.0_f64, |acc, v| acc.max(*v));
    let min = eigenvals.iter().fold(f64::INFINITY, |acc, v| acc.min(*v)).max(0.0);
    if max > 0.0 { (min / max).sqrt() } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    // Purpose
    // -------
    // `UᵀU` must reproduce both diagonal and full weight blocks.
    fn weight_root_reconstructs_block() {
        for block in [array![[4.0, 0.0], [0.0, 9.0]], array![[2.0, 0.5], [0.5, 1.0]]] {
            // Act
            let root = weight_root(&block);
            let back = root.transpose() * &root;

            // Assert
            for i in 0..2 {
                for j in 0..2 {
                    assert_relative_eq!(back[(i, j)], block[[i, j]], epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    // Purpose
    // -------
    // With λ = 0 the damped solve is the Gauss–Newton step.
    fn undamped_solve_matches_direct_inverse() {
        // Arrange
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let g = DVector::from_vec(vec![1.0, 2.0]);
        let d = DVector::from_vec(vec![1.0, 1.0]);

        // Act
        let step = solve_damped(&a, &g, 0.0, &d).unwrap();

        // Assert
        let residual = &a * &step + &g;
        assert!(residual.norm() < 1e-12);
    }

    #[test]
    // Purpose
    // -------
    // A singular matrix has one discarded eigenvalue and its pseudoinverse
    // inverts the non-null direction only.
    //
    // Given
    // -----
    // - A = [[1, 1], [1, 1]] with eigenvalues {0, 2}.
    fn pseudo_inverse_truncates_null_space() {
        // Act
        let (inverse, deficiency) = pseudo_inverse(DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]));

        // Assert
        assert_eq!(deficiency, 1);
        assert_relative_eq!(inverse[(0, 0)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(inverse[(0, 1)], 0.25, epsilon = 1e-12);
        assert_eq!(inverse_condition(&DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0])), 0.0);
        assert_relative_eq!(
            inverse_condition(&DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 1.0])),
            0.5,
            epsilon = 1e-12
        );
    }

    #[test]
    fn spd_inverse_falls_back_on_pseudo_inverse() {
        let regular = DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 2.0]);
        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);

        let inverse = spd_inverse(&regular);
        let fallback = spd_inverse(&singular);

        assert_relative_eq!(inverse[(0, 0)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(inverse[(1, 1)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(fallback[(0, 1)], 0.25, epsilon = 1e-12);
        assert_eq!(spd_inverse(&DMatrix::zeros(0, 0)).nrows(), 0);
    }
}
