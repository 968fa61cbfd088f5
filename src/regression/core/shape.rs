//! Problem dimensions `(n, m, npar, nq)` and the shape resolver.
//!
//! Purpose
//! -------
//! Infer the canonical dimensions of an ODR problem from the caller's `x`,
//! `y` and `beta0`, and confirm that the model (and, when the job code asks
//! for them, its analytic Jacobians) produce arrays the solver can consume.
//!
//! Key behaviors
//! -------------
//! - `x` is `(n,)` (m = 1) or `(m, n)`; `y` is `(n,)` (nq = 1) or `(nq, n)`.
//! - `beta0` must be rank 1.
//! - The model is evaluated once at `(beta0, x)`; its output must have
//!   exactly `y`'s shape.
//! - With analytic Jacobians, `fjacb` must end in `n` and hold `n·npar·nq`
//!   values, `fjacd` must end in `n` and hold `n·m·nq` values.
//!
//! Invariants & assumptions
//! ------------------------
//! - All four dimensions are at least 1 after a successful resolve.
//! - Model errors raised during that evaluation propagate unchanged.
//!
//! Conventions
//! -----------
//! - Shapes follow `ndarray` axis order; the observation axis is always last.
use crate::regression::{
    core::{job::JobFlags, model::Model, validation::validate_model_output},
    errors::{OdrError, OdrResult},
};
use ndarray::{Array1, ArrayD};

/// Canonical ODR problem dimensions.
///
/// - `n`: number of observations
/// - `m`: number of explanatory-variable dimensions
/// - `npar`: number of model parameters
/// - `nq`: number of response dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProblemDimensions {
    pub n: usize,
    pub m: usize,
    pub npar: usize,
    pub nq: usize,
}

impl ProblemDimensions {
    /// Validate explicit dimensions.
    ///
    /// # Errors
    /// - [`OdrError::ShapeMismatch`] if any dimension is zero.
    pub fn new(n: usize, m: usize, npar: usize, nq: usize) -> OdrResult<Self> {
        for (argument, value) in [("n", n), ("m", m), ("npar", npar), ("nq", nq)] {
            if value == 0 {
                return Err(OdrError::ShapeMismatch {
                    argument,
                    expected: "a dimension of at least 1".to_string(),
                    found: vec![value],
                });
            }
        }
        Ok(Self { n, m, npar, nq })
    }

    /// Resolve dimensions from the caller's arrays without calling the model.
    ///
    /// # Errors
    /// - [`OdrError::ShapeMismatch`] for a rank other than 1 or 2 in `x`/`y`,
    ///   a non-rank-1 `beta0`, disagreeing trailing axes, or an empty axis.
    pub fn from_arrays(x: &ArrayD<f64>, y: &ArrayD<f64>, beta0: &ArrayD<f64>) -> OdrResult<Self> {
        let (m, n) = match x.shape() {
            &[n] => (1, n),
            &[m, n] => (m, n),
            other => {
                return Err(OdrError::ShapeMismatch {
                    argument: "x",
                    expected: "(n,) or (m, n)".to_string(),
                    found: other.to_vec(),
                });
            }
        };
        let (nq, ny) = match y.shape() {
            &[ny] => (1, ny),
            &[nq, ny] => (nq, ny),
            other => {
                return Err(OdrError::ShapeMismatch {
                    argument: "y",
                    expected: "(n,) or (nq, n)".to_string(),
                    found: other.to_vec(),
                });
            }
        };
        if ny != n {
            return Err(OdrError::ShapeMismatch {
                argument: "y",
                expected: format!("trailing axis of length {n} to match 'x'"),
                found: y.shape().to_vec(),
            });
        }
        let npar = match beta0.shape() {
            &[npar] => npar,
            other => {
                return Err(OdrError::ShapeMismatch {
                    argument: "beta0",
                    expected: "(npar,)".to_string(),
                    found: other.to_vec(),
                });
            }
        };
        Self::new(n, m, npar, nq)
    }
}

/// Resolve dimensions and evaluate the model (and Jacobians when flagged).
///
/// Parameters
/// ----------
/// - `model`: user model.
/// - `beta0`: initial parameters; must be rank 1.
/// - `y`, `x`: caller arrays.
/// - `job`: decoded job flags; gates the Jacobian checks.
///
/// Returns
/// -------
/// - The validated [`ProblemDimensions`].
///
/// Errors
/// ------
/// - [`OdrError::ShapeMismatch`] from [`ProblemDimensions::from_arrays`] or
///   from a model/Jacobian output of the wrong shape.
/// - [`OdrError::InconsistentJobArgument`] when the job code requests
///   analytic Jacobians the model does not implement, or when the model
///   implements Jacobians the job code does not request.
pub fn resolve_dimensions(
    model: &dyn Model, beta0: &ArrayD<f64>, y: &ArrayD<f64>, x: &ArrayD<f64>, job: &JobFlags,
) -> OdrResult<ProblemDimensions> {
    let dims = ProblemDimensions::from_arrays(x, y, beta0)?;
    let beta: Array1<f64> = beta0.iter().copied().collect();

    let f0 = model.value(&beta, x)?;
    if f0.shape() != y.shape() {
        return Err(OdrError::ShapeMismatch {
            argument: "f",
            expected: format!("model output equal to the shape of 'y' {:?}", y.shape()),
            found: f0.shape().to_vec(),
        });
    }
    validate_model_output("f", f0.iter())?;

    let fjacb = optional_jacobian(model.jacobian_beta(&beta, x))?;
    let fjacd = optional_jacobian(model.jacobian_delta(&beta, x))?;

    if job.has_jac {
        let Some(fjacb) = fjacb else {
            return Err(OdrError::InconsistentJobArgument {
                argument: "fjacb",
                reason: "job code requests analytic Jacobians but 'fjacb' is not implemented",
            });
        };
        check_jacobian_shape("fjacb", &fjacb, dims.n, dims.npar * dims.nq)?;
        match fjacd {
            Some(fjacd) => check_jacobian_shape("fjacd", &fjacd, dims.n, dims.m * dims.nq)?,
            None if job.is_odr => {
                return Err(OdrError::InconsistentJobArgument {
                    argument: "fjacd",
                    reason: "job code requests analytic Jacobians in ODR mode but 'fjacd' is not implemented",
                });
            }
            None => {}
        }
    } else if fjacb.is_some() || fjacd.is_some() {
        let argument = if fjacb.is_some() { "fjacb" } else { "fjacd" };
        return Err(OdrError::InconsistentJobArgument {
            argument,
            reason: "analytic Jacobians are supplied but the job code requests finite differences",
        });
    }

    log::debug!(
        "resolved ODR dimensions n={}, m={}, npar={}, nq={}",
        dims.n,
        dims.m,
        dims.npar,
        dims.nq
    );
    Ok(dims)
}

fn optional_jacobian(jac: OdrResult<ArrayD<f64>>) -> OdrResult<Option<ArrayD<f64>>> {
    match jac {
        Ok(jac) => Ok(Some(jac)),
        Err(OdrError::JacobianNotImplemented { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

fn check_jacobian_shape(argument: &'static str, jac: &ArrayD<f64>, n: usize, per_obs: usize) -> OdrResult<()> {
    let trailing_ok = jac.shape().last() == Some(&n);
    if !trailing_ok || jac.len() != n * per_obs {
        let expected = if argument == "fjacb" {
            format!("trailing axis n = {n} and n·npar·nq = {} elements", n * per_obs)
        } else {
            format!("trailing axis n = {n} and n·m·nq = {} elements", n * per_obs)
        };
        return Err(OdrError::ShapeMismatch { argument, expected, found: jac.shape().to_vec() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::core::model::FnModel;
    use ndarray::{Array, IxDyn};

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Rank rules for `x`, `y` and `beta0`.
    // - Trailing-axis agreement.
    // - Model output checks and Jacobian gating/shape checks.
    // -------------------------------------------------------------------------

    fn zeros(shape: &[usize]) -> ArrayD<f64> {
        ArrayD::zeros(IxDyn(shape))
    }

    fn linear(b: &Array1<f64>, x: &ArrayD<f64>) -> ArrayD<f64> {
        x.mapv(|v| b[0] + b[1] * v)
    }

    #[test]
    // Purpose
    // -------
    // Rank-1 `x`/`y` resolve to m = nq = 1; rank-2 arrays give their leading axis.
    fn dimensions_follow_rank_rules() {
        // Rank 1
        let dims = ProblemDimensions::from_arrays(&zeros(&[7]), &zeros(&[7]), &zeros(&[3])).unwrap();
        assert_eq!(dims, ProblemDimensions { n: 7, m: 1, npar: 3, nq: 1 });

        // Rank 2
        let dims = ProblemDimensions::from_arrays(&zeros(&[2, 10]), &zeros(&[4, 10]), &zeros(&[5])).unwrap();
        assert_eq!(dims, ProblemDimensions { n: 10, m: 2, npar: 5, nq: 4 });
    }

    #[test]
    // Purpose
    // -------
    // A rank-3 `y` is rejected and the message names `y`.
    //
    // Given
    // -----
    // - x of shape (2, 10), y of shape (1, 2, 10).
    fn rank_three_response_is_shape_mismatch() {
        // Act
        let result = ProblemDimensions::from_arrays(&zeros(&[2, 10]), &zeros(&[1, 2, 10]), &zeros(&[2]));

        // Assert
        match result {
            Err(OdrError::ShapeMismatch { argument, found, .. }) => {
                assert_eq!(argument, "y");
                assert_eq!(found, vec![1, 2, 10]);
            }
            other => panic!("expected ShapeMismatch, got: {other:?}"),
        }
    }

    #[test]
    fn trailing_axis_and_parameter_rank_are_checked() {
        let mismatch = ProblemDimensions::from_arrays(&zeros(&[2, 10]), &zeros(&[9]), &zeros(&[2]));
        assert!(matches!(mismatch, Err(OdrError::ShapeMismatch { argument: "y", .. })));

        let beta_rank2 = ProblemDimensions::from_arrays(&zeros(&[4]), &zeros(&[4]), &zeros(&[1, 2]));
        assert!(matches!(beta_rank2, Err(OdrError::ShapeMismatch { argument: "beta0", .. })));

        let x_rank3 = ProblemDimensions::from_arrays(&zeros(&[1, 2, 4]), &zeros(&[4]), &zeros(&[2]));
        assert!(matches!(x_rank3, Err(OdrError::ShapeMismatch { argument: "x", .. })));

        let empty = ProblemDimensions::from_arrays(&zeros(&[0]), &zeros(&[0]), &zeros(&[2]));
        assert!(matches!(empty, Err(OdrError::ShapeMismatch { argument: "n", .. })));
    }

    #[test]
    // Purpose
    // -------
    // A model whose output is not `y`-shaped fails before any solving.
    fn model_output_shape_is_checked() {
        // Arrange
        let x = Array::linspace(0.0, 1.0, 5).into_dyn();
        let y = zeros(&[1, 5]);
        let beta0 = zeros(&[2]);

        // Act
        let result = resolve_dimensions(&linear, &beta0, &y, &x, &JobFlags::decode(0));

        // Assert
        match result {
            Err(OdrError::ShapeMismatch { argument: "f", found, .. }) => assert_eq!(found, vec![5]),
            other => panic!("expected ShapeMismatch for 'f', got: {other:?}"),
        }
    }

    #[test]
    // Purpose
    // -------
    // Analytic-Jacobian job codes need both Jacobians in ODR mode, and
    // finite-difference job codes must not receive any.
    fn jacobian_gating_is_consistent_with_job_code() {
        // Arrange
        let x = Array::linspace(0.0, 1.0, 4).into_dyn();
        let y = zeros(&[4]);
        let beta0 = zeros(&[2]);
        let only_fjacb = FnModel::new(linear).with_jacobian_beta(|_b: &Array1<f64>, x: &ArrayD<f64>| {
            ArrayD::ones(IxDyn(&[2, x.len()]))
        });

        // Act
        let missing_fjacd = resolve_dimensions(&only_fjacb, &beta0, &y, &x, &JobFlags::decode(20));
        let unexpected = resolve_dimensions(&only_fjacb, &beta0, &y, &x, &JobFlags::decode(0));
        let missing_all = resolve_dimensions(&linear, &beta0, &y, &x, &JobFlags::decode(20));
        let ols_ok = resolve_dimensions(&only_fjacb, &beta0, &y, &x, &JobFlags::decode(22));

        // Assert
        assert!(matches!(missing_fjacd, Err(OdrError::InconsistentJobArgument { argument: "fjacd", .. })));
        assert!(matches!(unexpected, Err(OdrError::InconsistentJobArgument { argument: "fjacb", .. })));
        assert!(matches!(missing_all, Err(OdrError::InconsistentJobArgument { argument: "fjacb", .. })));
        assert!(ols_ok.is_ok());
    }

    #[test]
    // Purpose
    // -------
    // Jacobians with the right element count but a wrong trailing axis are rejected.
    fn jacobian_trailing_axis_is_checked() {
        // Arrange
        let x = Array::linspace(0.0, 1.0, 4).into_dyn();
        let y = zeros(&[4]);
        let beta0 = zeros(&[2]);
        let model = FnModel::new(linear)
            .with_jacobian_beta(|_b: &Array1<f64>, _x: &ArrayD<f64>| ArrayD::ones(IxDyn(&[4, 2])))
            .with_jacobian_delta(|_b: &Array1<f64>, x: &ArrayD<f64>| ArrayD::ones(IxDyn(&[x.len()])));

        // Act
        let result = resolve_dimensions(&model, &beta0, &y, &x, &JobFlags::decode(20));

        // Assert
        match result {
            Err(OdrError::ShapeMismatch { argument: "fjacb", found, .. }) => assert_eq!(found, vec![4, 2]),
            other => panic!("expected ShapeMismatch for 'fjacb', got: {other:?}"),
        }
    }
}
