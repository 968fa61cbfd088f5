//! Model capability contract.
//!
//! - [`Model`]: trait users implement for their regression function.
//! - [`FnModel`]: closure-backed model with optional analytic Jacobians.
//!
//! A model is a pure mapping `(beta, x + delta) -> y`-shaped array. It is
//! called several times per fit (shape checks, finite differences, trial
//! points) and must return identical output for identical arguments.
use crate::regression::errors::{OdrError, OdrResult};
use ndarray::{Array1, ArrayD};

/// User-implemented regression function.
///
/// Required:
/// - `value(&beta, &xplusd) -> OdrResult<ArrayD<f64>>`: evaluate the model.
///   `xplusd` has the caller's `x` shape; the output must have the caller's
///   `y` shape. Return [`OdrError::ModelStop`] to reject a point; the solver
///   then shrinks its step.
///
/// Optional:
/// - `jacobian_beta`: `∂f/∂β` as an array whose trailing axis is `n` and
///   whose memory order is `(nq, npar, n)`.
/// - `jacobian_delta`: `∂f/∂x` laid out as `(nq, m, n)`.
///
/// When an optional method is left out, the job code must request finite
/// differences; the shape resolver rejects the mismatch before solving.
pub trait Model {
    fn value(&self, beta: &Array1<f64>, xplusd: &ArrayD<f64>) -> OdrResult<ArrayD<f64>>;

    fn jacobian_beta(&self, _beta: &Array1<f64>, _xplusd: &ArrayD<f64>) -> OdrResult<ArrayD<f64>> {
        Err(OdrError::JacobianNotImplemented { which: "fjacb" })
    }

    fn jacobian_delta(&self, _beta: &Array1<f64>, _xplusd: &ArrayD<f64>) -> OdrResult<ArrayD<f64>> {
        Err(OdrError::JacobianNotImplemented { which: "fjacd" })
    }
}

impl<F> Model for F
where
    F: Fn(&Array1<f64>, &ArrayD<f64>) -> ArrayD<f64>,
{
    fn value(&self, beta: &Array1<f64>, xplusd: &ArrayD<f64>) -> OdrResult<ArrayD<f64>> {
        Ok(self(beta, xplusd))
    }
}

type ArrayFn<'a> = Box<dyn Fn(&Array1<f64>, &ArrayD<f64>) -> ArrayD<f64> + Send + Sync + 'a>;

/// Closure-backed [`Model`] that can carry analytic Jacobians.
///
/// # Examples
/// ```
/// use ndarray::{Array1, ArrayD};
/// use rust_odr::regression::core::model::FnModel;
///
/// let line = FnModel::new(|b: &Array1<f64>, x: &ArrayD<f64>| x.mapv(|v| b[0] + b[1] * v))
///     .with_jacobian_beta(|_b: &Array1<f64>, x: &ArrayD<f64>| {
///         let n = x.len();
///         let mut jac = ArrayD::<f64>::ones(ndarray::IxDyn(&[2, n]));
///         for (i, v) in x.iter().enumerate() {
///             jac[[1, i]] = *v;
///         }
///         jac
///     });
/// # let _ = line;
/// ```
pub struct FnModel<'a> {
    f: ArrayFn<'a>,
    fjacb: Option<ArrayFn<'a>>,
    fjacd: Option<ArrayFn<'a>>,
}

impl<'a> FnModel<'a> {
    pub fn new(f: impl Fn(&Array1<f64>, &ArrayD<f64>) -> ArrayD<f64> + Send + Sync + 'a) -> Self {
        Self { f: Box::new(f), fjacb: None, fjacd: None }
    }

    pub fn with_jacobian_beta(
        mut self, fjacb: impl Fn(&Array1<f64>, &ArrayD<f64>) -> ArrayD<f64> + Send + Sync + 'a,
    ) -> Self {
        self.fjacb = Some(Box::new(fjacb));
        self
    }

    pub fn with_jacobian_delta(
        mut self, fjacd: impl Fn(&Array1<f64>, &ArrayD<f64>) -> ArrayD<f64> + Send + Sync + 'a,
    ) -> Self {
        self.fjacd = Some(Box::new(fjacd));
        self
    }
}

impl Model for FnModel<'_> {
    fn value(&self, beta: &Array1<f64>, xplusd: &ArrayD<f64>) -> OdrResult<ArrayD<f64>> {
        Ok((self.f)(beta, xplusd))
    }

    fn jacobian_beta(&self, beta: &Array1<f64>, xplusd: &ArrayD<f64>) -> OdrResult<ArrayD<f64>> {
        match &self.fjacb {
            Some(fjacb) => Ok(fjacb(beta, xplusd)),
            None => Err(OdrError::JacobianNotImplemented { which: "fjacb" }),
        }
    }

    fn jacobian_delta(&self, beta: &Array1<f64>, xplusd: &ArrayD<f64>) -> OdrResult<ArrayD<f64>> {
        match &self.fjacd {
            Some(fjacd) => Ok(fjacd(beta, xplusd)),
            None => Err(OdrError::JacobianNotImplemented { which: "fjacd" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{IxDyn, array};

    #[test]
    // Purpose
    // -------
    // Plain closures are models without Jacobians.
    fn closure_model_reports_missing_jacobians() {
        // Arrange
        let f = |b: &Array1<f64>, x: &ArrayD<f64>| x.mapv(|v| b[0] * v);
        let beta = array![2.0];
        let x = ArrayD::from_shape_vec(IxDyn(&[3]), vec![1.0, 2.0, 3.0]).unwrap();

        // Act
        let value = f.value(&beta, &x).unwrap();
        let jac = f.jacobian_beta(&beta, &x);

        // Assert
        assert_eq!(value.as_slice().unwrap(), &[2.0, 4.0, 6.0]);
        assert_eq!(jac, Err(OdrError::JacobianNotImplemented { which: "fjacb" }));
    }

    #[test]
    fn fn_model_forwards_attached_jacobians() {
        let model = FnModel::new(|b: &Array1<f64>, x: &ArrayD<f64>| x.mapv(|v| b[0] * v))
            .with_jacobian_beta(|_b: &Array1<f64>, x: &ArrayD<f64>| x.clone());
        let beta = array![2.0];
        let x = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, 5.0]).unwrap();

        assert_eq!(model.jacobian_beta(&beta, &x).unwrap(), x);
        assert!(matches!(
            model.jacobian_delta(&beta, &x),
            Err(OdrError::JacobianNotImplemented { which: "fjacd" })
        ));
    }
}
