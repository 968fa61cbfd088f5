//! Result decoding: named fields out of the solver buffers.
//!
//! Purpose
//! -------
//! Read the solver's mutated `work`/`iwork` buffers through the offset maps
//! of a [`WorkspacePlan`], copy the named fields into owned arrays and build
//! the immutable [`RegressionResult`].
//!
//! Key behaviors
//! -------------
//! - `eps` is reshaped to `y`'s shape, `vcv` to `(npar, npar)`, `delta` to
//!   `x`'s shape.
//! - `xplus = x + delta` and `yest = y + eps`.
//! - `success` is `info < 4`; the stop reason comes from [`stop_reason`].
//!
//! Invariants & assumptions
//! ------------------------
//! - Every derived field is a copy, so reusing the raw buffers for a restart
//!   cannot change a result that was already returned.
use crate::regression::{
    core::workspace::{WorkspaceBuffers, WorkspacePlan},
    errors::{OdrError, OdrResult},
};
use ndarray::{Array1, Array2, ArrayD, IxDyn};

/// First status code that is not a convergence.
pub const ITERATION_LIMIT: i32 = 4;

const STOP_REASONS: [(i32, &str); 4] = [
    (1, "Sum of squares convergence."),
    (2, "Parameter convergence."),
    (3, "Sum of squares and parameter convergence."),
    (4, "Iteration limit reached."),
];

const QUESTIONABLE: &str = "Questionable results or fatal errors detected. See report and error message.";

/// Human-readable reason for a solver status code.
pub fn stop_reason(info: i32) -> &'static str {
    STOP_REASONS.iter().find(|(code, _)| *code == info).map_or(QUESTIONABLE, |(_, reason)| *reason)
}

/// Outcome of an ODR fit.
///
/// All arrays are owned copies. `work`/`iwork` are the raw solver buffers and
/// can be handed to a restart through [`RegressionResult::into_workspace`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionResult {
    beta: Array1<f64>,
    delta: ArrayD<f64>,
    eps: ArrayD<f64>,
    xplus: ArrayD<f64>,
    yest: ArrayD<f64>,
    sd_beta: Array1<f64>,
    cov_beta: Array2<f64>,
    res_var: f64,
    info: i32,
    stopreason: &'static str,
    success: bool,
    nfev: usize,
    njev: usize,
    niter: usize,
    irank: i32,
    inv_condnum: f64,
    sum_square: f64,
    sum_square_delta: f64,
    sum_square_eps: f64,
    work: Array1<f64>,
    iwork: Array1<i32>,
}

impl RegressionResult {
    /// Decode the solver's buffers.
    ///
    /// Parameters
    /// ----------
    /// - `plan`: the plan the buffers were allocated or validated with.
    /// - `beta`: fitted parameters.
    /// - `delta`: fitted `x` errors as `(m, n)`.
    /// - `x`, `y`: caller arrays (their shapes drive the reshapes).
    /// - `info`: solver status code.
    /// - `buffers`: solver buffers; moved into the result.
    ///
    /// Errors
    /// ------
    /// - [`OdrError::ShapeMismatch`] if `delta` or a buffer field cannot take
    ///   the caller's shapes, which only happens when `plan` does not belong
    ///   to `x`/`y`.
    pub fn decode(
        plan: &WorkspacePlan, beta: Array1<f64>, delta: Array2<f64>, x: &ArrayD<f64>, y: &ArrayD<f64>,
        info: i32, buffers: WorkspaceBuffers,
    ) -> OdrResult<Self> {
        let dims = plan.dims;
        let w = &plan.work;
        let iw = &plan.iwork;

        let delta = reshape("delta", delta.iter().copied().collect(), x.shape())?;
        let eps = reshape("eps", buffers.real(w.eps, dims.n * dims.nq).to_vec(), y.shape())?;
        let sd_beta = buffers.real(w.sd, dims.npar).to_owned();
        let cov_beta = buffers
            .real(w.vcv, dims.npar * dims.npar)
            .to_owned()
            .into_shape_with_order((dims.npar, dims.npar))
            .map_err(|_| OdrError::ShapeMismatch {
                argument: "vcv",
                expected: format!("({}, {})", dims.npar, dims.npar),
                found: vec![dims.npar * dims.npar],
            })?;

        let xplus = x + &delta;
        let yest = y + &eps;

        Ok(Self {
            beta,
            delta,
            eps,
            xplus,
            yest,
            sd_beta,
            cov_beta,
            res_var: buffers.real_scalar(w.rvar),
            info,
            stopreason: stop_reason(info),
            success: info < ITERATION_LIMIT,
            nfev: counter(buffers.int_scalar(iw.nfev)),
            njev: counter(buffers.int_scalar(iw.njev)),
            niter: counter(buffers.int_scalar(iw.niter)),
            irank: buffers.int_scalar(iw.irank),
            inv_condnum: buffers.real_scalar(w.rcond),
            sum_square: buffers.real_scalar(w.wss),
            sum_square_delta: buffers.real_scalar(w.wssde),
            sum_square_eps: buffers.real_scalar(w.wssep),
            work: buffers.work,
            iwork: buffers.iwork,
        })
    }

    pub fn beta(&self) -> &Array1<f64> {
        &self.beta
    }

    /// Estimated errors in `x`, shaped like `x`.
    pub fn delta(&self) -> &ArrayD<f64> {
        &self.delta
    }

    /// Estimated errors in `y`, shaped like `y`.
    pub fn eps(&self) -> &ArrayD<f64> {
        &self.eps
    }

    pub fn xplus(&self) -> &ArrayD<f64> {
        &self.xplus
    }

    pub fn yest(&self) -> &ArrayD<f64> {
        &self.yest
    }

    pub fn sd_beta(&self) -> &Array1<f64> {
        &self.sd_beta
    }

    pub fn cov_beta(&self) -> &Array2<f64> {
        &self.cov_beta
    }

    pub fn res_var(&self) -> f64 {
        self.res_var
    }

    pub fn info(&self) -> i32 {
        self.info
    }

    pub fn stopreason(&self) -> &'static str {
        self.stopreason
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn nfev(&self) -> usize {
        self.nfev
    }

    pub fn njev(&self) -> usize {
        self.njev
    }

    pub fn niter(&self) -> usize {
        self.niter
    }

    pub fn irank(&self) -> i32 {
        self.irank
    }

    /// Inverse condition number of the parameter Jacobian.
    pub fn inv_condnum(&self) -> f64 {
        self.inv_condnum
    }

    /// Weighted sum of squares of `delta` and `eps`.
    pub fn sum_square(&self) -> f64 {
        self.sum_square
    }

    pub fn sum_square_delta(&self) -> f64 {
        self.sum_square_delta
    }

    pub fn sum_square_eps(&self) -> f64 {
        self.sum_square_eps
    }

    pub fn work(&self) -> &Array1<f64> {
        &self.work
    }

    pub fn iwork(&self) -> &Array1<i32> {
        &self.iwork
    }

    /// Hand the raw buffers over for a restart.
    pub fn into_workspace(self) -> WorkspaceBuffers {
        WorkspaceBuffers { work: self.work, iwork: self.iwork }
    }
}

impl std::fmt::Display for RegressionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Beta: {}", self.beta)?;
        writeln!(f, "Beta Std Error: {}", self.sd_beta)?;
        writeln!(f, "Beta Covariance: {}", self.cov_beta)?;
        writeln!(f, "Residual Variance: {}", self.res_var)?;
        writeln!(f, "Inverse Condition #: {}", self.inv_condnum)?;
        write!(f, "Reason(s) for Halting: {} (info = {})", self.stopreason, self.info)
    }
}

fn reshape(argument: &'static str, flat: Vec<f64>, shape: &[usize]) -> OdrResult<ArrayD<f64>> {
    let len = flat.len();
    ArrayD::from_shape_vec(IxDyn(shape), flat).map_err(|_| OdrError::ShapeMismatch {
        argument,
        expected: format!("{shape:?}"),
        found: vec![len],
    })
}

fn counter(value: i32) -> usize {
    usize::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::core::{normalize::WeightSpec, shape::ProblemDimensions};
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover the status table and decoding from hand-filled
    // buffers. Decoding after a real solver run is covered in the
    // integration tests.
    // -------------------------------------------------------------------------

    #[test]
    fn status_table_covers_convergence_and_failures() {
        assert_eq!(stop_reason(1), "Sum of squares convergence.");
        assert_eq!(stop_reason(2), "Parameter convergence.");
        assert_eq!(stop_reason(3), "Sum of squares and parameter convergence.");
        assert_eq!(stop_reason(4), "Iteration limit reached.");
        assert!(stop_reason(5).starts_with("Questionable results"));
        assert!(stop_reason(40000).starts_with("Questionable results"));
        assert!(stop_reason(0).starts_with("Questionable results"));
    }

    #[test]
    // Purpose
    // -------
    // Decode hand-filled buffers and check every field lands in place.
    //
    // Given
    // -----
    // - n = 3, m = 1, npar = 2, nq = 1; buffers filled at the planned offsets.
    //
    // Expect
    // ------
    // - Reshapes follow `x`/`y`, sums and counters are read from their slots,
    //   and `xplus`/`yest` are derived from `delta`/`eps`.
    fn decode_reads_named_fields() {
        // Arrange
        let plan = WorkspacePlan::new(ProblemDimensions::new(3, 1, 2, 1).unwrap(), true, WeightSpec::default());
        let mut buffers = plan.allocate();
        let (w, iw) = (plan.work, plan.iwork);
        for (k, v) in [0.1, -0.2, 0.3].into_iter().enumerate() {
            buffers.work[w.eps + k] = v;
        }
        buffers.work[w.sd] = 0.5;
        buffers.work[w.sd + 1] = 0.25;
        for (k, v) in [4.0, 1.0, 1.0, 9.0].into_iter().enumerate() {
            buffers.work[w.vcv + k] = v;
        }
        buffers.work[w.rvar] = 2.0;
        buffers.work[w.wss] = 1.5;
        buffers.work[w.wssde] = 0.5;
        buffers.work[w.wssep] = 1.0;
        buffers.work[w.rcond] = 0.125;
        buffers.iwork[iw.nfev] = 17;
        buffers.iwork[iw.njev] = 4;
        buffers.iwork[iw.niter] = 3;
        let x = array![1.0, 2.0, 3.0].into_dyn();
        let y = array![2.0, 4.0, 6.0].into_dyn();
        let delta = array![[0.01, 0.02, 0.03]];

        // Act
        let res = RegressionResult::decode(&plan, array![1.0, 2.0], delta, &x, &y, 1, buffers).unwrap();

        // Assert
        assert_eq!(res.eps().shape(), &[3]);
        assert_eq!(res.delta().shape(), &[3]);
        for (got, want) in res.yest().iter().zip([2.1, 3.8, 6.3]) {
            assert!((got - want).abs() < 1e-12);
        }
        for (got, want) in res.xplus().iter().zip([1.01, 2.02, 3.03]) {
            assert!((got - want).abs() < 1e-12);
        }
        assert_eq!(res.cov_beta(), &array![[4.0, 1.0], [1.0, 9.0]]);
        assert_eq!(res.sd_beta(), &array![0.5, 0.25]);
        assert_eq!((res.res_var(), res.sum_square(), res.sum_square_delta(), res.sum_square_eps()), (2.0, 1.5, 0.5, 1.0));
        assert_eq!(res.inv_condnum(), 0.125);
        assert_eq!((res.nfev(), res.njev(), res.niter()), (17, 4, 3));
        assert!(res.success());
        assert_eq!(res.stopreason(), "Sum of squares convergence.");
    }

    #[test]
    // Purpose
    // -------
    // Mutating the returned buffers must not alter decoded fields.
    fn decoded_fields_do_not_alias_buffers() {
        // Arrange
        let plan = WorkspacePlan::new(ProblemDimensions::new(2, 1, 1, 1).unwrap(), false, WeightSpec::default());
        let mut buffers = plan.allocate();
        buffers.work[plan.work.eps] = 1.0;
        let x = array![0.0, 1.0].into_dyn();
        let y = array![0.0, 1.0].into_dyn();
        let res = RegressionResult::decode(&plan, array![1.0], Array2::zeros((1, 2)), &x, &y, 4, buffers).unwrap();
        let eps_before = res.eps().clone();

        // Act
        let mut reused = res.clone().into_workspace();
        reused.work[plan.work.eps] = -7.0;

        // Assert
        assert_eq!(res.eps(), &eps_before);
        assert!(!res.success());
        assert_eq!(res.stopreason(), "Iteration limit reached.");
    }
}
