//! High-level entry point for fitting a user-provided [`Model`] by weighted
//! orthogonal distance regression.
//!
//! [`fit`] runs the bundled [`TrustRegionSolver`]; [`fit_with`] accepts any
//! [`OdrSolver`]. Both perform every validation before the solver touches a
//! buffer, so a returned error always means nothing was solved.
use crate::{
    regression::{
        core::{
            job::JobFlags, model::Model, normalize::normalize_parameters, options::OdrOptions,
            options::SolverSettings, shape::resolve_dimensions,
            workspace::{WorkspaceBuffers, WorkspacePlan},
        },
        errors::OdrResult,
        result::RegressionResult,
    },
    solver::{OdrSolver, SolverCall, TrustRegionSolver},
};
use ndarray::{Array1, ArrayD};

/// Fit `model` to `(x, y)` starting from `beta0`.
///
/// # Behavior
/// - Decodes `options.job` once into [`JobFlags`].
/// - Resolves `(n, m, npar, nq)` from `x`, `y` and `beta0`, evaluating the
///   model (and its Jacobians when the job code asks for them) at `beta0`.
/// - Resolves the solver controls, dropping out-of-range values back to the
///   defaults. Normalizes every optional array and plans the `work`/`iwork`
///   buffers, or validates restart buffers.
/// - Runs the solver and decodes its buffers into a [`RegressionResult`].
///
/// # Implicit problems
/// The bundled solver fits explicit ODR and OLS problems only. A job code
/// with digit 1 equal to `1` (implicit ODR, `f(β, x + δ) = 0`) passes
/// validation but returns a result with `info = 10001`, `success() == false`
/// and `beta` left at `beta0`. Supply another [`OdrSolver`] through
/// [`fit_with`] to handle such problems.
///
/// # Parameters
/// - `model`: the regression function; receives `x + delta` in `x`'s shape.
/// - `beta0`: initial parameters, shape `(npar,)`.
/// - `y`: responses, `(n,)` or `(nq, n)`.
/// - `x`: explanatory variables, `(n,)` or `(m, n)`.
/// - `options`: optional arguments; `OdrOptions::default()` runs a plain
///   explicit ODR fit with finite differences.
///
/// # Errors
/// - Any [`OdrError`](crate::regression::errors::OdrError) raised by shape
///   resolution, normalization or buffer preparation.
///   Solver status codes are not errors; inspect
///   [`RegressionResult::info`] and [`RegressionResult::success`].
///
/// # Example
/// ```
/// use ndarray::{array, Array1, ArrayD};
/// use rust_odr::regression::{api::fit, core::options::OdrOptions};
///
/// let x = array![0.0, 1.0, 2.0, 3.0, 4.0].into_dyn();
/// let y = array![1.1, 2.9, 5.2, 7.1, 8.8].into_dyn();
/// let beta0 = array![1.0, 1.0].into_dyn();
/// let line = |b: &Array1<f64>, x: &ArrayD<f64>| x.mapv(|v| b[0] + b[1] * v);
///
/// let result = fit(&line, &beta0, &y, &x, &OdrOptions::default())?;
/// assert!(result.success());
/// # Ok::<(), rust_odr::regression::errors::OdrError>(())
/// ```
pub fn fit(
    model: &dyn Model, beta0: &ArrayD<f64>, y: &ArrayD<f64>, x: &ArrayD<f64>, options: &OdrOptions,
) -> OdrResult<RegressionResult> {
    fit_with(&TrustRegionSolver, model, beta0, y, x, options)
}

/// Same as [`fit`] with a caller-chosen solver.
pub fn fit_with(
    solver: &dyn OdrSolver, model: &dyn Model, beta0: &ArrayD<f64>, y: &ArrayD<f64>, x: &ArrayD<f64>,
    options: &OdrOptions,
) -> OdrResult<RegressionResult> {
    let job = JobFlags::decode(options.job);
    let dims = resolve_dimensions(model, beta0, y, x, &job)?;
    let settings = SolverSettings::from_options(options);

    let beta0: Array1<f64> = beta0.iter().copied().collect();
    let params = normalize_parameters(options, &beta0, x.shape(), &dims, &job)?;
    let plan = WorkspacePlan::new(dims, job.is_odr, params.we.spec);
    let buffers = plan.prepare(&job, options.work.clone(), options.iwork.clone())?;
    log::debug!("planned ODR buffers lwork={}, liwork={}", plan.lwork, plan.liwork);

    let mut beta = beta0;
    let mut delta = params.delta0.clone();
    let mut work = buffers.work.to_vec();
    let mut iwork = buffers.iwork.to_vec();

    let info = solver.solve(SolverCall {
        dims,
        job,
        model,
        x,
        y,
        beta: &mut beta,
        delta: &mut delta,
        params: &params,
        settings: &settings,
        plan: &plan,
        work: &mut work,
        iwork: &mut iwork,
    });

    let buffers = WorkspaceBuffers { work: Array1::from(work), iwork: Array1::from(iwork) };
    RegressionResult::decode(&plan, beta, delta, x, y, info, buffers)
}
