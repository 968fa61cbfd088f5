//! Reference solver: bounded Levenberg–Marquardt trust region on the
//! augmented ODR residual.
//!
//! Purpose
//! -------
//! Minimize the weighted sum of squares
//! `Σ_i ε_iᵀ W_e,i ε_i + δ_iᵀ W_d,i δ_i` with `ε_i = f(β, x_i + δ_i) − y_i`
//! over the free parameters `β` and, in explicit ODR mode, the free errors
//! `δ`. Ordinary least squares is the special case with no `δ` unknowns.
//!
//! Key behaviors
//! -------------
//! - The residual vector stacks `U_i ε_i` (observation-major, then response)
//!   followed by `V_i δ_i`, where `U_i`/`V_i` are weight square roots.
//! - Steps solve `(JᵀJ + λD²) s = −Jᵀr` with `λ` chosen so that `‖D s‖`
//!   fits the trust radius; `D` holds the parameter and error scales. The
//!   first radius is `taufac` times the scaled Gauss–Newton step. The radius
//!   halves after poor steps and doubles after good ones.
//! - The `δ` unknowns are eliminated per observation (see
//!   [`super::blocks`]), so an iteration is linear in `n`.
//! - Bounds: a parameter sitting at a bound with the gradient pushing
//!   outward is frozen for the iteration. A parameter whose step would cross
//!   a bound is moved onto it and frozen, and the other unknowns are solved
//!   again with that move in place.
//! - Finite-difference steps never leave the bounds: a step that would is
//!   taken in the opposite direction.
//! - Status: `1` sum-of-squares convergence, `2` parameter convergence, `3`
//!   both, `4` iteration limit, [`STATUS_NUMERICAL_FAILURE`],
//!   [`STATUS_MODEL_STOP`], [`STATUS_MODEL_STOP_DERIVATIVE`] and
//!   [`STATUS_IMPLICIT_UNSUPPORTED`].
//!
//! Invariants & assumptions
//! ------------------------
//! - Inputs were validated by the marshalling layer; buffers have the planned
//!   lengths. Out-of-range writes are skipped rather than panicking.
//! - The model treats observations independently, so one evaluation per
//!   `x` dimension yields the whole `∂f/∂δ`.
//! - `maxit = 0` evaluates the starting point and its covariance only.
//!
//! Conventions
//! -----------
//! - Buffer layouts are C-order: `delta`, `xplus` as `(m, n)`, `eps`, `fn`
//!   as `(nq, n)`, `fjacb` as `(nq, npar, n)`, `fjacd` as `(nq, m, n)`,
//!   `vcv` as `(npar, npar)`.
use super::{
    OdrSolver, SolverCall,
    blocks::{BlockStep, BlockSystem, ObservationBlock},
    linalg::{inverse_condition, weight_root},
    report::{DestinationReporter, FinishReport, IterationReport, Reporter, StartReport},
};
use crate::regression::{
    core::{
        job::{CovarianceMode, DerivativeMode, FitKind, JobFlags},
        model::Model,
        normalize::{NormalizedParameters, NormalizedWeight, broadcast_ld},
        options::{ReportDestination, SolverSettings},
        shape::ProblemDimensions,
        validation::validate_model_output,
        workspace::WorkspacePlan,
    },
    errors::{OdrError, OdrResult},
};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Array3, ArrayD};

/// Implicit ODR was requested.
pub const STATUS_IMPLICIT_UNSUPPORTED: i32 = 10_001;
/// No acceptable step could be found, or the model produced unusable output.
pub const STATUS_NUMERICAL_FAILURE: i32 = 40_000;
/// The model requested a stop at the initial point.
pub const STATUS_MODEL_STOP: i32 = 51_000;
/// The model requested a stop while derivatives were evaluated.
pub const STATUS_MODEL_STOP_DERIVATIVE: i32 = 52_000;

const ACCEPT_RATIO: f64 = 1e-4;
const MAX_REJECTIONS: usize = 40;
const DEFAULT_MAXIT: usize = 50;
const DEFAULT_MAXIT_RESTART: usize = 10;

/// Bounded trust-region solver for explicit ODR and OLS problems.
///
/// Implicit ODR (job digit 1 equal to `1`) is not fitted: the call returns
/// [`STATUS_IMPLICIT_UNSUPPORTED`] with `beta` and `delta` untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustRegionSolver;

impl OdrSolver for TrustRegionSolver {
    fn solve(&self, call: SolverCall<'_>) -> i32 {
        let SolverCall { dims, job, model, x, y, beta, delta, params, settings, plan, work, iwork } = call;
        let controls = Controls::resolve(settings, &job);
        let mut buffers = Buffers { plan, work, iwork };
        buffers.store_controls(&controls, &job, settings, params, dims.npar);
        let mut reporter = DestinationReporter::new(settings.iprint, settings.report.clone(), settings.error.clone());

        let mut counters = Counters::default();
        if job.is_restart {
            counters = buffers.load_restart(beta, delta);
        }
        if !job.is_odr {
            delta.fill(0.0);
        }

        if job.fit_kind == FitKind::ImplicitOdr {
            log::warn!("implicit ODR (job digit 1 = 1) is not supported by the trust-region solver");
            reporter.on_error("Implicit ODR problems are not supported.");
            buffers.store_counters(&counters, 0);
            return STATUS_IMPLICIT_UNSUPPORTED;
        }

        let mut session = match Session::new(dims, job, model, x, y, params, controls, counters) {
            Ok(session) => session,
            Err(err) => return fail_early(&mut buffers, &mut reporter, &counters, err, STATUS_NUMERICAL_FAILURE),
        };
        session.clamp_to_bounds(beta);
        let beta0 = beta.clone();
        buffers.store_scales(&session);

        let start = match session.point(beta.clone(), delta.clone()) {
            Ok(point) => point,
            Err(err) => {
                let counters = session.counters;
                return fail_early(&mut buffers, &mut reporter, &counters, err, STATUS_MODEL_STOP);
            }
        };

        reporter.on_start(&StartReport {
            n: dims.n,
            m: dims.m,
            npar: dims.npar,
            nq: dims.nq,
            job: job.code,
            is_odr: job.is_odr,
            restart: job.is_restart,
            beta: start.beta.clone(),
            sum_square: start.wss,
        });

        let mut state = State::new(start);
        let info = session.run(&mut state, &mut reporter, &mut buffers);
        let covariance = if (1..=4).contains(&info) {
            session.covariance(&mut state)
        } else {
            Covariance::skipped(dims.npar)
        };

        *beta = state.point.beta.clone();
        *delta = state.point.delta.clone();
        buffers.store_solution(&session, &state, &covariance, &beta0);

        reporter.on_finish(&FinishReport {
            info,
            niter: session.counters.niter,
            nfev: session.counters.nfev,
            njev: session.counters.njev,
            sum_square: state.point.wss,
            sum_square_delta: state.point.wssde,
            sum_square_eps: state.point.wssep,
            res_var: covariance.rvar,
            inv_condnum: covariance.rcond,
            beta: state.point.beta.clone(),
            sd_beta: covariance.sd.clone(),
        });
        if info > 4 {
            reporter.on_error(&format!("ODR terminated abnormally with info = {info}."));
        }
        log::info!(
            "ODR finished: info={info}, niter={}, nfev={}, wss={:.6e}",
            session.counters.niter,
            session.counters.nfev,
            state.point.wss
        );
        info
    }
}

fn fail_early(
    buffers: &mut Buffers<'_>, reporter: &mut dyn Reporter, counters: &Counters, err: OdrError, stop_code: i32,
) -> i32 {
    let code = if err == OdrError::ModelStop { stop_code } else { STATUS_NUMERICAL_FAILURE };
    log::warn!("ODR could not start: {err}");
    reporter.on_error(&format!("ODR could not evaluate the initial point: {err}"));
    buffers.store_counters(counters, 0);
    code
}

/// Numeric controls with defaults filled in.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Controls {
    eta: f64,
    sstol: f64,
    partol: f64,
    taufac: f64,
    maxit: usize,
    forward_step: f64,
    central_step: f64,
    check_tol: f64,
}

impl Controls {
    fn resolve(settings: &SolverSettings, job: &JobFlags) -> Self {
        let eps = f64::EPSILON;
        let eta = settings.ndigit.map_or(eps, |digits| eps.max(10f64.powi(-digits)));
        let default_maxit = if job.is_restart { DEFAULT_MAXIT_RESTART } else { DEFAULT_MAXIT };
        Self {
            eta,
            sstol: settings.sstol.unwrap_or(eps.sqrt()),
            partol: settings.partol.unwrap_or(eps.powf(2.0 / 3.0)),
            taufac: settings.taufac.unwrap_or(1.0),
            maxit: settings.maxit.and_then(|v| usize::try_from(v).ok()).unwrap_or(default_maxit),
            forward_step: eta.sqrt(),
            central_step: eta.cbrt(),
            check_tol: eta.powf(0.25),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    niter: usize,
    nfev: usize,
    njev: usize,
    stops: usize,
}

/// Model output and residual at one `(β, δ)`.
#[derive(Debug, Clone)]
struct Point {
    beta: Array1<f64>,
    delta: Array2<f64>,
    /// `(nq, n)`
    f: Array2<f64>,
    r: DVector<f64>,
    wss: f64,
    wssep: f64,
    wssde: f64,
}

#[derive(Debug, Clone)]
struct Jacobians {
    /// `(nq, npar, n)`
    beta: Array3<f64>,
    /// `(nq, m, n)`, ODR only.
    delta: Option<Array3<f64>>,
}

/// Iteration state carried between steps.
#[derive(Debug, Clone)]
struct State {
    point: Point,
    jac: Option<Jacobians>,
    lambda: f64,
    lambda_sum: f64,
    /// Trust radius in scaled units; 0 until the first iteration sets it.
    radius: f64,
    iterations: usize,
    rejected: usize,
    actrs: f64,
    prers: f64,
    step_norm: f64,
    pnorm: f64,
    betas: Array1<f64>,
    betan: Array1<f64>,
    delts: Array2<f64>,
    s: Array1<f64>,
    t: Array2<f64>,
    msgb: Vec<i32>,
    msgd: Vec<i32>,
}

impl State {
    fn new(point: Point) -> Self {
        let (np, m, n) = (point.beta.len(), point.delta.nrows(), point.delta.ncols());
        Self {
            betas: point.beta.clone(),
            betan: point.beta.clone(),
            delts: point.delta.clone(),
            point,
            jac: None,
            lambda: 0.0,
            lambda_sum: 0.0,
            radius: 0.0,
            iterations: 0,
            rejected: 0,
            actrs: 0.0,
            prers: 0.0,
            step_norm: 0.0,
            pnorm: 0.0,
            s: Array1::zeros(np),
            t: Array2::zeros((m, n)),
            msgb: vec![-1],
            msgd: vec![-1],
        }
    }

    /// Halve the radius after a poor step, widen it after a good one.
    fn update_radius(&mut self, ratio: f64, step_norm: f64) {
        if ratio < 0.25 {
            self.radius = 0.5 * self.radius.min(step_norm);
        } else if ratio > 0.75 {
            self.radius = self.radius.max(2.0 * step_norm);
        }
    }
}

#[derive(Debug, Clone)]
struct Covariance {
    vcv: Array2<f64>,
    sd: Array1<f64>,
    rvar: f64,
    rcond: f64,
    irank: usize,
    /// 1 for parameters estimated at the solution, 0 for fixed or pinned.
    ifix2: Vec<i32>,
    /// 0 free, 1 at lower bound, 2 at upper bound.
    bound: Vec<i32>,
}

impl Covariance {
    fn skipped(npar: usize) -> Self {
        Self {
            vcv: Array2::zeros((npar, npar)),
            sd: Array1::zeros(npar),
            rvar: 0.0,
            rcond: 0.0,
            irank: 0,
            ifix2: vec![0; npar],
            bound: vec![0; npar],
        }
    }
}

/// One problem bound to a model, with weight roots and scales precomputed.
struct Session<'a> {
    dims: ProblemDimensions,
    job: JobFlags,
    model: &'a dyn Model,
    x: &'a ArrayD<f64>,
    y_shape: Vec<usize>,
    /// `(nq, n)`
    y: Array2<f64>,
    /// `(m, n)`
    x2: Array2<f64>,
    params: &'a NormalizedParameters,
    controls: Controls,
    lower: Array1<f64>,
    upper: Array1<f64>,
    we_roots: Vec<DMatrix<f64>>,
    wd_roots: Vec<DMatrix<f64>>,
    nnzw: usize,
    beta_scale: Array1<f64>,
    delta_scale: Array2<f64>,
    /// Parameters left free by `ifixb`; one column each in the step.
    free_beta: Vec<usize>,
    /// Per observation, the `x` dimensions whose error is estimated.
    free_delta: Vec<Vec<usize>>,
    counters: Counters,
}

impl<'a> Session<'a> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        dims: ProblemDimensions, job: JobFlags, model: &'a dyn Model, x: &'a ArrayD<f64>, y: &'a ArrayD<f64>,
        params: &'a NormalizedParameters, controls: Controls, counters: Counters,
    ) -> OdrResult<Self> {
        let ProblemDimensions { n, m, npar, nq } = dims;
        let y2 = to_matrix("y", y, nq, n)?;
        let x2 = to_matrix("x", x, m, n)?;

        let we_roots = weight_roots(&params.we);
        let wd_roots = weight_roots(&params.wd);
        let nnzw = (0..n).filter(|&i| params.we.block(i).iter().any(|&w| w != 0.0)).count();

        let lower = params.lower.clone().unwrap_or_else(|| Array1::from_elem(npar, -f64::MAX));
        let upper = params.upper.clone().unwrap_or_else(|| Array1::from_elem(npar, f64::MAX));

        let free_beta = (0..npar).filter(|&k| params.ifixb.as_ref().is_none_or(|fix| fix[k] != 0)).collect();
        let free_delta = (0..n)
            .map(|i| {
                if job.is_odr {
                    (0..m).filter(|&j| params.ifixx.as_ref().is_none_or(|fix| fix.get(j, i) != 0)).collect()
                } else {
                    Vec::new()
                }
            })
            .collect();

        Ok(Self {
            dims,
            job,
            model,
            x,
            y_shape: y.shape().to_vec(),
            y: y2,
            x2,
            params,
            controls,
            lower,
            upper,
            we_roots,
            wd_roots,
            nnzw,
            beta_scale: Array1::ones(npar),
            delta_scale: Array2::ones((m, n)),
            free_beta,
            free_delta,
            counters,
        })
    }

    fn free_beta_count(&self) -> usize {
        self.free_beta.len()
    }

    /// Pull `beta` into `[lower, upper]` and derive the parameter scales from
    /// the starting values.
    fn clamp_to_bounds(&mut self, beta: &mut Array1<f64>) {
        for k in 0..beta.len() {
            beta[k] = beta[k].clamp(self.lower[k], self.upper[k]);
        }
        self.beta_scale = Array1::from(match &self.params.sclb {
            Some(sclb) => scales_from(sclb.iter().copied(), beta.iter().copied()),
            None => scales_from(std::iter::repeat_n(0.0, beta.len()), beta.iter().copied()),
        });
        let (m, n) = (self.dims.m, self.dims.n);
        let mut delta_scale = Array2::ones((m, n));
        for j in 0..m {
            let row = self.x2.row(j);
            let user = (0..n).map(|i| self.params.scld.as_ref().map_or(0.0, |s| s.get(j, i)));
            let scales = scales_from(user, row.iter().copied());
            for i in 0..n {
                delta_scale[[j, i]] = scales[i];
            }
        }
        self.delta_scale = delta_scale;
    }

    // ---- Evaluation ----

    fn xplus(&self, delta: &Array2<f64>) -> OdrResult<ArrayD<f64>> {
        let values: Vec<f64> = self.x.iter().zip(delta.iter()).map(|(x, d)| x + d).collect();
        ArrayD::from_shape_vec(self.x.raw_dim(), values).map_err(|_| OdrError::ShapeMismatch {
            argument: "delta",
            expected: format!("{:?}, the shape of 'x'", self.x.shape()),
            found: delta.shape().to_vec(),
        })
    }

    fn evaluate(&mut self, beta: &Array1<f64>, delta: &Array2<f64>) -> OdrResult<Array2<f64>> {
        self.counters.nfev += 1;
        let xplus = self.xplus(delta)?;
        let f = self.model.value(beta, &xplus)?;
        if f.shape() != self.y_shape.as_slice() {
            return Err(OdrError::ShapeMismatch {
                argument: "f",
                expected: format!("model output equal to the shape of 'y' {:?}", self.y_shape),
                found: f.shape().to_vec(),
            });
        }
        validate_model_output("f", f.iter())?;
        to_matrix("f", &f, self.dims.nq, self.dims.n)
    }

    fn point(&mut self, beta: Array1<f64>, delta: Array2<f64>) -> OdrResult<Point> {
        let f = self.evaluate(&beta, &delta)?;
        let ProblemDimensions { n, m, nq, .. } = self.dims;
        let eps_rows = n * nq;
        let rows = eps_rows + if self.job.is_odr { n * m } else { 0 };
        let mut r = DVector::zeros(rows);
        for i in 0..n {
            let u = root(&self.we_roots, i);
            for a in 0..nq {
                r[i * nq + a] = (0..nq).map(|b| u[(a, b)] * (f[[b, i]] - self.y[[b, i]])).sum();
            }
            if self.job.is_odr {
                let v = root(&self.wd_roots, i);
                for j in 0..m {
                    r[eps_rows + i * m + j] = (0..m).map(|l| v[(j, l)] * delta[[l, i]]).sum();
                }
            }
        }
        let wssep = r.rows(0, eps_rows).norm_squared();
        let wssde = r.rows(eps_rows, rows - eps_rows).norm_squared();
        Ok(Point { beta, delta, f, r, wss: wssep + wssde, wssep, wssde })
    }

    // ---- Derivatives ----

    fn jacobians(&mut self, point: &Point) -> OdrResult<Jacobians> {
        self.counters.njev += 1;
        match self.job.derivatives {
            DerivativeMode::AnalyticChecked | DerivativeMode::AnalyticUnchecked => self.analytic(point),
            DerivativeMode::ForwardDifference | DerivativeMode::CentralDifference => {
                let beta = self.difference_beta(point)?;
                let delta = if self.job.is_odr { Some(self.difference_delta(point)?) } else { None };
                Ok(Jacobians { beta, delta })
            }
        }
    }

    fn analytic(&mut self, point: &Point) -> OdrResult<Jacobians> {
        let ProblemDimensions { n, m, npar, nq } = self.dims;
        let xplus = self.xplus(&point.delta)?;
        let fjacb = self.model.jacobian_beta(&point.beta, &xplus)?;
        let beta = to_jacobian("fjacb", &fjacb, nq, npar, n)?;
        let delta = if self.job.is_odr {
            let fjacd = self.model.jacobian_delta(&point.beta, &xplus)?;
            Some(to_jacobian("fjacd", &fjacd, nq, m, n)?)
        } else {
            None
        };
        Ok(Jacobians { beta, delta })
    }

    fn central(&self) -> bool {
        self.job.derivatives == DerivativeMode::CentralDifference
    }

    fn relative_step(&self, user: Option<f64>) -> f64 {
        match user {
            Some(step) if step > 0.0 => step,
            _ if self.central() => self.controls.central_step,
            _ => self.controls.forward_step,
        }
    }

    /// Step for `β_k` and whether a central difference fits inside the bounds.
    fn beta_step(&self, k: usize, beta: &Array1<f64>) -> (f64, bool) {
        let stp = self.relative_step(self.params.stpb.as_ref().map(|s| s[k]));
        let typical = 1.0 / self.beta_scale[k];
        let sign = if beta[k] < 0.0 { -1.0 } else { 1.0 };
        let h = sign * stp * beta[k].abs().max(typical);
        let inside = |v: f64| v >= self.lower[k] && v <= self.upper[k];
        if self.central() && inside(beta[k] + h) && inside(beta[k] - h) {
            return (h, true);
        }
        if inside(beta[k] + h) { (h, false) } else { (-h, false) }
    }

    fn delta_step(&self, j: usize, i: usize, value: f64) -> f64 {
        let stp = self.relative_step(self.params.stpd.as_ref().map(|s| s.get(j, i)));
        let typical = 1.0 / self.delta_scale[[j, i]];
        let sign = if value < 0.0 { -1.0 } else { 1.0 };
        sign * stp * value.abs().max(typical)
    }

    fn difference_beta(&mut self, point: &Point) -> OdrResult<Array3<f64>> {
        let ProblemDimensions { n, npar, nq, .. } = self.dims;
        let mut jac = Array3::zeros((nq, npar, n));
        for k in self.free_beta.clone() {
            let (h, central) = self.beta_step(k, &point.beta);
            let mut plus = point.beta.clone();
            plus[k] += h;
            let f_plus = self.evaluate(&plus, &point.delta)?;
            let (f_base, width) = if central {
                let mut minus = point.beta.clone();
                minus[k] -= h;
                (self.evaluate(&minus, &point.delta)?, 2.0 * h)
            } else {
                (point.f.clone(), h)
            };
            for a in 0..nq {
                for i in 0..n {
                    jac[[a, k, i]] = (f_plus[[a, i]] - f_base[[a, i]]) / width;
                }
            }
        }
        Ok(jac)
    }

    fn difference_delta(&mut self, point: &Point) -> OdrResult<Array3<f64>> {
        let ProblemDimensions { n, m, nq, .. } = self.dims;
        let mut jac = Array3::zeros((nq, m, n));
        for j in 0..m {
            let any_free = self.params.ifixx.as_ref().is_none_or(|fix| (0..n).any(|i| fix.get(j, i) != 0));
            if !any_free {
                continue;
            }
            let steps: Vec<f64> =
                (0..n).map(|i| self.delta_step(j, i, self.x2[[j, i]] + point.delta[[j, i]])).collect();
            let mut plus = point.delta.clone();
            for (i, h) in steps.iter().enumerate() {
                plus[[j, i]] += h;
            }
            let f_plus = self.evaluate(&point.beta, &plus)?;
            let (f_base, factor) = if self.central() {
                let mut minus = point.delta.clone();
                for (i, h) in steps.iter().enumerate() {
                    minus[[j, i]] -= h;
                }
                (self.evaluate(&point.beta, &minus)?, 2.0)
            } else {
                (point.f.clone(), 1.0)
            };
            for a in 0..nq {
                for (i, h) in steps.iter().enumerate() {
                    jac[[a, j, i]] = (f_plus[[a, i]] - f_base[[a, i]]) / (factor * h);
                }
            }
        }
        Ok(jac)
    }

    /// Compare analytic Jacobians with forward differences at the first
    /// observation. Returns `(msgb, msgd)`: a summary flag (0 agree,
    /// 1 questionable) followed by one flag per entry.
    fn check_derivatives(&mut self, point: &Point, analytic: &Jacobians) -> OdrResult<(Vec<i32>, Vec<i32>)> {
        let ProblemDimensions { m, npar, nq, .. } = self.dims;
        let tol = self.controls.check_tol;
        let floor = self.controls.eta.sqrt();
        let disagree = |an: f64, fd: f64| {
            let diff = (an - fd).abs();
            diff > floor && diff > tol * an.abs().max(fd.abs())
        };

        let fd_beta = self.difference_beta(point)?;
        let mut msgb = vec![0; nq * npar + 1];
        for &k in &self.free_beta {
            for a in 0..nq {
                msgb[1 + a * npar + k] = i32::from(disagree(analytic.beta[[a, k, 0]], fd_beta[[a, k, 0]]));
            }
        }
        msgb[0] = i32::from(msgb[1..].iter().any(|&flag| flag != 0));

        let mut msgd = vec![-1];
        if let Some(an_delta) = &analytic.delta {
            let fd_delta = self.difference_delta(point)?;
            msgd = vec![0; nq * m + 1];
            for a in 0..nq {
                for j in 0..m {
                    msgd[1 + a * m + j] = i32::from(disagree(an_delta[[a, j, 0]], fd_delta[[a, j, 0]]));
                }
            }
            msgd[0] = i32::from(msgd[1..].iter().any(|&flag| flag != 0));
        }
        Ok((msgb, msgd))
    }

    // ---- Linearization ----

    /// Per-observation blocks of the residual Jacobian at `point`.
    fn linearize(&self, point: &Point, jac: &Jacobians) -> BlockSystem {
        let ProblemDimensions { n, m, nq, .. } = self.dims;
        let nb = self.free_beta.len();
        let eps_rows = n * nq;
        let blocks = (0..n)
            .map(|i| {
                let u = root(&self.we_roots, i);
                let free = &self.free_delta[i];
                let b = DMatrix::from_fn(nq, nb, |row, c| {
                    (0..nq).map(|q| u[(row, q)] * jac.beta[[q, self.free_beta[c], i]]).sum()
                });
                let a = DMatrix::from_fn(nq, free.len(), |row, p| match &jac.delta {
                    Some(fjacd) => (0..nq).map(|q| u[(row, q)] * fjacd[[q, free[p], i]]).sum(),
                    None => 0.0,
                });
                let e = point.r.rows(i * nq, nq).into_owned();
                let (v, d) = if self.job.is_odr {
                    let v = root(&self.wd_roots, i).select_columns(free.iter());
                    (v, point.r.rows(eps_rows + i * m, m).into_owned())
                } else {
                    (DMatrix::zeros(0, 0), DVector::zeros(0))
                };
                let scale = DVector::from_iterator(free.len(), free.iter().map(|&j| self.delta_scale[[j, i]]));
                ObservationBlock { b, a, v, e, d, scale }
            })
            .collect();
        let beta_scale = DVector::from_iterator(nb, self.free_beta.iter().map(|&k| self.beta_scale[k]));
        BlockSystem { blocks, beta_scale }
    }

    /// Columns allowed to move: those not pinned at a bound by the gradient.
    fn free_mask(&self, beta: &Array1<f64>, gradient: &DVector<f64>) -> Vec<bool> {
        self.free_beta.iter().enumerate().map(|(c, &k)| self.bound_state(k, beta, gradient[c]) == 0).collect()
    }

    /// 0 free, 1 pinned at lower, 2 pinned at upper.
    fn bound_state(&self, k: usize, beta: &Array1<f64>, gradient: f64) -> i32 {
        if beta[k] <= self.lower[k] && gradient > 0.0 {
            1
        } else if beta[k] >= self.upper[k] && gradient < 0.0 {
            2
        } else {
            0
        }
    }

    fn has_free_delta(&self) -> bool {
        self.free_delta.iter().any(|free| !free.is_empty())
    }

    fn parameter_norm(&self, point: &Point) -> f64 {
        let beta: f64 = self.free_beta.iter().map(|&k| (self.beta_scale[k] * point.beta[k]).powi(2)).sum();
        let delta: f64 = self
            .free_delta
            .iter()
            .enumerate()
            .flat_map(|(i, free)| free.iter().map(move |&j| (j, i)))
            .map(|(j, i)| (self.delta_scale[[j, i]] * point.delta[[j, i]]).powi(2))
            .sum();
        (beta + delta).sqrt()
    }

    fn initial_radius(&self, system: &BlockSystem, free: &[bool], pnorm: f64) -> f64 {
        let shift = DVector::zeros(system.columns());
        let gauss_newton = system.solve(free, &shift, 0.0).map_or(0.0, |step| system.scaled_norm(&step, free));
        let base = if gauss_newton > 0.0 {
            gauss_newton
        } else if pnorm > 0.0 {
            pnorm
        } else {
            1.0
        };
        self.controls.taufac * base
    }

    /// Step within `radius`. A parameter whose step would cross a bound is
    /// moved onto the bound and frozen, then the remaining unknowns are
    /// solved again with that move in place.
    ///
    /// Returns the step, its `λ` and the `(parameter, bound)` pairs pinned.
    fn bounded_step(
        &self, system: &BlockSystem, beta: &Array1<f64>, free: &[bool], radius: f64,
    ) -> Option<(BlockStep, f64, Vec<(usize, f64)>)> {
        let mut active = free.to_vec();
        let mut shift = DVector::zeros(system.columns());
        let mut pins = Vec::new();
        loop {
            let (step, lambda) = system.step_within(&active, &shift, radius)?;
            let mut crossed = false;
            for (c, &k) in self.free_beta.iter().enumerate() {
                if !active[c] {
                    continue;
                }
                let target = beta[k] + step.beta[c];
                let bound = if target > self.upper[k] {
                    self.upper[k]
                } else if target < self.lower[k] {
                    self.lower[k]
                } else {
                    continue;
                };
                shift[c] = bound - beta[k];
                active[c] = false;
                pins.push((k, bound));
                crossed = true;
            }
            if !crossed {
                return Some((step, lambda, pins));
            }
        }
    }

    fn apply_step(&self, point: &Point, step: &BlockStep, pins: &[(usize, f64)]) -> (Array1<f64>, Array2<f64>) {
        let mut beta = point.beta.clone();
        for (c, &k) in self.free_beta.iter().enumerate() {
            beta[k] = (point.beta[k] + step.beta[c]).clamp(self.lower[k], self.upper[k]);
        }
        for &(k, bound) in pins {
            beta[k] = bound;
        }
        let mut delta = point.delta.clone();
        for (i, free) in self.free_delta.iter().enumerate() {
            for (p, &j) in free.iter().enumerate() {
                delta[[j, i]] += step.delta[i][p];
            }
        }
        (beta, delta)
    }

    // ---- Iteration ----

    fn run(&mut self, state: &mut State, reporter: &mut dyn Reporter, buffers: &mut Buffers<'_>) -> i32 {
        if state.point.wss == 0.0 {
            return 1;
        }
        loop {
            if state.iterations >= self.controls.maxit {
                return 4;
            }
            let jac = match self.jacobians(&state.point) {
                Ok(jac) => jac,
                Err(err) => return self.halt(&err, STATUS_MODEL_STOP_DERIVATIVE),
            };
            if state.iterations == 0 && self.job.derivatives == DerivativeMode::AnalyticChecked {
                match self.check_derivatives(&state.point, &jac) {
                    Ok((msgb, msgd)) => {
                        if msgb[0] == 1 || msgd[0] == 1 {
                            log::warn!("analytic Jacobians disagree with finite differences at the first observation");
                            reporter.on_error("Derivatives are questionable; see msgb/msgd in iwork.");
                        }
                        state.msgb = msgb;
                        state.msgd = msgd;
                    }
                    Err(err) => return self.halt(&err, STATUS_MODEL_STOP_DERIVATIVE),
                }
            }

            let system = self.linearize(&state.point, &jac);
            state.jac = Some(jac);
            let free = self.free_mask(&state.point.beta, &system.gradient_beta());
            if !free.iter().any(|&on| on) && !self.has_free_delta() {
                return 1;
            }
            let pnorm = self.parameter_norm(&state.point);
            state.pnorm = pnorm;
            if state.radius <= 0.0 {
                state.radius = self.initial_radius(&system, &free, pnorm);
            }

            let mut accepted = None;
            for _ in 0..MAX_REJECTIONS {
                let Some((step, lambda, pins)) = self.bounded_step(&system, &state.point.beta, &free, state.radius)
                else {
                    log::warn!("no trust-region step could be formed at iteration {}", state.iterations + 1);
                    return STATUS_NUMERICAL_FAILURE;
                };
                state.lambda = lambda;
                let pred = state.point.wss - system.predicted(&step);
                let rel_pred = pred / state.point.wss;
                let step_norm = system.scaled_norm(&step, &free);
                let small_step = step_norm <= self.controls.partol * pnorm;
                let (trial_beta, trial_delta) = self.apply_step(&state.point, &step, &pins);
                state.betan = trial_beta.clone();

                match self.point(trial_beta, trial_delta) {
                    Ok(trial) => {
                        let act = state.point.wss - trial.wss;
                        let ratio = if pred > 0.0 { act / pred } else { 0.0 };
                        state.update_radius(ratio, step_norm);
                        if act > 0.0 && ratio >= ACCEPT_RATIO {
                            accepted = Some((trial, act, pred, ratio, step_norm, small_step));
                            break;
                        }
                        if rel_pred.abs() <= self.controls.sstol {
                            state.prers = rel_pred;
                            return 1;
                        }
                        if small_step {
                            state.step_norm = step_norm;
                            return 2;
                        }
                    }
                    Err(OdrError::ModelStop) | Err(OdrError::NonFiniteModelOutput { .. }) => {
                        self.counters.stops += 1;
                        state.radius *= 0.5;
                    }
                    Err(err) => return self.halt(&err, STATUS_NUMERICAL_FAILURE),
                }
                state.rejected += 1;
            }

            let Some((trial, act, pred, ratio, step_norm, small_step)) = accepted else {
                log::warn!("no acceptable step after {MAX_REJECTIONS} attempts");
                return STATUS_NUMERICAL_FAILURE;
            };

            let old_wss = state.point.wss;
            state.betas = state.point.beta.clone();
            state.delts = state.point.delta.clone();
            state.s = &trial.beta - &state.point.beta;
            state.t = &trial.delta - &state.point.delta;
            state.point = trial;
            state.iterations += 1;
            self.counters.niter += 1;
            state.actrs = act / old_wss;
            state.prers = pred / old_wss;
            state.step_norm = step_norm;
            state.lambda_sum += state.lambda;
            buffers.store_progress(&state.point, &self.counters);

            reporter.on_iteration(&IterationReport {
                iteration: self.counters.niter,
                nfev: self.counters.nfev,
                sum_square: state.point.wss,
                actual_reduction: state.actrs,
                predicted_reduction: state.prers,
                ratio,
                lambda: state.lambda,
                step_norm,
                beta: state.point.beta.clone(),
            });

            let ss_converged = state.prers <= self.controls.sstol && state.actrs.abs() <= self.controls.sstol && ratio <= 2.0;
            let info = i32::from(ss_converged) + 2 * i32::from(small_step);
            if info > 0 {
                return info;
            }
            if state.point.wss == 0.0 {
                return 1;
            }
        }
    }

    fn halt(&self, err: &OdrError, stop_code: i32) -> i32 {
        log::warn!("ODR iteration stopped: {err}");
        if *err == OdrError::ModelStop { stop_code } else { STATUS_NUMERICAL_FAILURE }
    }

    // ---- Covariance ----

    fn covariance(&mut self, state: &mut State) -> Covariance {
        let npar = self.dims.npar;
        let mut out = Covariance::skipped(npar);
        let npp = self.free_beta_count();
        let idf = (self.nnzw * self.dims.nq) as i64 - npp as i64;
        out.rvar = if idf > 0 { state.point.wss / idf as f64 } else { state.point.wss };

        let jac = match (self.job.covariance, state.jac.take()) {
            (CovarianceMode::LastIteration, Some(jac)) => jac,
            (CovarianceMode::Skipped, jac) => {
                state.jac = jac;
                return out;
            }
            (_, _) => match self.jacobians(&state.point) {
                Ok(jac) => jac,
                Err(err) => {
                    log::warn!("covariance skipped, derivatives failed at the solution: {err}");
                    return out;
                }
            },
        };

        let system = self.linearize(&state.point, &jac);
        state.jac = Some(jac);
        let gradient = system.gradient_beta();
        let free = self.free_mask(&state.point.beta, &gradient);
        for (c, &k) in self.free_beta.iter().enumerate() {
            out.bound[k] = self.bound_state(k, &state.point.beta, gradient[c]);
            out.ifix2[k] = i32::from(out.bound[k] == 0);
        }

        let (inverse, deficiency) = system.covariance(&free);
        let estimated: Vec<usize> = self.free_beta.iter().zip(&free).filter_map(|(&k, &on)| on.then_some(k)).collect();
        for (a, &k) in estimated.iter().enumerate() {
            for (b, &l) in estimated.iter().enumerate() {
                out.vcv[[k, l]] = out.rvar * inverse[(a, b)];
            }
        }
        out.sd = out.vcv.diag().mapv(|v| v.max(0.0).sqrt());
        out.rcond = inverse_condition(&inverse);
        out.irank = deficiency;
        out
    }
}

// ---- Buffer access ----

/// Named writes into the solver buffers through the plan's offsets.
struct Buffers<'a> {
    plan: &'a WorkspacePlan,
    work: &'a mut [f64],
    iwork: &'a mut [i32],
}

impl Buffers<'_> {
    fn put(&mut self, offset: usize, values: impl IntoIterator<Item = f64>) {
        if let Some(slots) = self.work.get_mut(offset..) {
            for (slot, value) in slots.iter_mut().zip(values) {
                *slot = value;
            }
        }
    }

    fn put_int(&mut self, offset: usize, values: impl IntoIterator<Item = i32>) {
        if let Some(slots) = self.iwork.get_mut(offset..) {
            for (slot, value) in slots.iter_mut().zip(values) {
                *slot = value;
            }
        }
    }

    fn get(&self, offset: usize, len: usize) -> Option<&[f64]> {
        self.work.get(offset..offset + len)
    }

    fn load_restart(&self, beta: &mut Array1<f64>, delta: &mut Array2<f64>) -> Counters {
        let w = self.plan.work;
        let iw = self.plan.iwork;
        if let Some(saved) = self.get(w.betac, beta.len()) {
            beta.iter_mut().zip(saved).for_each(|(b, s)| *b = *s);
        }
        if let Some(saved) = self.get(w.delta, delta.len()) {
            delta.iter_mut().zip(saved).for_each(|(d, s)| *d = *s);
        }
        let count = |offset: usize| self.iwork.get(offset).map_or(0, |&v| usize::try_from(v).unwrap_or(0));
        Counters { niter: count(iw.niter), nfev: count(iw.nfev), njev: count(iw.njev), stops: 0 }
    }

    fn store_controls(
        &mut self, controls: &Controls, job: &JobFlags, settings: &SolverSettings, params: &NormalizedParameters,
        npar: usize,
    ) {
        let w = self.plan.work;
        let iw = self.plan.iwork;
        self.put(w.sstol, [controls.sstol]);
        self.put(w.partl, [controls.partol]);
        self.put(w.taufc, [controls.taufac]);
        self.put(w.eta, [controls.eta]);
        self.put(w.epsma, [f64::EPSILON]);
        let lower = params.lower.clone().unwrap_or_else(|| Array1::from_elem(npar, -f64::MAX));
        let upper = params.upper.clone().unwrap_or_else(|| Array1::from_elem(npar, f64::MAX));
        self.put(w.lower, lower.to_vec());
        self.put(w.upper, upper.to_vec());

        self.put_int(iw.job, [saturate(job.code as usize)]);
        self.put_int(iw.iprin, [saturate(settings.iprint as usize)]);
        self.put_int(iw.maxit, [saturate(controls.maxit)]);
        self.put_int(iw.neta, [(-controls.eta.log10()).floor() as i32]);
        self.put_int(iw.ntol, [(-controls.check_tol.log10()).floor() as i32]);
        self.put_int(iw.nrow, [0]);
        self.put_int(iw.ldtt, [saturate(broadcast_ld(&params.scld))]);
        self.put_int(iw.lunrp, [unit(&settings.report)]);
        self.put_int(iw.luner, [unit(&settings.error)]);
    }

    fn store_counters(&mut self, counters: &Counters, rejected: usize) {
        let iw = self.plan.iwork;
        self.put_int(iw.niter, [saturate(counters.niter)]);
        self.put_int(iw.nfev, [saturate(counters.nfev)]);
        self.put_int(iw.njev, [saturate(counters.njev)]);
        self.put_int(iw.istop, [saturate(counters.stops)]);
        self.put_int(iw.int2, [saturate(rejected)]);
    }

    fn store_scales(&mut self, session: &Session<'_>) {
        let w = self.plan.work;
        self.put(w.ss, session.beta_scale.iter().copied());
        let ssf: Vec<f64> = match &session.params.sclb {
            Some(sclb) => sclb.to_vec(),
            None => session.beta_scale.to_vec(),
        };
        self.put(w.ssf, ssf);
        self.put(w.we1, weight_root_values(&session.params.we, &session.we_roots));
    }

    /// Keep `betac`/`delta` and the counters current so an interrupted run
    /// can be restarted from its last accepted point.
    fn store_progress(&mut self, point: &Point, counters: &Counters) {
        let w = self.plan.work;
        self.put(w.betac, point.beta.iter().copied());
        self.put(w.delta, point.delta.iter().copied());
        self.store_counters(counters, 0);
    }

    fn store_solution(&mut self, session: &Session<'_>, state: &State, cov: &Covariance, beta0: &Array1<f64>) {
        let w = self.plan.work;
        let iw = self.plan.iwork;
        let ProblemDimensions { nq, .. } = session.dims;
        let point = &state.point;

        self.put(w.delta, point.delta.iter().copied());
        self.put(w.eps, point.f.iter().zip(session.y.iter()).map(|(f, y)| f - y));
        self.put(w.xplus, session.x2.iter().zip(point.delta.iter()).map(|(x, d)| x + d));
        self.put(w.fn_, point.f.iter().copied());
        self.put(w.fs, point.f.iter().copied());
        self.put(w.sd, cov.sd.iter().copied());
        self.put(w.vcv, cov.vcv.iter().copied());
        self.put(w.rvar, [cov.rvar]);
        self.put(w.wss, [point.wss]);
        self.put(w.wssde, [point.wssde]);
        self.put(w.wssep, [point.wssep]);
        self.put(w.rcond, [cov.rcond]);
        let olmav = if state.iterations > 0 { state.lambda_sum / state.iterations as f64 } else { 0.0 };
        self.put(w.olmav, [olmav]);
        self.put(w.tau, [state.radius]);
        self.put(w.alpha, [state.lambda]);
        self.put(w.actrs, [state.actrs]);
        self.put(w.pnorm, [state.pnorm]);
        self.put(w.rnors, [point.wss.sqrt()]);
        self.put(w.prers, [state.prers]);
        self.put(w.beta0, beta0.iter().copied());
        self.put(w.betac, point.beta.iter().copied());
        self.put(w.betas, state.betas.iter().copied());
        self.put(w.betan, state.betan.iter().copied());
        self.put(w.s, state.s.iter().copied());
        if let Some(jac) = &state.jac {
            self.put(w.fjacb, jac.beta.iter().copied());
            if let (true, Some(fjacd)) = (self.plan.is_odr, &jac.delta) {
                self.put(w.fjacd, fjacd.iter().copied());
            }
        }
        if self.plan.is_odr {
            self.put(w.delts, state.delts.iter().copied());
            self.put(w.t, state.t.iter().copied());
        }

        let npp = session.free_beta_count();
        self.put_int(iw.msgb, state.msgb.iter().copied());
        self.put_int(iw.msgd, state.msgd.iter().copied());
        self.put_int(iw.ifix2, cov.ifix2.iter().copied());
        self.put_int(iw.nnzw, [saturate(session.nnzw)]);
        self.put_int(iw.npp, [saturate(npp)]);
        let idf = (session.nnzw * nq) as i64 - npp as i64;
        self.put_int(iw.idf, [idf.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32]);
        self.put_int(iw.irank, [saturate(cov.irank)]);
        self.put_int(iw.bound, cov.bound.iter().copied());
        self.store_counters(&session.counters, state.rejected);
    }
}

// ---- Helpers ----

fn saturate(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn unit(destination: &ReportDestination) -> i32 {
    match destination {
        ReportDestination::Stdout => 6,
        ReportDestination::Stderr => 0,
        ReportDestination::File(_) => 1,
    }
}

fn root(roots: &[DMatrix<f64>], i: usize) -> &DMatrix<f64> {
    if roots.len() == 1 { &roots[0] } else { &roots[i] }
}

fn weight_roots(weight: &NormalizedWeight) -> Vec<DMatrix<f64>> {
    (0..weight.spec.ld).map(|i| weight_root(&weight.block(i))).collect()
}

/// Weight roots laid out like the normalized weight, `(q, ld2, ld)`.
fn weight_root_values(weight: &NormalizedWeight, roots: &[DMatrix<f64>]) -> Vec<f64> {
    let q = weight.q();
    let (ld, ld2) = (weight.spec.ld, weight.spec.ld2);
    let mut values = vec![0.0; q * ld2 * ld];
    for (obs, u) in roots.iter().enumerate() {
        for a in 0..q {
            if ld2 == 1 {
                values[a * ld + obs] = u[(a, a)];
            } else {
                for b in 0..q {
                    values[a * ld2 * ld + b * ld + obs] = u[(a, b)];
                }
            }
        }
    }
    values
}

/// Scale per component: `|user|` when given and nonzero, otherwise the
/// reciprocal magnitude of the value, falling back on the largest magnitude
/// of the group (or 1 when every value is zero).
fn scales_from(user: impl Iterator<Item = f64>, values: impl Iterator<Item = f64> + Clone) -> Vec<f64> {
    let largest = values.clone().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    user.zip(values)
        .map(|(user, value)| {
            if user != 0.0 {
                user.abs()
            } else if value != 0.0 {
                1.0 / value.abs()
            } else if largest > 0.0 {
                10.0 / largest
            } else {
                1.0
            }
        })
        .collect()
}

fn to_matrix(argument: &'static str, values: &ArrayD<f64>, rows: usize, cols: usize) -> OdrResult<Array2<f64>> {
    Array2::from_shape_vec((rows, cols), values.iter().copied().collect()).map_err(|_| OdrError::ShapeMismatch {
        argument,
        expected: format!("{rows}·{cols} elements"),
        found: values.shape().to_vec(),
    })
}

fn to_jacobian(argument: &'static str, values: &ArrayD<f64>, nq: usize, mid: usize, n: usize) -> OdrResult<Array3<f64>> {
    validate_model_output(argument, values.iter())?;
    Array3::from_shape_vec((nq, mid, n), values.iter().copied().collect()).map_err(|_| OdrError::ShapeMismatch {
        argument,
        expected: format!("({nq}, {mid}, {n}) in memory order"),
        found: values.shape().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::core::{
        model::FnModel,
        normalize::normalize_parameters,
        options::OdrOptions,
        shape::resolve_dimensions,
    };
    use ndarray::{Array1, IxDyn, array};

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests drive the solver directly through a `SolverCall`:
    // - OLS and ODR fits of simple models, with and without bounds.
    // - Fixed parameters, the iteration cap, unsupported modes and model
    //   stops at the initial point.
    // - Buffer fields written after termination.
    // -------------------------------------------------------------------------

    struct Outcome {
        info: i32,
        beta: Array1<f64>,
        delta: Array2<f64>,
        plan: WorkspacePlan,
        work: Vec<f64>,
        iwork: Vec<i32>,
    }

    fn run(model: &dyn Model, beta0: &[f64], x: ArrayD<f64>, y: ArrayD<f64>, options: &OdrOptions) -> Outcome {
        let job = JobFlags::decode(options.job);
        let beta0 = ArrayD::from_shape_vec(IxDyn(&[beta0.len()]), beta0.to_vec()).unwrap();
        let dims = resolve_dimensions(model, &beta0, &y, &x, &job).unwrap();
        let settings = SolverSettings::from_options(options);
        let beta0: Array1<f64> = beta0.iter().copied().collect();
        let params = normalize_parameters(options, &beta0, x.shape(), &dims, &job).unwrap();
        let plan = WorkspacePlan::new(dims, job.is_odr, params.we.spec);
        let buffers = plan.prepare(&job, None, None).unwrap();
        let mut work = buffers.work.to_vec();
        let mut iwork = buffers.iwork.to_vec();
        let mut beta = beta0;
        let mut delta = params.delta0.clone();

        let info = TrustRegionSolver.solve(SolverCall {
            dims,
            job,
            model,
            x: &x,
            y: &y,
            beta: &mut beta,
            delta: &mut delta,
            params: &params,
            settings: &settings,
            plan: &plan,
            work: &mut work,
            iwork: &mut iwork,
        });
        Outcome { info, beta, delta, plan, work, iwork }
    }

    fn line_data() -> (ArrayD<f64>, ArrayD<f64>) {
        let x = array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let noise = array![0.05, -0.03, 0.02, -0.04, 0.01, 0.03];
        let y = x.mapv(|v| 1.0 + 2.0 * v) + noise;
        (x.into_dyn(), y.into_dyn())
    }

    fn line(b: &Array1<f64>, x: &ArrayD<f64>) -> ArrayD<f64> {
        x.mapv(|v| b[0] + b[1] * v)
    }

    #[test]
    // Purpose
    // -------
    // OLS on a straight line reproduces the closed-form least-squares fit.
    //
    // Given
    // -----
    // - Six points around y = 1 + 2x, job = 2 (OLS, forward differences).
    //
    // Expect
    // ------
    // - Converged status and coefficients equal to the normal-equation
    //   solution within 1e-6.
    fn ols_line_matches_closed_form() {
        // Arrange
        let (x, y) = line_data();
        let options = OdrOptions { job: 2, ..Default::default() };
        let n = x.len() as f64;
        let (sx, sy) = (x.sum(), y.sum());
        let sxx: f64 = x.iter().map(|v| v * v).sum();
        let sxy: f64 = x.iter().zip(y.iter()).map(|(a, b)| a * b).sum();
        let slope = (n * sxy - sx * sy) / (n * sxx - sx * sx);
        let intercept = (sy - slope * sx) / n;

        // Act
        let out = run(&line, &[0.5, 0.5], x, y, &options);

        // Assert
        assert!((1..=3).contains(&out.info), "info = {}", out.info);
        assert!((out.beta[0] - intercept).abs() < 1e-6);
        assert!((out.beta[1] - slope).abs() < 1e-6);
        assert!(out.delta.iter().all(|&d| d == 0.0));
        assert!(out.iwork[out.plan.iwork.niter] >= 1);
        assert!(out.work[out.plan.work.sd] > 0.0);
    }

    #[test]
    // Purpose
    // -------
    // Explicit ODR lowers the weighted sum of squares below the OLS value of
    // the same parameters by moving `x`.
    fn odr_line_uses_delta() {
        // Arrange
        let (x, y) = line_data();

        // Act
        let odr = run(&line, &[0.5, 0.5], x.clone(), y.clone(), &OdrOptions::default());
        let ols = run(&line, &[0.5, 0.5], x, y, &OdrOptions { job: 2, ..Default::default() });

        // Assert
        assert!((1..=3).contains(&odr.info), "info = {}", odr.info);
        assert!(odr.delta.iter().any(|&d| d != 0.0));
        let w = odr.plan.work;
        let wss = odr.work[w.wss];
        assert!((wss - odr.work[w.wssde] - odr.work[w.wssep]).abs() < 1e-12);
        assert!(wss < ols.work[ols.plan.work.wss]);
    }

    #[test]
    // Purpose
    // -------
    // Fixed parameters never move, and a fully fixed problem still reports a
    // converged status.
    fn fixed_parameters_stay_at_initial_values() {
        // Arrange
        let (x, y) = line_data();
        let partially = OdrOptions { ifixb: Some(array![1, 0].into_dyn()), job: 2, ..Default::default() };
        let fully = OdrOptions { ifixb: Some(array![0, 0].into_dyn()), job: 2, ..Default::default() };

        // Act
        let partial = run(&line, &[0.5, 2.0], x.clone(), y.clone(), &partially);
        let full = run(&line, &[0.5, 0.5], x, y, &fully);

        // Assert
        assert_eq!(partial.beta[1], 2.0);
        assert!((partial.beta[0] - 1.0).abs() < 0.1);
        assert_eq!(full.beta, array![0.5, 0.5]);
        assert!(full.info < 4, "info = {}", full.info);
        assert_eq!(partial.iwork[partial.plan.iwork.npp], 1);
    }

    #[test]
    // Purpose
    // -------
    // Bounds are honored and the parameter pinned at a bound is reported.
    //
    // Given
    // -----
    // - Line data with slope ≈ 2 and upper bound 1.5 on the slope.
    //
    // Expect
    // ------
    // - Slope exactly 1.5, `bound` = 2 for it, zero standard error.
    fn upper_bound_pins_parameter() {
        // Arrange
        let (x, y) = line_data();
        let options = OdrOptions { upper: Some(array![10.0, 1.5].into_dyn()), job: 2, ..Default::default() };

        // Act
        let out = run(&line, &[0.5, 0.5], x, y, &options);

        // Assert
        assert!((1..=3).contains(&out.info), "info = {}", out.info);
        assert_eq!(out.beta[1], 1.5);
        let iw = out.plan.iwork;
        assert_eq!(out.iwork[iw.bound + 1], 2);
        assert_eq!(out.iwork[iw.ifix2 + 1], 0);
        assert_eq!(out.work[out.plan.work.sd + 1], 0.0);
        assert_eq!(out.work[out.plan.work.upper], 10.0);
        assert_eq!(out.work[out.plan.work.lower], -f64::MAX);
    }

    #[test]
    fn iteration_cap_reports_limit() {
        let x = array![0.5, 1.0, 1.5, 2.0, 2.5].into_dyn();
        let y = x.mapv(|v: f64| 3.0 * (0.7_f64 * v).exp());
        let model = |b: &Array1<f64>, x: &ArrayD<f64>| x.mapv(|v| b[0] * (b[1] * v).exp());

        let out = run(&model, &[1.0, 0.1], x, y, &OdrOptions { maxit: Some(1), ..Default::default() });

        assert_eq!(out.info, 4);
        assert_eq!(out.iwork[out.plan.iwork.niter], 1);
        assert_eq!(out.iwork[out.plan.iwork.maxit], 1);
    }

    #[test]
    // Purpose
    // -------
    // A step that would carry a parameter past its bound pins it there and
    // the remaining unknowns keep improving, so the fit reaches the smallest
    // cost along the bound within the default iteration cap.
    //
    // Given
    // -----
    // - y = β0·exp(β1·x) at four points, 0 <= β1 <= 0.9, start (2, 0.5),
    //   explicit ODR with forward differences.
    //
    // Expect
    // ------
    // - Sum-of-squares convergence with β1 exactly 0.9, flagged at its
    //   upper bound and without a standard error.
    // - β0 ≈ 1.44, where the cost along β1 = 0.9 is smallest; moving β0
    //   either way raises the weighted sum of squares.
    fn crossing_step_pins_parameter_on_bound() {
        // Arrange
        let x = array![0.982, 1.998, 4.978, 6.01].into_dyn();
        let y = array![2.7, 7.4, 148.0, 403.0].into_dyn();
        let model = |b: &Array1<f64>, x: &ArrayD<f64>| x.mapv(|v| b[0] * (b[1] * v).exp());
        let options = OdrOptions {
            lower: Some(array![0.0, 0.0].into_dyn()),
            upper: Some(array![10.0, 0.9].into_dyn()),
            ..Default::default()
        };

        // Act
        let out = run(&model, &[2.0, 0.5], x.clone(), y.clone(), &options);
        let wss = out.work[out.plan.work.wss];
        let nudged = |shift: f64| {
            let mut fixed = options.clone();
            fixed.ifixb = Some(array![0, 0].into_dyn());
            run(&model, &[out.beta[0] + shift, 0.9 - 1e-12], x.clone(), y.clone(), &fixed).work[out.plan.work.wss]
        };

        // Assert
        assert!(out.info == 1 || out.info == 3, "info = {}", out.info);
        assert_eq!(out.beta[1], 0.9);
        assert!((out.beta[0] - 1.44).abs() < 5e-3, "beta = {}", out.beta);
        let iw = out.plan.iwork;
        assert_eq!(out.iwork[iw.bound + 1], 2);
        assert_eq!(out.iwork[iw.ifix2], 1);
        assert_eq!(out.work[out.plan.work.sd + 1], 0.0);
        assert!(out.work[out.plan.work.sd] > 0.0);
        assert!(out.iwork[iw.niter] < 50);
        assert!(nudged(0.05) > wss);
        assert!(nudged(-0.05) > wss);
    }

    #[test]
    // Purpose
    // -------
    // `maxit = 0` leaves the start untouched and still reports its
    // covariance.
    fn zero_iterations_report_start_covariance() {
        // Arrange
        let (x, y) = line_data();
        let options = OdrOptions { job: 2, maxit: Some(0), ..Default::default() };

        // Act
        let out = run(&line, &[1.0, 2.0], x, y, &options);

        // Assert
        assert_eq!(out.info, 4);
        assert_eq!(out.beta, array![1.0, 2.0]);
        assert_eq!(out.iwork[out.plan.iwork.niter], 0);
        assert_eq!(out.iwork[out.plan.iwork.maxit], 0);
        assert!(out.work[out.plan.work.sd] > 0.0);
        assert!(out.work[out.plan.work.sd + 1] > 0.0);
    }

    #[test]
    // Purpose
    // -------
    // Early terminations map to their status codes.
    fn unsupported_mode_and_initial_stop() {
        // Arrange
        let (x, y) = line_data();
        let stopping = |_: &Array1<f64>, _: &ArrayD<f64>| -> OdrResult<ArrayD<f64>> { Err(OdrError::ModelStop) };
        struct Stopper<F>(F, std::cell::Cell<usize>);
        impl<F: Fn(&Array1<f64>, &ArrayD<f64>) -> OdrResult<ArrayD<f64>>> Model for Stopper<F> {
            fn value(&self, beta: &Array1<f64>, x: &ArrayD<f64>) -> OdrResult<ArrayD<f64>> {
                // The first call is the shape check.
                let calls = self.1.get();
                self.1.set(calls + 1);
                if calls == 0 { Ok(x.mapv(|v| beta[0] + beta[1] * v)) } else { (self.0)(beta, x) }
            }
        }

        // Act
        let implicit = run(&line, &[0.5, 0.5], x.clone(), y.clone(), &OdrOptions { job: 1, ..Default::default() });
        let stopped = run(&Stopper(stopping, std::cell::Cell::new(0)), &[0.5, 0.5], x, y, &OdrOptions::default());

        // Assert
        assert_eq!(implicit.info, STATUS_IMPLICIT_UNSUPPORTED);
        assert_eq!(stopped.info, STATUS_MODEL_STOP);
        assert_eq!(stopped.beta, array![0.5, 0.5]);
    }

    #[test]
    // Purpose
    // -------
    // The derivative check flags a wrong analytic Jacobian and passes a
    // correct one.
    fn derivative_check_flags_wrong_jacobian() {
        // Arrange
        let (x, y) = line_data();
        let jac = |scale: f64| {
            move |_: &Array1<f64>, x: &ArrayD<f64>| {
                let n = x.len();
                let mut out = ArrayD::<f64>::ones(IxDyn(&[2, n]));
                for (i, v) in x.iter().enumerate() {
                    out[[1, i]] = scale * v + (scale - 1.0);
                }
                out
            }
        };
        let good = FnModel::new(line).with_jacobian_beta(jac(1.0));
        let bad = FnModel::new(line).with_jacobian_beta(jac(3.0));
        let options = OdrOptions { job: 22, ..Default::default() };

        // Act
        let good = run(&good, &[0.5, 0.5], x.clone(), y.clone(), &options);
        let bad = run(&bad, &[0.5, 0.5], x, y, &options);

        // Assert
        let msgb = good.plan.iwork.msgb;
        assert_eq!(good.iwork[msgb], 0);
        assert_eq!(bad.iwork[msgb], 1);
        assert_eq!(bad.iwork[msgb + 1], 0);
        assert_eq!(bad.iwork[msgb + 2], 1);
        assert_eq!(good.iwork[good.plan.iwork.msgd], -1);
        assert!((1..=3).contains(&good.info), "info = {}", good.info);
    }

    #[test]
    fn scales_fall_back_on_magnitudes() {
        let scales = scales_from([0.0, 4.0, 0.0].into_iter(), [2.0, 5.0, 0.0].into_iter());
        let zeros = scales_from([0.0, 0.0].into_iter(), [0.0, 0.0].into_iter());

        assert_eq!(scales, vec![0.5, 4.0, 2.0]);
        assert_eq!(zeros, vec![1.0, 1.0]);
    }
}
