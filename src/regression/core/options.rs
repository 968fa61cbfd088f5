//! Call options for [`fit`](crate::regression::api::fit) and the resolved
//! solver settings derived from them.
//!
//! Purpose
//! -------
//! Collect every optional argument of an ODR call in one plain struct with
//! public fields and a `Default`, and range-check the numeric controls that
//! are passed through to the solver.
//!
//! Key behaviors
//! -------------
//! - [`OdrOptions`] carries arrays exactly as the caller supplied them; shape
//!   rules are applied later by the normalizer.
//! - [`SolverSettings::new`] drops out-of-range numeric controls back to the
//!   solver defaults and resolves the report/error destinations
//!   (stdout/stderr when omitted, one shared file when both paths are equal).
//!
//! Conventions
//! -----------
//! - `None` always means "let the solver pick its default".
//! - Arrays are dynamic-rank (`ArrayD`) because their accepted ranks depend on
//!   the problem.
use ndarray::{Array1, ArrayD};
use std::path::PathBuf;

/// Response (`we`) or explanatory-variable (`wd`) weight as supplied.
#[derive(Debug, Clone, PartialEq)]
pub enum Weight {
    /// Same weight for every response (or dimension) and observation.
    Scalar(f64),
    /// Any of the accepted weight layouts; see the normalizer's rule table.
    Array(ArrayD<f64>),
}

impl From<f64> for Weight {
    fn from(value: f64) -> Self {
        Weight::Scalar(value)
    }
}

impl From<ArrayD<f64>> for Weight {
    fn from(values: ArrayD<f64>) -> Self {
        Weight::Array(values)
    }
}

/// Optional arguments of an ODR fit.
///
/// Fields:
/// - `we`, `wd`: response and explanatory-variable weights.
/// - `ifixb`: per-parameter mask, `0` holds a parameter at its initial value.
/// - `ifixx`: per-element mask for `x`, `0` holds `x` fixed (no `delta`).
/// - `delta0`: initial `delta`; requires job digit 4.
/// - `lower`, `upper`: strict parameter bounds.
/// - `job`: decimal job code (see `core::job`).
/// - `iprint`: report control; `0` disables reports.
/// - `rptfile`, `errfile`: report and error destinations.
/// - `ndigit`, `taufac`, `sstol`, `partol`, `maxit`: solver controls.
/// - `stpb`, `stpd`, `sclb`, `scld`: finite-difference steps and scales.
/// - `work`, `iwork`: buffers of a previous run, for a restart.
///
/// Default: every array `None`, `job = 0`, `iprint = 0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OdrOptions {
    pub we: Option<Weight>,
    pub wd: Option<Weight>,
    pub ifixb: Option<ArrayD<i32>>,
    pub ifixx: Option<ArrayD<i32>>,
    pub delta0: Option<ArrayD<f64>>,
    pub lower: Option<ArrayD<f64>>,
    pub upper: Option<ArrayD<f64>>,
    pub job: u32,
    pub iprint: u32,
    pub rptfile: Option<PathBuf>,
    pub errfile: Option<PathBuf>,
    pub ndigit: Option<i32>,
    pub taufac: Option<f64>,
    pub sstol: Option<f64>,
    pub partol: Option<f64>,
    pub maxit: Option<i32>,
    pub stpb: Option<ArrayD<f64>>,
    pub stpd: Option<ArrayD<f64>>,
    pub sclb: Option<ArrayD<f64>>,
    pub scld: Option<ArrayD<f64>>,
    pub work: Option<Array1<f64>>,
    pub iwork: Option<Array1<i32>>,
}

/// Where solver reports and error messages go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDestination {
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Numeric controls and destinations handed to the solver.
///
/// Rules applied by [`SolverSettings::new`]; a value outside its range is
/// replaced by `None`, so the solver uses its default:
/// - `sstol`, `partol`: in `(0, 1)`.
/// - `taufac`: in `(0, 1]`.
/// - `maxit`: `>= 0`; `0` evaluates the covariance at `beta0` without
///   iterating.
/// - `ndigit`: in `1..=15`.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverSettings {
    pub ndigit: Option<i32>,
    pub taufac: Option<f64>,
    pub sstol: Option<f64>,
    pub partol: Option<f64>,
    pub maxit: Option<i32>,
    pub iprint: u32,
    pub report: ReportDestination,
    pub error: ReportDestination,
}

impl SolverSettings {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ndigit: Option<i32>, taufac: Option<f64>, sstol: Option<f64>, partol: Option<f64>,
        maxit: Option<i32>, iprint: u32, rptfile: Option<PathBuf>, errfile: Option<PathBuf>,
    ) -> Self {
        let sstol = within("sstol", sstol, |v| v > 0.0 && v < 1.0);
        let partol = within("partol", partol, |v| v > 0.0 && v < 1.0);
        let taufac = within("taufac", taufac, |v| v > 0.0 && v <= 1.0);
        let maxit = within("maxit", maxit, |v| v >= 0);
        let ndigit = within("ndigit", ndigit, |v| (1..=15).contains(&v));
        let (report, error) = resolve_destinations(rptfile, errfile);
        Self { ndigit, taufac, sstol, partol, maxit, iprint, report, error }
    }

    pub fn from_options(options: &OdrOptions) -> Self {
        Self::new(
            options.ndigit,
            options.taufac,
            options.sstol,
            options.partol,
            options.maxit,
            options.iprint,
            options.rptfile.clone(),
            options.errfile.clone(),
        )
    }
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            ndigit: None,
            taufac: None,
            sstol: None,
            partol: None,
            maxit: None,
            iprint: 0,
            report: ReportDestination::Stdout,
            error: ReportDestination::Stderr,
        }
    }
}

/// Keep `value` when `admissible`, otherwise fall back on the default.
fn within<T: Copy + std::fmt::Display>(name: &str, value: Option<T>, admissible: impl Fn(T) -> bool) -> Option<T> {
    match value {
        Some(v) if !admissible(v) => {
            log::warn!("{name} = {v} is out of range; using the default");
            None
        }
        other => other,
    }
}

fn resolve_destinations(
    rptfile: Option<PathBuf>, errfile: Option<PathBuf>,
) -> (ReportDestination, ReportDestination) {
    let report = rptfile.map_or(ReportDestination::Stdout, ReportDestination::File);
    let error = errfile.map_or(ReportDestination::Stderr, ReportDestination::File);
    (report, error)
}
