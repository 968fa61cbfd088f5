//! Solver seam and the reference trust-region solver.
//!
//! The marshalling layer in [`crate::regression`] hands a fully validated
//! problem to an [`OdrSolver`] through one [`SolverCall`]: normalized
//! parameters, settings, the workspace plan and the flat `work`/`iwork`
//! buffers. The solver mutates `beta`, `delta` and the buffers in place and
//! reports a status code; it never returns an error.
pub mod blocks;
pub mod linalg;
pub mod report;
pub mod trust_region;

pub use self::trust_region::TrustRegionSolver;

use crate::regression::core::{
    job::JobFlags, model::Model, normalize::NormalizedParameters, options::SolverSettings,
    shape::ProblemDimensions, workspace::WorkspacePlan,
};
use ndarray::{Array1, Array2, ArrayD};

/// Everything one solve borrows.
pub struct SolverCall<'a> {
    pub dims: ProblemDimensions,
    pub job: JobFlags,
    pub model: &'a dyn Model,
    pub x: &'a ArrayD<f64>,
    pub y: &'a ArrayD<f64>,
    pub beta: &'a mut Array1<f64>,
    /// `(m, n)` errors in `x`.
    pub delta: &'a mut Array2<f64>,
    pub params: &'a NormalizedParameters,
    pub settings: &'a SolverSettings,
    pub plan: &'a WorkspacePlan,
    pub work: &'a mut [f64],
    pub iwork: &'a mut [i32],
}

/// A numerical back end for weighted ODR / OLS problems.
///
/// Implementations write every field named in the workspace plan that the
/// result decoder reads (`eps`, `sd`, `vcv`, `rvar`, `wss`, `wssde`,
/// `wssep`, `rcond`, `niter`, `nfev`, `njev`, `irank`) and return the status
/// code: `1..=3` converged, `4` iteration limit, anything else a failure.
pub trait OdrSolver {
    fn solve(&self, call: SolverCall<'_>) -> i32;
}
