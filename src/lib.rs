//! rust_odr: weighted orthogonal distance regression with a trust-region
//! solver.
//!
//! Purpose
//! -------
//! Fit explicit models `y = f(β; x)` when both `x` and `y` carry error
//! (orthogonal distance regression) or only `y` does (ordinary least
//! squares). Callers supply a [`regression::Model`], data and optional
//! weights, masks, bounds and solver controls; the crate validates and
//! normalizes them, plans the solver's flat buffers, runs the solve and
//! decodes the outcome.
//!
//! Key behaviors
//! -------------
//! - [`regression`] is the public surface: [`regression::fit`], options,
//!   errors and [`regression::RegressionResult`].
//! - [`solver`] defines the [`solver::OdrSolver`] seam and the bundled
//!   [`solver::TrustRegionSolver`], plus its reports.
//!
//! Conventions
//! -----------
//! - Arrays are `ndarray` containers; indexing is 0-based.
//! - Diagnostics go through the `log` facade; the crate installs no logger.
//!   Human-readable solver reports are written only when `iprint != 0`.

pub mod regression;
pub mod solver;
