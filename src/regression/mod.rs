//! regression: weighted orthogonal distance regression front end.
//!
//! Purpose
//! -------
//! Fit a user model `y ≈ f(β; x + δ)` by weighted orthogonal distance
//! regression or ordinary least squares. This module owns everything around
//! the numerical solve: input validation, shape normalization, workspace
//! planning and decoding of the solver's buffers.
//!
//! Key behaviors
//! -------------
//! - [`api::fit`] is the one-call entry point; [`api::fit_with`] accepts any
//!   [`OdrSolver`](crate::solver::OdrSolver).
//! - [`core`] holds the marshalling building blocks.
//! - [`result`] decodes solver output into [`RegressionResult`].
//! - [`errors`] defines [`OdrError`] and [`OdrResult`].
//!
//! Invariants & assumptions
//! ------------------------
//! - Validation is fail-fast and precedes any solver call.
//! - Solver status codes are reported through
//!   [`RegressionResult::info`], never as errors.
//! - A fit owns all of its buffers, so independent fits may run
//!   concurrently.

pub mod api;
pub mod core;
pub mod errors;
pub mod result;

// ---- Re-exports (primary public surface) ----------------------------------

pub use self::api::{fit, fit_with};
pub use self::core::{FnModel, Model, OdrOptions, Weight};
pub use self::errors::{OdrError, OdrResult};
pub use self::result::RegressionResult;

// ---- Optional convenience prelude for downstream crates -------------------
//
//     use rust_odr::regression::prelude::*;

pub mod prelude {
    pub use super::{FnModel, Model, OdrError, OdrOptions, OdrResult, RegressionResult, Weight, fit};
}
