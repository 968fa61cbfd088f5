//! core: job codes, shapes, option normalization and workspace layout.
//!
//! Purpose
//! -------
//! Turn a caller's loosely shaped ODR inputs into the canonical, fully
//! validated problem a solver consumes: decoded job flags, problem
//! dimensions, normalized weights/masks/steps/scales/bounds, and the flat
//! `work`/`iwork` buffers with their named offsets.
//!
//! Key behaviors
//! -------------
//! - [`job`] decodes the decimal job code into [`JobFlags`].
//! - [`model`] defines the [`Model`] seam and the closure-backed [`FnModel`].
//! - [`shape`] resolves [`ProblemDimensions`] from `x`, `y`, `beta0` and a
//!   trial evaluation of the model at `beta0`.
//! - [`options`] holds [`OdrOptions`] and resolves [`SolverSettings`].
//! - [`normalize`] maps every optional array onto its canonical layout.
//! - [`workspace`] plans buffer lengths and offsets ([`WorkspacePlan`]).
//! - [`validation`] collects the small finiteness/length checks shared by
//!   the modules above.
//!
//! Conventions
//! -----------
//! - Indexing is 0-based; canonical arrays are stored in `ndarray` C order.
//! - Every check here runs before the solver touches a buffer.

pub mod job;
pub mod model;
pub mod normalize;
pub mod options;
pub mod shape;
pub mod validation;
pub mod workspace;

// ---- Re-exports (primary public surface) ----------------------------------

pub use self::job::{CovarianceMode, DerivativeMode, FitKind, JobFlags};
pub use self::model::{FnModel, Model};
pub use self::normalize::{NormalizedParameters, WeightSpec, normalize_parameters};
pub use self::options::{OdrOptions, ReportDestination, SolverSettings, Weight};
pub use self::shape::{ProblemDimensions, resolve_dimensions};
pub use self::workspace::{IWorkIndex, WorkIndex, WorkspaceBuffers, WorkspacePlan};

// ---- Optional convenience prelude for downstream crates -------------------
//
// Downstream crates can write
//
//     use rust_odr::regression::core::prelude::*;
//
// to import the main marshalling surface in a single line.

pub mod prelude {
    pub use super::job::JobFlags;
    pub use super::model::{FnModel, Model};
    pub use super::options::{OdrOptions, Weight};
    pub use super::shape::ProblemDimensions;
    pub use super::workspace::{WorkspaceBuffers, WorkspacePlan};
}
