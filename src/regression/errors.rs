//! Errors for ODR marshalling (shape checks, bounds, job-code consistency,
//! restart buffers, option arrays and the model evaluation channel).
//!
//! This module defines the crate error type, [`OdrError`], used by every
//! validation step that runs before the solver is invoked. All variants are
//! raised fail-fast and before any buffer mutation, so a caller that receives
//! an error can assume its inputs were left untouched.
//!
//! ## Conventions
//! - **Indices are 0-based** and shapes are reported in `ndarray` axis order.
//! - `argument` fields carry the public option name (`"we"`, `"ifixx"`, …) so
//!   messages are actionable without a stack trace.
//! - The solver's integer status code is *never* converted into an
//!   [`OdrError`]; it is classified by the result decoder instead.

/// Crate-wide result alias for operations that may produce [`OdrError`].
pub type OdrResult<T> = Result<T, OdrError>;

/// Unified error type for ODR problem marshalling.
#[derive(Debug, Clone, PartialEq)]
pub enum OdrError {
    // ---- Shapes ----
    /// An array's rank or shape is not one of the accepted layouts for its role.
    ShapeMismatch { argument: &'static str, expected: String, found: Vec<usize> },

    // ---- Bounds ----
    /// A bound does not strictly enclose the initial parameter vector.
    InvalidBounds { argument: &'static str, index: usize, bound: f64, beta0: f64 },

    // ---- Job code ----
    /// A job-gated feature is enabled without its argument, or disabled while
    /// the argument is supplied.
    InconsistentJobArgument { argument: &'static str, reason: &'static str },

    // ---- Workspace ----
    /// A restart buffer does not have the planner's required length.
    RestartSizeMismatch { buffer: &'static str, expected: usize, found: usize },

    // ---- Options ----
    /// A weight entry is non-finite, or a diagonal weight is negative.
    InvalidWeight { argument: &'static str, index: usize, value: f64, reason: &'static str },

    /// A step, scale or initial error entry is NaN or infinite.
    NonFiniteInput { argument: &'static str, index: usize, value: f64 },

    // ---- Model channel ----
    /// Implies that finite differences should be used.
    JacobianNotImplemented { which: &'static str },

    /// The model rejected the current `(beta, x + delta)` point.
    ModelStop,

    /// Model or Jacobian output contains NaN/±inf at the evaluated point.
    NonFiniteModelOutput { argument: &'static str, index: usize, value: f64 },
}

impl std::error::Error for OdrError {}

impl std::fmt::Display for OdrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // ---- Shapes ----
            OdrError::ShapeMismatch { argument, expected, found } => {
                write!(f, "Shape mismatch for '{argument}': found {found:?}, expected {expected}")
            }

            // ---- Bounds ----
            OdrError::InvalidBounds { argument, index, bound, beta0 } => {
                let relation = if *argument == "lower" { "below" } else { "above" };
                write!(
                    f,
                    "Invalid bounds: '{argument}'[{index}] = {bound} must lie strictly {relation} beta0[{index}] = {beta0}"
                )
            }

            // ---- Job code ----
            OdrError::InconsistentJobArgument { argument, reason } => {
                write!(f, "Inconsistent job code and argument '{argument}': {reason}")
            }

            // ---- Workspace ----
            OdrError::RestartSizeMismatch { buffer, expected, found } => {
                write!(f, "Restart buffer '{buffer}' has length {found}, expected {expected}")
            }

            // ---- Options ----
            OdrError::InvalidWeight { argument, index, value, reason } => {
                write!(f, "Invalid weight in '{argument}' at flat index {index}: {value}: {reason}")
            }
            OdrError::NonFiniteInput { argument, index, value } => {
                write!(f, "Non-finite entry in '{argument}' at flat index {index}: {value}")
            }

            // ---- Model channel ----
            OdrError::JacobianNotImplemented { which } => {
                write!(f, "Analytic Jacobian '{which}' not implemented")
            }
            OdrError::ModelStop => write!(f, "Model evaluation requested a stop"),
            OdrError::NonFiniteModelOutput { argument, index, value } => {
                write!(f, "Non-finite output from '{argument}' at flat index {index}: {value}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    // Purpose
    // -------
    // Ensure shape errors name the argument and list the accepted layouts.
    fn shape_mismatch_message_names_argument_and_accepted_shapes() {
        // Arrange
        let err = OdrError::ShapeMismatch {
            argument: "we",
            expected: "(nq,), (nq, nq), (nq, n)".to_string(),
            found: vec![3, 7],
        };

        // Act
        let msg = err.to_string();

        // Assert
        assert!(msg.contains("'we'"));
        assert!(msg.contains("[3, 7]"));
        assert!(msg.contains("(nq, nq)"));
    }

    #[test]
    // Purpose
    // -------
    // Bound messages must state the direction of the violated inequality.
    fn invalid_bounds_message_reports_direction() {
        let lower = OdrError::InvalidBounds { argument: "lower", index: 1, bound: 0.5, beta0: 0.5 };
        let upper = OdrError::InvalidBounds { argument: "upper", index: 0, bound: 1.0, beta0: 2.0 };

        assert!(lower.to_string().contains("strictly below"));
        assert!(upper.to_string().contains("strictly above"));
    }

    #[test]
    fn non_finite_step_is_not_reported_as_a_weight() {
        let err = OdrError::NonFiniteInput { argument: "stpb", index: 2, value: f64::INFINITY };

        let msg = err.to_string();

        assert!(msg.contains("'stpb'"));
        assert!(msg.contains("flat index 2"));
        assert!(!msg.contains("weight"));
    }
}
