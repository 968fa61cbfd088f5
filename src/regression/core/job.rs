//! Job-code decoding into one explicit flags struct per call.
//!
//! Purpose
//! -------
//! Turn the solver's decimal "job code" into named mode flags exactly once at
//! the entry point, so no other component re-derives modes from the raw
//! integer.
//!
//! Key behaviors
//! -------------
//! - Digits are read right to left, 1-indexed:
//!   `digit(code, k) = (code / 10^(k-1)) mod 10`.
//! - digit 1 selects the fit kind (explicit ODR, implicit ODR, OLS),
//!   digit 2 the derivative source, digit 3 the covariance treatment,
//!   digit 4 a caller-supplied `delta0` and digit 5 a restart.
//!
//! Invariants & assumptions
//! ------------------------
//! - Every `u32` is a legal job code. Combinations that contradict the
//!   supplied arguments are rejected downstream (normalizer, planner, shape
//!   resolver), never here.

/// Extract the `k`-th decimal digit of `code`, counting from the right and
/// starting at 1.
pub fn digit(code: u32, k: u32) -> u32 {
    match k.checked_sub(1).and_then(|exp| 10u32.checked_pow(exp)) {
        Some(base) => (code / base) % 10,
        None => 0,
    }
}

/// Problem type selected by digit 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitKind {
    ExplicitOdr,
    /// Decoded and stored, but the bundled trust-region solver answers it
    /// with status 10001 instead of fitting.
    ImplicitOdr,
    OrdinaryLeastSquares,
}

/// Derivative source selected by digit 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivativeMode {
    ForwardDifference,
    CentralDifference,
    /// Analytic Jacobians, compared against finite differences at the start.
    AnalyticChecked,
    AnalyticUnchecked,
}

/// Covariance treatment selected by digit 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovarianceMode {
    /// Jacobians are re-evaluated at the solution.
    Recomputed,
    /// Jacobians from the final iteration are reused.
    LastIteration,
    Skipped,
}

/// Mode flags decoded from a job code.
///
/// The four booleans are the modes the marshalling layer acts on; the enums
/// carry the finer solver-facing detail of digits 1–3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobFlags {
    pub code: u32,
    pub is_odr: bool,
    pub has_jac: bool,
    pub has_delta0: bool,
    pub is_restart: bool,
    pub fit_kind: FitKind,
    pub derivatives: DerivativeMode,
    pub covariance: CovarianceMode,
}

impl JobFlags {
    pub fn decode(code: u32) -> Self {
        let d1 = digit(code, 1);
        let d2 = digit(code, 2);
        let d3 = digit(code, 3);

        let fit_kind = match d1 {
            0 => FitKind::ExplicitOdr,
            1 => FitKind::ImplicitOdr,
            _ => FitKind::OrdinaryLeastSquares,
        };
        let derivatives = match d2 {
            0 => DerivativeMode::ForwardDifference,
            1 => DerivativeMode::CentralDifference,
            2 => DerivativeMode::AnalyticChecked,
            _ => DerivativeMode::AnalyticUnchecked,
        };
        let covariance = match d3 {
            0 => CovarianceMode::Recomputed,
            1 => CovarianceMode::LastIteration,
            _ => CovarianceMode::Skipped,
        };

        Self {
            code,
            is_odr: d1 < 2,
            has_jac: d2 > 1,
            has_delta0: digit(code, 4) > 0,
            is_restart: digit(code, 5) > 0,
            fit_kind,
            derivatives,
            covariance,
        }
    }
}

impl Default for JobFlags {
    fn default() -> Self {
        Self::decode(0)
    }
}
