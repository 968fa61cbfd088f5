//! Validation helpers shared by the shape resolver, the normalizer and the
//! workspace planner.
//!
//! Each helper returns early with the first offending entry so error messages
//! can name a flat index.
use crate::regression::errors::{OdrError, OdrResult};

/// Require every value to be finite.
///
/// # Errors
/// - [`OdrError::NonFiniteInput`] at the first NaN/±inf entry.
pub fn validate_finite<'a>(argument: &'static str, values: impl IntoIterator<Item = &'a f64>) -> OdrResult<()> {
    match values.into_iter().enumerate().find(|(_, v)| !v.is_finite()) {
        Some((index, &value)) => Err(OdrError::NonFiniteInput { argument, index, value }),
        None => Ok(()),
    }
}

/// Require every entry of a full weight matrix to be finite.
///
/// # Errors
/// - [`OdrError::InvalidWeight`] at the first NaN/±inf entry.
pub fn validate_finite_weight<'a>(
    argument: &'static str, values: impl IntoIterator<Item = &'a f64>,
) -> OdrResult<()> {
    match values.into_iter().enumerate().find(|(_, v)| !v.is_finite()) {
        Some((index, &value)) => {
            Err(OdrError::InvalidWeight { argument, index, value, reason: "Weight matrices must be finite." })
        }
        None => Ok(()),
    }
}

/// Require every value to be finite and `>= 0`.
///
/// # Errors
/// - [`OdrError::InvalidWeight`] at the first non-finite or negative entry.
pub fn validate_non_negative<'a>(
    argument: &'static str, values: impl IntoIterator<Item = &'a f64>,
) -> OdrResult<()> {
    for (index, &value) in values.into_iter().enumerate() {
        if !value.is_finite() || value < 0.0 {
            return Err(OdrError::InvalidWeight {
                argument,
                index,
                value,
                reason: "Diagonal weights must be finite and non-negative.",
            });
        }
    }
    Ok(())
}

/// Require model or Jacobian output at the evaluated point to be finite.
pub fn validate_model_output<'a>(
    argument: &'static str, values: impl IntoIterator<Item = &'a f64>,
) -> OdrResult<()> {
    match values.into_iter().enumerate().find(|(_, v)| !v.is_finite()) {
        Some((index, &value)) => Err(OdrError::NonFiniteModelOutput { argument, index, value }),
        None => Ok(()),
    }
}

/// Require a restart buffer to have exactly the planned length.
pub fn validate_buffer_len(buffer: &'static str, expected: usize, found: usize) -> OdrResult<()> {
    if expected != found {
        return Err(OdrError::RestartSizeMismatch { buffer, expected, found });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_offending_index_is_reported() {
        let values = [1.0, 0.0, -2.0, f64::NAN];

        assert!(matches!(validate_non_negative("wd", &values), Err(OdrError::InvalidWeight { index: 2, .. })));
        assert!(matches!(validate_finite_weight("we", &values), Err(OdrError::InvalidWeight { index: 3, .. })));
        assert!(matches!(
            validate_finite("stpd", &values),
            Err(OdrError::NonFiniteInput { argument: "stpd", index: 3, .. })
        ));
        assert!(matches!(
            validate_model_output("f", &values),
            Err(OdrError::NonFiniteModelOutput { argument: "f", index: 3, .. })
        ));
    }

    #[test]
    fn buffer_length_must_match_exactly() {
        assert!(validate_buffer_len("work", 10, 10).is_ok());
        assert_eq!(
            validate_buffer_len("iwork", 46, 45),
            Err(OdrError::RestartSizeMismatch { buffer: "iwork", expected: 46, found: 45 })
        );
    }
}
