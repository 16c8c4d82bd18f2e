//! Field-level validation for envelopes and payloads.

use rust_decimal::Decimal;
use thiserror::Error;

/// Reasons an envelope is rejected before it reaches the bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} cannot be blank")]
    BlankField(&'static str),

    #[error("{0} is missing; enrich the envelope before publishing")]
    NotEnriched(&'static str),

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: Decimal },

    #[error("{field} is not a well-formed email address: '{value}'")]
    MalformedEmail { field: &'static str, value: String },

    #[error("{event_type} must be produced by '{expected}', envelope says '{found}'")]
    SourceMismatch {
        event_type: &'static str,
        expected: &'static str,
        found: String,
    },
}

pub(crate) fn require_non_blank(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::BlankField(field));
    }
    Ok(())
}

pub(crate) fn require_optional_non_blank(
    field: &'static str,
    value: Option<&str>,
) -> Result<(), ValidationError> {
    match value {
        Some(v) => require_non_blank(field, v),
        None => Ok(()),
    }
}

pub(crate) fn require_positive(field: &'static str, value: Decimal) -> Result<(), ValidationError> {
    if value <= Decimal::ZERO {
        return Err(ValidationError::NotPositive { field, value });
    }
    Ok(())
}

pub(crate) fn require_email(field: &'static str, value: &str) -> Result<(), ValidationError> {
    require_non_blank(field, value)?;
    if !is_well_formed_email(value) {
        return Err(ValidationError::MalformedEmail {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Structural email check: one `@`, non-empty local part, dotted domain
/// whose labels are non-empty, no whitespace.
fn is_well_formed_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| !label.is_empty())
}
