//! CRD validation errors

use thiserror::Error;

/// Errors raised while validating a `MonitoringInstance` spec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CrdError {
    /// A field holds a value the controller cannot render
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// JSON path of the offending field (e.g. `spec.search.nodeSets[0].name`)
        field: String,
        /// Human readable reason
        reason: String,
    },

    /// The spec is structurally incomplete
    #[error("incomplete spec: {0}")]
    Incomplete(String),
}

impl CrdError {
    /// Shorthand for [`CrdError::InvalidField`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
