//! Error types for layer and network operations
//!
//! Every failure in the numeric core is either a configuration error (bad
//! stride/padding arithmetic, unknown mode, out-of-range probability) or a
//! shape error (parameter, cache and upstream gradient disagreeing). Both are
//! reported eagerly at the point of violation.

use std::fmt;

/// Result type alias for layer and network operations
pub type LayerResult<T> = Result<T, LayerError>;

/// Error type for layer and network operations
#[derive(Debug, Clone, PartialEq)]
pub enum LayerError {
    /// A hyperparameter combination that cannot produce a valid layer
    InvalidConfiguration {
        parameter: String,
        value: String,
        reason: String,
    },

    /// Mode string other than train/eval
    InvalidMode(String),

    /// Two tensors that must agree in shape do not
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Class label outside `[0, num_classes)`
    InvalidLabel {
        index: usize,
        label: usize,
        num_classes: usize,
    },

    /// Label vector length differs from the batch size
    LabelCountMismatch { expected: usize, got: usize },
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerError::InvalidConfiguration {
                parameter,
                value,
                reason,
            } => {
                write!(
                    f,
                    "Invalid configuration for parameter '{}' with value '{}': {}",
                    parameter, value, reason
                )
            }
            LayerError::InvalidMode(mode) => {
                write!(
                    f,
                    "Invalid mode '{}': expected 'train' or 'eval'",
                    mode
                )
            }
            LayerError::ShapeMismatch {
                context,
                expected,
                got,
            } => {
                write!(
                    f,
                    "Shape mismatch in {}: expected {:?}, got {:?}",
                    context, expected, got
                )
            }
            LayerError::InvalidLabel {
                index,
                label,
                num_classes,
            } => {
                write!(
                    f,
                    "Invalid label {} at position {}: must be below {}",
                    label, index, num_classes
                )
            }
            LayerError::LabelCountMismatch { expected, got } => {
                write!(
                    f,
                    "Label count mismatch: batch has {} rows, got {} labels",
                    expected, got
                )
            }
        }
    }
}

impl std::error::Error for LayerError {}

impl LayerError {
    /// Create an invalid configuration error
    pub fn invalid_config(
        parameter: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        LayerError::InvalidConfiguration {
            parameter: parameter.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        LayerError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

/// Fails with [`LayerError::ShapeMismatch`] unless `got == expected`.
pub(crate) fn ensure_shape(context: &str, expected: &[usize], got: &[usize]) -> LayerResult<()> {
    if expected == got {
        Ok(())
    } else {
        Err(LayerError::shape_mismatch(context, expected, got))
    }
}
