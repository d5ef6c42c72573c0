//! Error types shared by the policy-evaluation crates.

use thiserror::Error;

/// Errors raised by the core value model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A class guard expression could not be parsed
    #[error("Invalid class expression \"{expression}\": {reason}")]
    InvalidClassExpression { expression: String, reason: String },

    /// A regular expression supplied by policy was invalid
    #[error("Invalid regular expression \"{pattern}\": {reason}")]
    InvalidRegex { pattern: String, reason: String },

    /// An identifier exceeded the maximum variable size
    #[error("Identifier too long: {length} bytes > {max} bytes")]
    IdentifierTooLong { length: usize, max: usize },

    /// Formal and actual parameter lists did not line up
    #[error("Parameter mismatch in {context}: {formal} formal vs {actual} actual")]
    ParameterMismatch {
        context: String,
        formal: usize,
        actual: usize,
    },

    /// Generic core error
    #[error("Core error: {reason}")]
    Generic { reason: String },
}

impl CoreError {
    /// Create a new invalid-regex error
    pub fn invalid_regex<S: Into<String>>(pattern: S, reason: S) -> Self {
        Self::InvalidRegex {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(reason: S) -> Self {
        Self::Generic {
            reason: reason.into(),
        }
    }
}

/// Result type for core operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;
