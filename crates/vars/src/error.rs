//! Error types for the variable store.

use thiserror::Error;

/// Errors raised by scope and variable operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VarsError {
    /// Formal and actual parameter lists of a bundle call differ in length
    #[error("Augmenting scope \"{scope}\": {formal} formal vs {actual} actual parameters")]
    ParameterMismatch {
        scope: String,
        formal: usize,
        actual: usize,
    },

    /// A variable name exceeded the identifier limit
    #[error("Variable lval too long: {length} bytes")]
    LvalTooLong { length: usize },

    /// A named scope does not exist
    #[error("No such scope: \"{scope}\"")]
    NoSuchScope { scope: String },
}

/// Result type for variable-store operations
pub type VarsResult<T> = std::result::Result<T, VarsError>;
