//! Error types for the evaluation engine.

use thiserror::Error;

/// Errors raised while expanding and dispatching promises
#[derive(Error, Debug)]
pub enum EngineError {
    /// An iterated variable vanished from its scope
    #[error("Couldn't locate variable \"{variable}\" in scope \"{scope}\"")]
    MissingIterationVariable { variable: String, scope: String },

    /// A wheel's source is an unexpanded function call
    #[error("List variable \"{variable}\" is still an unexpanded function call")]
    NonIterable { variable: String },

    /// Scope augmentation failed
    #[error(transparent)]
    Vars(#[from] converge_vars::VarsError),

    /// Guard evaluation failed
    #[error(transparent)]
    Core(#[from] converge_core::CoreError),

    /// The lock manager failed fatally
    #[error(transparent)]
    Lock(#[from] converge_locks::LockError),
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;
