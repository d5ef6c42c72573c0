//! Scoped variable storage and expansion.
//!
//! A [`ScopeStore`] owns every named scope in a running evaluation; each
//! scope owns an adaptive [`AssocTable`] of variable associations. The
//! expander substitutes `$(name)` references inside scalars against the
//! store, leaving unresolved tokens verbatim.

pub mod assoc;
pub mod error;
pub mod expand;
pub mod scopes;

pub use assoc::{Association, AssocTable};
pub use error::{VarsError, VarsResult};
pub use expand::{copy_rval_in_context, expand_scalar, is_expandable};
pub use scopes::{no_functions, FnCallEvaluator, ScopeStore};
