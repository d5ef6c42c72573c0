//! Core value model and promise types for the converge agent.
//!
//! This crate holds everything the policy-evaluation crates share: the
//! tagged rvalue model, list helpers, the promise and attribute types,
//! the class (boolean fact) store, and the common constants.

pub mod canonify;
pub mod classes;
pub mod constants;
pub mod error;
pub mod promise;
pub mod rlist;
pub mod rval;

pub use canonify::canonify;
pub use classes::ClassStore;
pub use constants::*;
pub use error::{CoreError, CoreResult};
pub use promise::{
    Action, BackupPolicy, Bundle, CompareMethod, Constraint, CopyAttributes, Promise,
    PromiseResult, TransactionAttributes,
};
pub use rlist::Rlist;
pub use rval::{DataType, Equality, FnCall, Rval};
