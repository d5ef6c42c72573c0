//! Persistent promise locks.
//!
//! Every promise instance runs inside an acquire → dispatch → yield
//! envelope backed by an on-disk key/value store, enforcing
//! at-most-one-invocation-per-interval across processes and reclaiming
//! stale locks left by dead agents.

pub mod error;
pub mod manager;
pub mod record;

pub use error::{LockError, LockResult};
pub use manager::{LockHandle, LockManager};
pub use record::{LockRecord, LOCK_RECORD_SIZE};
