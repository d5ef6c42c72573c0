//! Promise and attribute types.
//!
//! The parser (an external collaborator) emits bundles of promises; the
//! engine evaluates them. A promise binds a promiser to a set of
//! constraints describing the desired state, guarded by a class
//! expression. Attribute structs carry the parsed constraint bodies the
//! actuators and the copy client consume.

use crate::rval::Rval;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One `lval => rval` constraint of a promise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub lval: String,
    pub rval: Rval,
}

impl Constraint {
    pub fn new<S: Into<String>>(lval: S, rval: Rval) -> Self {
        Self {
            lval: lval.into(),
            rval,
        }
    }
}

/// A declarative statement binding a promiser to desired state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promise {
    /// The subject of the promise (a path, a variable name, a command, ...)
    pub promiser: String,
    /// The promisee, or [`Rval::None`] when absent
    pub promisee: Rval,
    /// Promise type name the actuator registry dispatches on
    pub promise_type: String,
    /// Defining bundle
    pub bundle: String,
    /// Namespace of the defining bundle
    pub namespace: String,
    /// Class guard expression; the promise only applies where it holds
    pub class_guard: String,
    /// Constraint body
    pub constraints: Vec<Constraint>,
}

impl Promise {
    /// Creates a promise with an empty constraint body and the `any` guard
    pub fn new<S: Into<String>>(promise_type: S, promiser: S, bundle: S) -> Self {
        Self {
            promiser: promiser.into(),
            promisee: Rval::None,
            promise_type: promise_type.into(),
            bundle: bundle.into(),
            namespace: crate::constants::DEFAULT_NAMESPACE.to_string(),
            class_guard: "any".to_string(),
            constraints: Vec::new(),
        }
    }

    /// Adds a constraint, builder style
    pub fn with_constraint<S: Into<String>>(mut self, lval: S, rval: Rval) -> Self {
        self.constraints.push(Constraint::new(lval, rval));
        self
    }

    /// Looks up a constraint rvalue by lval
    pub fn constraint(&self, lval: &str) -> Option<&Rval> {
        self.constraints
            .iter()
            .find(|c| c.lval == lval)
            .map(|c| &c.rval)
    }

    /// The scope this promise's bare variables resolve in
    pub fn defining_scope(&self) -> String {
        if self.namespace == crate::constants::DEFAULT_NAMESPACE {
            self.bundle.clone()
        } else {
            format!("{}:{}", self.namespace, self.bundle)
        }
    }
}

/// A namespace of promises grouped under a nominal agent role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub namespace: String,
    /// Nominal role ("agent", "common", "server", ...)
    pub bundle_type: String,
    /// Formal parameter names
    pub params: Vec<String>,
    /// Promises in declaration order
    pub promises: Vec<Promise>,
}

impl Bundle {
    pub fn new<S: Into<String>>(bundle_type: S, name: S) -> Self {
        Self {
            name: name.into(),
            namespace: crate::constants::DEFAULT_NAMESPACE.to_string(),
            bundle_type: bundle_type.into(),
            params: Vec::new(),
            promises: Vec::new(),
        }
    }
}

/// Outcome of applying one concrete promise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseResult {
    /// Desired state already held
    Kept,
    /// Nothing needed doing and nothing was inspected deeply
    NoOp,
    /// State was converged by a repair action
    Repaired,
    /// A repair was needed but policy only allows warning
    Warn,
    /// The repair was attempted and failed
    Fail,
    /// The counterparty refused the operation
    Denied,
    /// The operation ran out of time
    Timeout,
    /// The operation was cancelled mid-flight
    Interrupted,
    /// The promise did not apply (guard, lock, or elapsed-time suppression)
    Skipped,
}

/// What to do when a repair is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Action {
    /// Repair the state
    #[default]
    Fix,
    /// Only warn about the deviation
    Warn,
}

/// Locking and scheduling attributes of a promise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionAttributes {
    /// Minimum minutes between two applications of the same promise
    pub if_elapsed: u64,
    /// Minutes after which a held lock is presumed stale and reclaimed
    pub expire_after: u64,
    /// Run in a background worker rather than the evaluating thread
    pub background: bool,
    /// Repair or warn
    pub action: Action,
    /// Optional line appended to the transaction log on completion
    pub log_string: Option<String>,
}

impl Default for TransactionAttributes {
    fn default() -> Self {
        Self {
            if_elapsed: 1,
            expire_after: 120,
            background: false,
            action: Action::Fix,
            log_string: None,
        }
    }
}

/// How source and destination are compared before copying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompareMethod {
    /// Copy when the source modification time is newer
    #[default]
    Mtime,
    /// Copy when the source change time is newer
    Ctime,
    /// Copy when either timestamp is newer
    Atime,
    /// Copy when the content digests differ
    Digest,
    /// Only ensure the destination exists
    Exists,
}

/// What happens to the displaced destination file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackupPolicy {
    /// Leave a `.cfsaved` sibling
    #[default]
    Backup,
    /// No backup at all
    NoBackup,
    /// Timestamped `.cfsaved` sibling
    Timestamp,
}

/// Attributes of a `copy_from` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyAttributes {
    /// Candidate servers in preference order; "localhost" means a local copy
    pub servers: Vec<String>,
    /// Encrypt verb payloads and file blocks under the session key
    pub encrypt: bool,
    /// Comparison policy deciding whether a copy is needed
    pub compare: CompareMethod,
    /// Remove destination files absent from the source during recursion
    pub purge: bool,
    /// Recursion depth for directory copies; 0 means the top level only
    pub depth: u32,
    /// Accept and persist an unknown server key (trust on first use)
    pub trustkey: bool,
    /// Re-hash the transferred file against the source before installing
    pub verify: bool,
    /// Copy unconditionally, ignoring comparison
    pub force_update: bool,
    /// Refuse to replace a destination of a different file type
    pub type_check: bool,
    /// Backup policy for the displaced destination
    pub backup: BackupPolicy,
    /// Force IPv4 resolution
    pub force_ipv4: bool,
    /// Server port; the well-known default when unset
    pub port: Option<u16>,
    /// Connect and receive timeout
    pub timeout: Option<Duration>,
}

impl Default for CopyAttributes {
    fn default() -> Self {
        Self {
            servers: vec!["localhost".to_string()],
            encrypt: false,
            compare: CompareMethod::Mtime,
            purge: false,
            depth: 0,
            trustkey: false,
            verify: false,
            force_update: false,
            type_check: false,
            backup: BackupPolicy::Backup,
            force_ipv4: false,
            port: None,
            timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_lookup() {
        let p = Promise::new("files", "/etc/motd", "maintenance")
            .with_constraint("create", Rval::scalar("true"))
            .with_constraint("perms", Rval::scalar("0644"));

        assert_eq!(p.constraint("create"), Some(&Rval::scalar("true")));
        assert_eq!(p.constraint("absent"), None);
    }

    #[test]
    fn test_defining_scope_qualification() {
        let mut p = Promise::new("reports", "hello", "greeting");
        assert_eq!(p.defining_scope(), "greeting");

        p.namespace = "site".to_string();
        assert_eq!(p.defining_scope(), "site:greeting");
    }

    #[test]
    fn test_transaction_defaults() {
        let t = TransactionAttributes::default();
        assert_eq!(t.if_elapsed, 1);
        assert_eq!(t.expire_after, 120);
        assert!(!t.background);
    }
}
