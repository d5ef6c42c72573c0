//! Build constants shared across the workspace.

/// Maximum payload of one protocol transaction and the general I/O buffer size
pub const BUF_SIZE: usize = 4096;

/// Maximum length of a variable or scope identifier
pub const MAX_VAR_SIZE: usize = 1024;

/// Fixed capacity of the huge (open-addressed) association table.
/// Must be a power of two; the hash is masked by `HASH_TABLE_SIZE - 1`.
pub const HASH_TABLE_SIZE: usize = 4096;

/// Inline capacity of the tiny association table before conversion
pub const TINY_LIMIT: usize = 14;

/// Base of the positional digest used in lock identifiers
pub const MACRO_ALPHABET: u64 = 61;

/// Modulus of the lock-identifier digest
pub const LOCK_HASH_MODULUS: u64 = HASH_TABLE_SIZE as u64;

/// Sentinel scalar padding iteration wheels at head and tail
pub const NULL_VALUE: &str = "cf_null";

/// Suffix of the staging file a copy is written into before installation
pub const NEW_SUFFIX: &str = ".cfnew";

/// Suffix of the displaced previous destination during a copy
pub const SAVED_SUFFIX: &str = ".cfsaved";

/// Default TCP port of the file server
pub const DEFAULT_PORT: u16 = 5308;

/// Namespace separator in qualified scope names (`ns:bundle`)
pub const NAMESPACE_SEP: char = ':';

/// Default namespace, stripped on scope lookup
pub const DEFAULT_NAMESPACE: &str = "default";
