//! Converge agent configuration.
//!
//! Everything the evaluation engine and the copy client need to know about
//! their environment: working directory, network knobs, the worker-thread
//! cap, and the key-trust policy. Loadable from a TOML file; every field
//! has a sensible default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default TCP port of the file server
pub const DEFAULT_SERVER_PORT: u16 = 5308;

/// Default connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default receive timeout in seconds
pub const DEFAULT_RECEIVE_TIMEOUT_SECS: u64 = 30;

/// Default worker-thread cap
pub const DEFAULT_MAX_THREADS: usize = 10;

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Cannot parse configuration {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Agent-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Working directory holding the lock database, key cache, and runlogs
    pub work_dir: PathBuf,
    /// Server port for remote copies
    pub port: u16,
    /// Seconds to wait for a TCP connect
    pub connect_timeout_secs: u64,
    /// Seconds to wait for one protocol transaction
    pub receive_timeout_secs: u64,
    /// Cap on worker threads, including backgrounded promises
    pub max_threads: usize,
    /// Local address to bind outgoing connections to, when set
    pub bind_interface: Option<String>,
    /// Resolve servers over IPv4 only
    pub force_ipv4: bool,
    /// Use the FIPS-approved digest in challenge responses
    pub fips_mode: bool,
    /// Accept and persist unknown server keys without a policy promise
    pub implicit_trust: bool,
    /// Skip reverse identification of the local endpoint
    pub skip_identify: bool,
    /// Minutes after which an orphaned lock is reclaimed by the sweeper
    pub lock_horizon_minutes: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/converge"),
            port: DEFAULT_SERVER_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            receive_timeout_secs: DEFAULT_RECEIVE_TIMEOUT_SECS,
            max_threads: DEFAULT_MAX_THREADS,
            bind_interface: None,
            force_ipv4: false,
            fips_mode: false,
            implicit_trust: false,
            skip_identify: false,
            lock_horizon_minutes: 4 * 60,
        }
    }
}

impl AgentConfig {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// The connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The receive timeout as a duration
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    /// Directory the per-server public keys are persisted in
    pub fn key_dir(&self) -> PathBuf {
        self.work_dir.join("ppkeys")
    }
}
