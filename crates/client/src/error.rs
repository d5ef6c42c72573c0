//! Error types for the copy protocol client.

use thiserror::Error;

/// Errors raised by connection handling and the copy protocol
#[derive(Error, Debug)]
pub enum ClientError {
    /// TCP connection establishment failed
    #[error("Connection failed to {server}: {reason}")]
    ConnectionFailed { server: String, reason: String },

    /// The server name did not resolve
    #[error("DNS resolution failed for {host}: {reason}")]
    DnsResolution { host: String, reason: String },

    /// The connection is closed or was latched into the error state
    #[error("Connection to {server} is unusable")]
    ConnectionUnusable { server: String },

    /// The authentication dialogue failed
    #[error("Authentication with {server} failed: {reason}")]
    AuthenticationFailed { server: String, reason: String },

    /// The peer broke the framing or verb contract
    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// A frame exceeded the transaction payload limit
    #[error("Frame too large: {size} bytes > {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// The server refused access to a path
    #[error("Access to {server}:{path} denied")]
    AccessDenied { server: String, path: String },

    /// The source changed underneath a running transfer
    #[error("Source {server}:{path} changed while copying")]
    SourceChanged { server: String, path: String },

    /// Server and client clocks differ too much for copy-by-date
    #[error("Clocks differ too much to copy by date: {reason}")]
    Unsynchronized { reason: String },

    /// A remote stat failed
    #[error("Cannot stat {server}:{path}: {reason}")]
    StatFailed {
        server: String,
        path: String,
        reason: String,
    },

    /// RSA or session-cipher trouble
    #[error("Cryptographic failure: {reason}")]
    Crypto { reason: String },

    /// The on-disk key store misbehaved
    #[error("Key store error for {name}: {reason}")]
    KeyStore { name: String, reason: String },

    /// The transferred byte count does not match the announced size
    #[error("Transferred size {actual} != announced size {expected} for {path}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// Post-transfer hash verification failed
    #[error("Checksum mismatch after transfer of {path}")]
    ChecksumMismatch { path: String },

    /// The operation was cancelled by its worker's flag
    #[error("Operation interrupted")]
    Interrupted,

    /// Local I/O failed
    #[error("I/O error in {operation}: {reason}")]
    Io { operation: String, reason: String },
}

impl ClientError {
    /// Create a new connection-failed error
    pub fn connection_failed<S: Into<String>>(server: S, reason: S) -> Self {
        Self::ConnectionFailed {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Create a new protocol-violation error
    pub fn protocol<S: Into<String>>(reason: S) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Create a new crypto error
    pub fn crypto<S: Into<String>>(reason: S) -> Self {
        Self::Crypto {
            reason: reason.into(),
        }
    }

    /// Create a new I/O error with an operation tag
    pub fn io<S: Into<String>, T: Into<String>>(operation: S, reason: T) -> Self {
        Self::Io {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether the connection should be destroyed after this error
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            ClientError::ProtocolViolation { .. }
                | ClientError::FrameTooLarge { .. }
                | ClientError::ConnectionUnusable { .. }
                | ClientError::AuthenticationFailed { .. }
                | ClientError::Interrupted
                | ClientError::Io { .. }
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(error: std::io::Error) -> Self {
        ClientError::Io {
            operation: "io".to_string(),
            reason: error.to_string(),
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;
