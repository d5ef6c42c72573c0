//! The remote file-copy protocol client.
//!
//! Connects to file servers over framed TCP transactions, authenticates
//! with the RSA challenge-response dialogue, negotiates a symmetric
//! session key, and issues the stat/readdir/get/hash verbs. Connections
//! are cached per server with busy/idle/offline state; remote stats are
//! memoised per promise; sparse files survive the transfer.

pub mod auth;
pub mod connection;
pub mod copy;
pub mod error;
pub mod hardlink;
pub mod keys;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod sparse;
pub mod statcache;
pub mod transaction;

pub use auth::AuthOptions;
pub use connection::{AgentConnection, ConnectOptions};
pub use copy::{copy_regular_file, sync_directory, CopyOutcome, SyncStats};
pub use error::{ClientError, ClientResult};
pub use hardlink::HardLinkCache;
pub use keys::{KeyPair, KeyStore};
pub use pool::{ClientContext, ConnectionLease, ConnectionPool};
pub use protocol::{RemoteStat, StatType, SyntheticStat};
pub use session::CipherKind;
pub use sparse::SparseWriter;
pub use statcache::StatCache;
