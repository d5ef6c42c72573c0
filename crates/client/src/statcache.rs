//! Per-promise memoisation of remote stat results.
//!
//! One promise evaluation stats the same remote file repeatedly (select,
//! compare, copy); the first answer is cached per `(server, path)` and
//! reused, including failures: a cached failure is answered locally with
//! a permission error and no network round-trip. The cache lives only as
//! long as the promise evaluation that owns it.

use crate::protocol::RemoteStat;

/// One memoised stat answer
#[derive(Debug, Clone)]
pub struct CachedStat {
    pub server: String,
    pub path: String,
    /// The reply fields; `None` for a cached failure
    pub stat: Option<RemoteStat>,
    pub failed: bool,
}

/// Linear-probe memo of stat replies within one promise
#[derive(Debug, Default)]
pub struct StatCache {
    entries: Vec<CachedStat>,
}

impl StatCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached answer for `(server, path)`, if any
    pub fn lookup(&self, server: &str, path: &str) -> Option<&CachedStat> {
        self.entries
            .iter()
            .find(|e| e.server == server && e.path == path)
    }

    /// Caches a successful stat
    pub fn insert(&mut self, server: &str, path: &str, stat: RemoteStat) {
        self.entries.push(CachedStat {
            server: server.to_string(),
            path: path.to_string(),
            stat: Some(stat),
            failed: false,
        });
    }

    /// Caches a failed stat; later lookups fail without a round-trip
    pub fn insert_failure(&mut self, server: &str, path: &str) {
        self.entries.push(CachedStat {
            server: server.to_string(),
            path: path.to_string(),
            stat: None,
            failed: true,
        });
    }

    /// Number of memoised answers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is memoised yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
