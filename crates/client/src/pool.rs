//! The server connection cache.
//!
//! Connections are cached per resolved server IP and handed out as
//! leases: taking a connection marks the entry busy, dropping the lease
//! returns it to the idle state. A server that could not be contacted is
//! marked offline for the rest of the run with a distinct sentinel state,
//! so later promises skip it without a connect attempt. Backgrounded
//! promises get private connections, never cached ones, bounded by the
//! worker-thread cap.

use crate::auth::{self, AuthOptions};
use crate::connection::{server_ip_key, AgentConnection, ConnectOptions};
use crate::error::ClientResult;
use crate::keys::{KeyPair, KeyStore};
use converge_core::promise::CopyAttributes;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything needed to open and authenticate new connections
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub keys: Arc<KeyPair>,
    pub keystore: KeyStore,
    /// Base connect parameters; per-promise attributes override them
    pub connect: ConnectOptions,
    /// Use the FIPS digest in challenge replies
    pub fips_mode: bool,
    /// Accept unknown server keys even without a trustkey promise
    pub implicit_trust: bool,
    /// Name announced during identification
    pub fqname: String,
    /// Cap on private background connections
    pub background_cap: usize,
}

#[derive(Debug)]
enum SlotState {
    /// The server could not be contacted this run
    Offline,
    Idle(Box<AgentConnection>),
    Busy,
}

#[derive(Debug)]
struct ServerEntry {
    server_ip: String,
    state: SlotState,
}

/// Keyed cache of authenticated server connections
#[derive(Debug, Default)]
pub struct ConnectionPool {
    entries: Arc<Mutex<Vec<ServerEntry>>>,
}

/// Exclusive use of one connection. Dropping the lease returns a cached
/// connection to the idle state; [`ConnectionLease::destroy`] disconnects
/// and removes it instead.
#[derive(Debug)]
pub struct ConnectionLease {
    entries: Arc<Mutex<Vec<ServerEntry>>>,
    /// None for private (background) connections
    server_ip: Option<String>,
    conn: Option<Box<AgentConnection>>,
}

impl Deref for ConnectionLease {
    type Target = AgentConnection;

    fn deref(&self) -> &AgentConnection {
        self.conn.as_ref().expect("lease holds a connection")
    }
}

impl DerefMut for ConnectionLease {
    fn deref_mut(&mut self) -> &mut AgentConnection {
        self.conn.as_mut().expect("lease holds a connection")
    }
}

impl ConnectionLease {
    /// Disconnects and removes the cache entry; for connections latched
    /// into the error state
    pub fn destroy(mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.disconnect();
        }
        if let Some(ip) = self.server_ip.take() {
            let mut entries = self.entries.lock();
            entries.retain(|e| e.server_ip != ip);
            debug!(server = ip.as_str(), "connection destroyed and uncached");
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let Some(ip) = self.server_ip.take() else {
            return;
        };
        let mut entries = self.entries.lock();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.server_ip == ip && matches!(e.state, SlotState::Busy))
        {
            debug!(server = ip.as_str(), "connection released to pool");
            entry.state = SlotState::Idle(conn);
        }
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks the promise's server list and returns a usable connection:
    /// an idle cached one, or a freshly authenticated one. Unreachable
    /// servers are marked offline and skipped for the rest of the run.
    /// Returns `None` when every candidate is exhausted.
    pub fn open_for(
        &self,
        ctx: &ClientContext,
        servers: &[String],
        attrs: &CopyAttributes,
        background: bool,
    ) -> ClientResult<Option<ConnectionLease>> {
        for server in servers {
            if server == "localhost" {
                continue;
            }
            let opts = effective_options(ctx, attrs);
            let ip = server_ip_key(server, opts.port, opts.force_ipv4);

            if self.is_offline(&ip) {
                debug!(server = server.as_str(), "server marked offline, skipping");
                continue;
            }

            if background {
                if self.entries.lock().len() >= ctx.background_cap {
                    debug!(
                        server = server.as_str(),
                        cap = ctx.background_cap,
                        "background connection cap reached, skipping"
                    );
                    continue;
                }
                match connect_and_authenticate(ctx, server, attrs, &opts) {
                    Ok(conn) => {
                        return Ok(Some(ConnectionLease {
                            entries: self.entries.clone(),
                            server_ip: None,
                            conn: Some(conn),
                        }));
                    }
                    Err(e) => {
                        info!(server = server.as_str(), error = %e, "unable to establish connection");
                        self.mark_offline(&ip);
                        continue;
                    }
                }
            }

            if let Some(lease) = self.get_idle(&ip) {
                debug!(server = server.as_str(), "reusing idle connection");
                return Ok(Some(lease));
            }

            match connect_and_authenticate(ctx, server, attrs, &opts) {
                Ok(conn) => {
                    let mut entries = self.entries.lock();
                    entries.push(ServerEntry {
                        server_ip: ip.clone(),
                        state: SlotState::Busy,
                    });
                    return Ok(Some(ConnectionLease {
                        entries: self.entries.clone(),
                        server_ip: Some(ip),
                        conn: Some(conn),
                    }));
                }
                Err(e) => {
                    info!(server = server.as_str(), error = %e, "unable to establish connection");
                    self.mark_offline(&ip);
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// The cached idle connection for a server, marking it busy. A busy
    /// connection is never handed out twice.
    fn get_idle(&self, server_ip: &str) -> Option<ConnectionLease> {
        let mut entries = self.entries.lock();
        let entry = entries.iter_mut().find(|e| e.server_ip == server_ip)?;
        match std::mem::replace(&mut entry.state, SlotState::Busy) {
            SlotState::Idle(conn) => Some(ConnectionLease {
                entries: self.entries.clone(),
                server_ip: Some(server_ip.to_string()),
                conn: Some(conn),
            }),
            other => {
                // Not idle after all; put the state back
                entry.state = other;
                None
            }
        }
    }

    /// Marks a server unreachable for the rest of the run. Idempotent.
    pub fn mark_offline(&self, server_ip: &str) {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.server_ip == server_ip) {
            Some(entry) => {
                if let SlotState::Idle(mut conn) =
                    std::mem::replace(&mut entry.state, SlotState::Offline)
                {
                    conn.disconnect();
                }
            }
            None => entries.push(ServerEntry {
                server_ip: server_ip.to_string(),
                state: SlotState::Offline,
            }),
        }
        warn!(server = server_ip, "server marked offline for this run");
    }

    /// Whether a server was marked unreachable
    pub fn is_offline(&self, server_ip: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.server_ip == server_ip && matches!(e.state, SlotState::Offline))
    }

    /// Number of cache entries, offline sentinels included
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Disconnects and frees everything
    pub fn cleanup_all(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            if let SlotState::Idle(mut conn) =
                std::mem::replace(&mut entry.state, SlotState::Offline)
            {
                conn.disconnect();
            }
        }
        entries.clear();
    }
}

fn effective_options(ctx: &ClientContext, attrs: &CopyAttributes) -> ConnectOptions {
    let mut opts = ctx.connect.clone();
    if let Some(port) = attrs.port {
        opts.port = port;
    }
    if let Some(timeout) = attrs.timeout {
        opts.connect_timeout = timeout;
        opts.recv_timeout = timeout;
    }
    opts.force_ipv4 = opts.force_ipv4 || attrs.force_ipv4;
    opts
}

fn connect_and_authenticate(
    ctx: &ClientContext,
    server: &str,
    attrs: &CopyAttributes,
    opts: &ConnectOptions,
) -> ClientResult<Box<AgentConnection>> {
    let mut conn = Box::new(AgentConnection::connect(server, opts)?);
    let auth_opts = AuthOptions {
        fips_mode: ctx.fips_mode,
        trust_key: attrs.trustkey || ctx.implicit_trust,
        fqname: ctx.fqname.clone(),
    };
    auth::identify_agent(&mut conn, &auth_opts)?;
    auth::authenticate_agent(&mut conn, &ctx.keys, &ctx.keystore, &auth_opts)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_marking_is_idempotent() {
        let pool = ConnectionPool::new();
        assert!(!pool.is_offline("10.1.2.3"));
        pool.mark_offline("10.1.2.3");
        pool.mark_offline("10.1.2.3");
        assert!(pool.is_offline("10.1.2.3"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_cleanup_empties_pool() {
        let pool = ConnectionPool::new();
        pool.mark_offline("10.1.2.3");
        pool.cleanup_all();
        assert!(pool.is_empty());
    }
}
