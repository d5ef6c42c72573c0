//! Server connections.
//!
//! A connection resolves the server (IPv6 preferred unless policy forces
//! IPv4), optionally binds a named local interface, connects with a
//! timeout, then runs in blocking mode with a receive timeout. Any framing
//! or I/O error latches the connection into the error state; later verbs
//! short-circuit and the caller destroys the connection.
//!
//! Cancellation is cooperative: each connection carries a flag its worker
//! may set, polled between frames.

use crate::error::{ClientError, ClientResult};
use crate::session::CipherKind;
use crate::transaction::{self, Control};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Address resolution is serialised: resolver state is not thread-safe on
/// every supported platform
static GETADDR_MU: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Connection parameters, from configuration and the copy attributes
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u16,
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
    /// Local address to bind before connecting, when set
    pub bind_interface: Option<String>,
    pub force_ipv4: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: converge_core::constants::DEFAULT_PORT,
            connect_timeout: Duration::from_secs(30),
            recv_timeout: Duration::from_secs(30),
            bind_interface: None,
            force_ipv4: false,
        }
    }
}

/// Resolves a server name to candidate addresses under the resolver lock,
/// IPv6-preferred unless IPv4 is forced
pub fn resolve_server(host: &str, port: u16, force_ipv4: bool) -> ClientResult<Vec<SocketAddr>> {
    let _guard = GETADDR_MU.lock();
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ClientError::DnsResolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    let mut candidates: Vec<SocketAddr> = if force_ipv4 {
        addrs.filter(|a| a.is_ipv4()).collect()
    } else {
        let mut all: Vec<SocketAddr> = addrs.collect();
        all.sort_by_key(|a| a.is_ipv4());
        all
    };
    if candidates.is_empty() {
        return Err(ClientError::DnsResolution {
            host: host.to_string(),
            reason: "no usable addresses".to_string(),
        });
    }
    candidates.dedup();
    Ok(candidates)
}

/// The canonical cache key for a server: its first resolved address, or
/// the name itself when resolution fails
pub fn server_ip_key(host: &str, port: u16, force_ipv4: bool) -> String {
    match resolve_server(host, port, force_ipv4) {
        Ok(addrs) => addrs[0].ip().to_string(),
        Err(_) => host.to_string(),
    }
}

/// One authenticated (or in-authentication) server connection
#[derive(Debug)]
pub struct AgentConnection {
    /// Resolved address of the peer
    pub remote_ip: String,
    /// Name the policy referred to the server by
    pub server_name: String,
    /// Our side of the socket, as the peer saw it
    pub local_ip: String,
    /// Local account name sent during identification
    pub username: String,
    /// Negotiated session key, once the handshake finished
    pub session_key: Option<Vec<u8>>,
    /// Session cipher
    pub cipher: CipherKind,
    /// Whether the challenge dialogue completed
    pub authenticated: bool,
    /// Latched on any framing or I/O error
    pub error: bool,
    stream: Option<TcpStream>,
    cancel: Arc<AtomicBool>,
}

impl AgentConnection {
    /// Connects a TCP stream to the first reachable candidate address
    pub fn connect(server: &str, opts: &ConnectOptions) -> ClientResult<Self> {
        let candidates = resolve_server(server, opts.port, opts.force_ipv4)?;

        let bind_addr = match &opts.bind_interface {
            Some(interface) => Some(resolve_bind_address(interface)?),
            None => None,
        };

        let mut last_error = None;
        for addr in candidates {
            debug!(server, address = %addr, "connecting");
            match try_connect(&addr, bind_addr, opts) {
                Ok(stream) => {
                    let local_ip = stream
                        .local_addr()
                        .map(|a| a.ip().to_string())
                        .unwrap_or_default();
                    info!(server, address = %addr, "connected");
                    return Ok(Self {
                        remote_ip: addr.ip().to_string(),
                        server_name: server.to_string(),
                        local_ip,
                        username: current_username(),
                        session_key: None,
                        cipher: CipherKind::default(),
                        authenticated: false,
                        error: false,
                        stream: Some(stream),
                        cancel: Arc::new(AtomicBool::new(false)),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ClientError::connection_failed(server, "no candidate address connected")
        }))
    }

    /// The flag a worker sets to abort this connection's current operation
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Whether the socket is still open
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Closes the socket. Idempotent.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(server = self.server_name.as_str(), "closing connection");
        }
        self.authenticated = false;
    }

    fn check_usable(&self) -> ClientResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(ClientError::Interrupted);
        }
        if self.error || self.stream.is_none() {
            return Err(ClientError::ConnectionUnusable {
                server: self.server_name.clone(),
            });
        }
        Ok(())
    }

    /// Sends one framed transaction, latching the error state on failure
    pub fn send(&mut self, payload: &[u8], control: Control) -> ClientResult<()> {
        self.check_usable()?;
        let stream = self.stream.as_mut().expect("checked above");
        transaction::send_transaction(stream, payload, control).map_err(|e| {
            self.error = true;
            e
        })
    }

    /// Receives one framed transaction, latching the error state on failure
    pub fn recv(&mut self) -> ClientResult<(Vec<u8>, Control)> {
        self.check_usable()?;
        let stream = self.stream.as_mut().expect("checked above");
        transaction::receive_transaction(stream).map_err(|e| {
            self.error = true;
            e
        })
    }

    /// Receives one frame, discarding the control flag
    pub fn recv_payload(&mut self) -> ClientResult<Vec<u8>> {
        self.recv().map(|(payload, _)| payload)
    }

    /// Reads exactly `buf.len()` raw bytes off the stream (the plaintext
    /// GET verb streams file content outside transaction framing)
    pub fn read_exact_raw(&mut self, buf: &mut [u8]) -> ClientResult<()> {
        self.check_usable()?;
        let stream = self.stream.as_mut().expect("checked above");
        stream.read_exact(buf).map_err(|e| {
            self.error = true;
            e.into()
        })
    }

    /// Drains and discards `count` raw bytes, so a failed local write does
    /// not leave file content in the stream
    pub fn flush_stream(&mut self, count: u64) {
        info!(bytes = count, "flushing rest of file stream");
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut remaining = count;
        let mut sink = [0u8; 4096];
        while remaining > 0 {
            let take = remaining.min(sink.len() as u64) as usize;
            match stream.read(&mut sink[..take]) {
                Ok(0) | Err(_) => break,
                Ok(n) => remaining -= n as u64,
            }
        }
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn try_connect(
    addr: &SocketAddr,
    bind_addr: Option<SocketAddr>,
    opts: &ConnectOptions,
) -> ClientResult<TcpStream> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ClientError::io("socket", &e.to_string()))?;

    if let Some(bind_addr) = bind_addr {
        if bind_addr.is_ipv4() == addr.is_ipv4() {
            socket
                .bind(&bind_addr.into())
                .map_err(|e| ClientError::io("bind", &e.to_string()))?;
        }
    }

    socket
        .connect_timeout(&(*addr).into(), opts.connect_timeout)
        .map_err(|e| ClientError::connection_failed(addr.to_string(), e.to_string()))?;

    // Back to blocking mode with a receive timeout for the dialogue
    socket
        .set_nonblocking(false)
        .map_err(|e| ClientError::io("blocking mode", &e.to_string()))?;
    socket
        .set_read_timeout(Some(opts.recv_timeout))
        .map_err(|e| ClientError::io("receive timeout", &e.to_string()))?;

    Ok(socket.into())
}

fn resolve_bind_address(interface: &str) -> ClientResult<SocketAddr> {
    let _guard = GETADDR_MU.lock();
    (interface, 0)
        .to_socket_addrs()
        .map_err(|e| ClientError::DnsResolution {
            host: interface.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ClientError::DnsResolution {
            host: interface.to_string(),
            reason: "no usable addresses".to_string(),
        })
}

fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_to_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener binds");
        let port = listener.local_addr().expect("local addr").port();

        let opts = ConnectOptions {
            port,
            ..ConnectOptions::default()
        };
        let conn = AgentConnection::connect("127.0.0.1", &opts).expect("connects");
        assert!(conn.is_open());
        assert_eq!(conn.remote_ip, "127.0.0.1");
        assert!(!conn.authenticated);
    }

    #[test]
    fn test_connect_failure_reports_server() {
        // A port from the discard range that nothing listens on
        let opts = ConnectOptions {
            port: 9,
            connect_timeout: Duration::from_millis(300),
            ..ConnectOptions::default()
        };
        assert!(AgentConnection::connect("127.0.0.1", &opts).is_err());
    }

    #[test]
    fn test_send_after_disconnect_is_unusable() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener binds");
        let port = listener.local_addr().expect("local addr").port();
        let opts = ConnectOptions {
            port,
            ..ConnectOptions::default()
        };
        let mut conn = AgentConnection::connect("127.0.0.1", &opts).expect("connects");
        conn.disconnect();
        assert!(matches!(
            conn.send(b"x", Control::Done),
            Err(ClientError::ConnectionUnusable { .. })
        ));
    }

    #[test]
    fn test_cancel_flag_interrupts() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener binds");
        let port = listener.local_addr().expect("local addr").port();
        let opts = ConnectOptions {
            port,
            ..ConnectOptions::default()
        };
        let mut conn = AgentConnection::connect("127.0.0.1", &opts).expect("connects");
        conn.cancel_flag().store(true, Ordering::Relaxed);
        assert!(matches!(
            conn.send(b"x", Control::Done),
            Err(ClientError::Interrupted)
        ));
    }

    #[test]
    fn test_resolve_prefers_ipv4_when_forced() {
        let addrs = resolve_server("localhost", 5308, true).expect("resolves");
        assert!(addrs.iter().all(SocketAddr::is_ipv4));
    }
}
