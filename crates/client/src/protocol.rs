//! The verb layer: STAT, OPENDIR, GET, and hash comparison.
//!
//! Verbs are uppercase tokens with space-separated arguments. The
//! encrypted form of a verb prepends `S` to its name, carries the cipher
//! length in the header, and places the cipher text at a fixed binary
//! offset. Replies use `OK:`/`BAD:` markers; file content streams either
//! raw (GET) or as a sequence of separately encrypted frames (SGET).

use crate::connection::AgentConnection;
use crate::error::{ClientError, ClientResult};
use crate::session::{decrypt_string, encrypt_string};
use crate::sparse::SparseWriter;
use crate::statcache::StatCache;
use crate::transaction::{bad_reply, changed_marker, ok_reply, Control, FAILED_REPLY};
use md5::Md5;
use sha2::Digest;
use std::path::Path;
use tracing::{debug, error, warn};

/// Binary payload offset of an encrypted verb message
pub const PROTO_OFFSET: usize = 16;

/// Gap between a verb string and appended digest bytes
pub const SMALL_OFFSET: usize = 2;

/// Offset at which cleartext in-band error replies begin in a stream frame
pub const INBAND_OFFSET: usize = 8;

/// Sentinel terminating a directory listing
pub const DIR_TERMINATOR: &str = "---cfXen/gine/cfXen/gine---";

/// Reply meaning "the digests differ"
pub const TRUE_REPLY: &[u8] = b"CFD_TRUE";

/// Reply meaning "the digests match"
pub const FALSE_REPLY: &[u8] = b"CFD_FALSE";

/// Default streaming block size of the GET verbs
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

/// File type field of a STAT reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileType {
    Regular,
    Link,
    Dir,
    Fifo,
    Block,
    Char,
    Socket,
}

impl RemoteFileType {
    /// The single-digit wire value
    pub fn wire_value(self) -> i64 {
        match self {
            RemoteFileType::Regular => 0,
            RemoteFileType::Link => 1,
            RemoteFileType::Dir => 2,
            RemoteFileType::Fifo => 3,
            RemoteFileType::Block => 4,
            RemoteFileType::Char => 5,
            RemoteFileType::Socket => 6,
        }
    }

    fn from_wire(value: i64) -> ClientResult<Self> {
        Ok(match value {
            0 => RemoteFileType::Regular,
            1 => RemoteFileType::Link,
            2 => RemoteFileType::Dir,
            3 => RemoteFileType::Fifo,
            4 => RemoteFileType::Block,
            5 => RemoteFileType::Char,
            6 => RemoteFileType::Socket,
            other => {
                return Err(ClientError::protocol(format!(
                    "unknown file type {} in STAT reply",
                    other
                )))
            }
        })
    }

    fn mode_bits(self) -> u32 {
        match self {
            RemoteFileType::Regular => libc::S_IFREG,
            RemoteFileType::Link => libc::S_IFLNK,
            RemoteFileType::Dir => libc::S_IFDIR,
            RemoteFileType::Fifo => libc::S_IFIFO,
            RemoteFileType::Block => libc::S_IFBLK,
            RemoteFileType::Char => libc::S_IFCHR,
            RemoteFileType::Socket => libc::S_IFSOCK,
        }
    }
}

/// Which stat the caller wants: the file itself or the link over it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatType {
    File,
    Link,
}

/// The thirteen fields of a STAT reply plus the readlink target
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStat {
    pub file_type: RemoteFileType,
    /// Permission bits as sent; type bits are promoted on synthesis
    pub mode: u32,
    /// Link-over-file mode; zero when the path is not a symlink
    pub lmode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// Server advises preserving holes during transfer
    pub makeholes: bool,
    pub ino: u64,
    pub nlink: u64,
    pub dev: u64,
    pub readlink: Option<String>,
}

impl RemoteStat {
    /// The stat a caller sees, honouring the requested stat type: a
    /// `link` request with a non-zero link mode reports the link itself
    pub fn synthesize(&self, stat_type: StatType) -> SyntheticStat {
        let mode = if stat_type == StatType::Link && self.lmode != 0 {
            self.lmode | libc::S_IFLNK
        } else {
            self.mode | self.file_type.mode_bits()
        };
        SyntheticStat {
            mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            ino: self.ino,
            nlink: self.nlink,
            dev: self.dev,
            makeholes: self.makeholes,
            file_type: self.file_type,
        }
    }
}

/// A host-shaped stat assembled from a STAT reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub ino: u64,
    pub nlink: u64,
    pub dev: u64,
    pub makeholes: bool,
    pub file_type: RemoteFileType,
}

/// Builds the encrypted form of a verb: `S<verb> <cipherlen>` header
/// padded to the binary offset, then the cipher text
fn encrypted_message(
    conn: &AgentConnection,
    verb: &str,
    plain: &[u8],
) -> ClientResult<Vec<u8>> {
    let key = conn
        .session_key
        .as_deref()
        .ok_or_else(|| ClientError::crypto("cannot do encrypted copy without keys"))?;
    // The NUL terminator travels with the plaintext
    let mut terminated = plain.to_vec();
    terminated.push(0);
    let cipher = encrypt_string(conn.cipher, key, &terminated)?;
    let mut message = format!("{} {}", verb, cipher.len()).into_bytes();
    message.resize(PROTO_OFFSET, 0);
    message.extend_from_slice(&cipher);
    Ok(message)
}

/// Remote stat with per-promise memoisation. A reply the server refused
/// is cached as a failure; repeat stats of the same `(server, path)` are
/// answered locally.
pub fn remote_stat(
    conn: &mut AgentConnection,
    cache: &mut StatCache,
    path: &str,
    stat_type: StatType,
    encrypt: bool,
    now: i64,
) -> ClientResult<SyntheticStat> {
    let server = conn.server_name.clone();

    if let Some(cached) = cache.lookup(&server, path) {
        if cached.failed {
            debug!(server = server.as_str(), path, "cached failure to stat");
            return Err(ClientError::StatFailed {
                server,
                path: path.to_string(),
                reason: "cached failure (permission denied)".to_string(),
            });
        }
        let stat = cached.stat.as_ref().expect("non-failed entries carry a stat");
        debug!(server = server.as_str(), path, "stat found in cache");
        return Ok(stat.synthesize(stat_type));
    }

    let request = format!("SYNCH {} STAT {}", now, path);
    if encrypt {
        let message = encrypted_message(conn, "SSYNCH", request.as_bytes())?;
        conn.send(&message, Control::Done)?;
    } else {
        conn.send(request.as_bytes(), Control::Done)?;
    }

    let reply = conn.recv_payload()?;
    let unsynchronized: &[u8] = b"unsynchronized";
    if reply
        .windows(unsynchronized.len())
        .any(|w| w == unsynchronized)
    {
        return Err(ClientError::Unsynchronized {
            reason: String::from_utf8_lossy(&reply).to_string(),
        });
    }
    if bad_reply(&reply) {
        warn!(
            server = server.as_str(),
            path,
            reply = %String::from_utf8_lossy(&reply),
            "server refused stat"
        );
        cache.insert_failure(&server, path);
        return Err(ClientError::StatFailed {
            server,
            path: path.to_string(),
            reason: String::from_utf8_lossy(&reply).to_string(),
        });
    }
    if !ok_reply(&reply) {
        return Err(ClientError::protocol(format!(
            "unexpected STAT reply: {}",
            String::from_utf8_lossy(&reply)
        )));
    }

    let text = String::from_utf8_lossy(&reply);
    let fields: Vec<i64> = text.as_ref()["OK:".len()..]
        .split_whitespace()
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 13 {
        error!(
            server = server.as_str(),
            parsed = fields.len(),
            "cannot read STAT reply: only {}/13 items parsed",
            fields.len()
        );
        return Err(ClientError::protocol("short STAT reply".to_string()));
    }

    // A second frame carries the readlink target, possibly empty
    let link_reply = conn.recv_payload()?;
    let readlink = if link_reply.len() > 3 {
        Some(String::from_utf8_lossy(&link_reply[3..]).to_string())
    } else {
        None
    };

    let stat = RemoteStat {
        file_type: RemoteFileType::from_wire(fields[0])?,
        mode: fields[1] as u32,
        lmode: fields[2] as u32,
        uid: fields[3] as u32,
        gid: fields[4] as u32,
        size: fields[5] as u64,
        atime: fields[6],
        mtime: fields[7],
        ctime: fields[8],
        makeholes: fields[9] != 0,
        ino: fields[10] as u64,
        nlink: fields[11] as u64,
        dev: fields[12] as u64,
        readlink,
    };
    let synthetic = stat.synthesize(stat_type);
    cache.insert(&server, path, stat);
    Ok(synthetic)
}

/// Reads a remote directory: a series of frames of NUL-packed names,
/// terminated by the sentinel name
pub fn open_dir(
    conn: &mut AgentConnection,
    path: &str,
    encrypt: bool,
) -> ClientResult<Vec<String>> {
    let request = format!("OPENDIR {}", path);
    if encrypt {
        let message = encrypted_message(conn, "SOPENDIR", request.as_bytes())?;
        conn.send(&message, Control::Done)?;
    } else {
        conn.send(request.as_bytes(), Control::Done)?;
    }

    let mut names = Vec::new();
    loop {
        let (payload, _) = conn.recv()?;
        if payload.is_empty() {
            return Ok(names);
        }
        let cleartext;
        let data: &[u8] = if encrypt {
            let key = conn
                .session_key
                .as_deref()
                .ok_or_else(|| ClientError::crypto("no session key for SOPENDIR"))?;
            cleartext = decrypt_string(conn.cipher, key, &payload)?;
            &cleartext
        } else {
            &payload
        };

        if data.starts_with(FAILED_REPLY) {
            return Err(ClientError::AccessDenied {
                server: conn.server_name.clone(),
                path: path.to_string(),
            });
        }
        if bad_reply(data) {
            return Err(ClientError::protocol(
                String::from_utf8_lossy(data).to_string(),
            ));
        }

        for chunk in data.split(|&b| b == 0) {
            if chunk.is_empty() {
                continue;
            }
            if chunk == DIR_TERMINATOR.as_bytes() {
                return Ok(names);
            }
            names.push(String::from_utf8_lossy(chunk).to_string());
        }
    }
}

/// Asks the server to compare its digest of `remote_path` against our
/// digest of `local_path`. Returns true when they differ (a copy is
/// needed).
pub fn compare_hash(
    conn: &mut AgentConnection,
    remote_path: &str,
    local_path: &Path,
    encrypt: bool,
) -> ClientResult<bool> {
    let digest = local_file_md5(local_path);

    let mut plain = format!("MD5 {}", remote_path).into_bytes();
    plain.extend_from_slice(&[0u8; SMALL_OFFSET]);
    plain.extend_from_slice(&digest);

    if encrypt {
        let key = conn
            .session_key
            .as_deref()
            .ok_or_else(|| ClientError::crypto("no session key for SMD5"))?;
        let cipher = encrypt_string(conn.cipher, key, &plain)?;
        let mut message = format!("SMD5 {}", cipher.len()).into_bytes();
        message.resize(PROTO_OFFSET, 0);
        message.extend_from_slice(&cipher);
        conn.send(&message, Control::Done)?;
    } else {
        conn.send(&plain, Control::Done)?;
    }

    let reply = conn.recv_payload()?;
    if reply.starts_with(TRUE_REPLY) {
        debug!(remote_path, "hash mismatch, copy needed");
        Ok(true)
    } else if reply.starts_with(FALSE_REPLY) {
        debug!(remote_path, "hash matched");
        Ok(false)
    } else {
        Err(ClientError::protocol(format!(
            "unexpected hash reply: {}",
            String::from_utf8_lossy(&reply)
        )))
    }
}

/// MD5 of a local file, the all-zero digest when it cannot be read
pub fn local_file_md5(path: &Path) -> [u8; 16] {
    match std::fs::read(path) {
        Ok(content) => Md5::digest(&content).into(),
        Err(_) => [0u8; 16],
    }
}

/// Streams a plaintext GET into the writer. The server announces nothing:
/// content arrives raw, `size` bytes in blocks of at most `blocksize`.
pub fn get_file(
    conn: &mut AgentConnection,
    source: &str,
    size: u64,
    writer: &mut SparseWriter,
    blocksize: usize,
) -> ClientResult<()> {
    let request = format!("GET {} {}", blocksize, source);
    conn.send(request.as_bytes(), Control::Done)?;

    let changed = changed_marker();
    let mut buf = vec![0u8; blocksize];
    let mut n_total: u64 = 0;

    while n_total < size {
        let toget = (size - n_total).min(blocksize as u64) as usize;
        if conn.read_exact_raw(&mut buf[..toget]).is_err() {
            // The file may have shrunk since the size was announced
            return Err(ClientError::SourceChanged {
                server: conn.server_name.clone(),
                path: source.to_string(),
            });
        }

        if n_total == 0 && buf[..toget].starts_with(FAILED_REPLY) {
            return Err(ClientError::AccessDenied {
                server: conn.server_name.clone(),
                path: source.to_string(),
            });
        }
        if buf[..toget].starts_with(&changed) {
            return Err(ClientError::SourceChanged {
                server: conn.server_name.clone(),
                path: source.to_string(),
            });
        }

        if let Err(e) = writer.write_block(&buf[..toget]) {
            conn.flush_stream(size - n_total - toget as u64);
            return Err(e);
        }
        n_total += toget as u64;
    }
    Ok(())
}

/// Streams an encrypted SGET: each frame is a separately encrypted block,
/// the final frame carries the DONE control
pub fn get_file_encrypted(
    conn: &mut AgentConnection,
    source: &str,
    size: u64,
    writer: &mut SparseWriter,
    blocksize: usize,
) -> ClientResult<()> {
    if size == 0 {
        // No sense in requesting an empty file
        return Ok(());
    }
    let key = conn
        .session_key
        .clone()
        .ok_or_else(|| ClientError::crypto("cannot do encrypted copy without keys"))?;

    let mut plain = format!("GET dummykey {}", source).into_bytes();
    plain.push(0);
    let cipher = encrypt_string(conn.cipher, &key, &plain)?;
    let mut message = format!("SGET {:4} {:4}", cipher.len(), blocksize).into_bytes();
    message.resize(PROTO_OFFSET, 0);
    message.extend_from_slice(&cipher);
    conn.send(&message, Control::Done)?;

    let changed = changed_marker();
    let mut n_total: u64 = 0;
    loop {
        let (payload, control) = conn.recv()?;

        // Refusals arrive in clear behind the in-band header
        let inband = payload.get(INBAND_OFFSET..).unwrap_or(&[]);
        if n_total == 0 && (payload.starts_with(FAILED_REPLY) || inband.starts_with(FAILED_REPLY))
        {
            return Err(ClientError::AccessDenied {
                server: conn.server_name.clone(),
                path: source.to_string(),
            });
        }
        if payload.starts_with(&changed) || inband.starts_with(&changed) {
            return Err(ClientError::SourceChanged {
                server: conn.server_name.clone(),
                path: source.to_string(),
            });
        }

        let block = decrypt_string(conn.cipher, &key, &payload)?;
        writer.write_block(&block)?;
        n_total += block.len() as u64;

        if control == Control::Done {
            break;
        }
    }
    Ok(())
}
