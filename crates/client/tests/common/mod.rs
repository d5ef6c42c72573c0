//! A loopback file server speaking the copy protocol, for exercising the
//! client end to end: handshake, stat, readdir, hash comparison, and both
//! transfer modes.

use converge_client::keys::{self, KeyPair};
use converge_client::protocol::{DIR_TERMINATOR, PROTO_OFFSET};
use converge_client::session::{self, CipherKind};
use converge_client::transaction::{receive_transaction, send_transaction, Control};
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One exported entry of the mock file tree
#[derive(Debug, Clone)]
pub enum MockEntry {
    File(Vec<u8>),
    Dir,
}

/// Shared observable state of the server
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub handshakes: AtomicUsize,
    pub stat_requests: AtomicUsize,
    pub get_requests: AtomicUsize,
}

pub struct MockServer {
    pub port: u16,
    pub counters: Arc<ServerCounters>,
    pub files: Arc<Mutex<HashMap<String, MockEntry>>>,
}

impl MockServer {
    /// Starts a server on an ephemeral loopback port
    pub fn start(tree: HashMap<String, MockEntry>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("mock server binds");
        let port = listener.local_addr().expect("local addr").port();
        let counters = Arc::new(ServerCounters::default());
        let files = Arc::new(Mutex::new(tree));
        let keypair = Arc::new(KeyPair::generate(1024).expect("server keypair"));

        {
            let counters = counters.clone();
            let files = files.clone();
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let counters = counters.clone();
                    let files = files.clone();
                    let keypair = keypair.clone();
                    std::thread::spawn(move || {
                        let _ = serve_connection(stream, &keypair, &counters, &files);
                    });
                }
            });
        }

        Self {
            port,
            counters,
            files,
        }
    }

    pub fn handshakes(&self) -> usize {
        self.counters.handshakes.load(Ordering::SeqCst)
    }

    pub fn stat_requests(&self) -> usize {
        self.counters.stat_requests.load(Ordering::SeqCst)
    }
}

fn serve_connection(
    mut stream: TcpStream,
    keypair: &KeyPair,
    counters: &ServerCounters,
    files: &Mutex<HashMap<String, MockEntry>>,
) -> std::io::Result<()> {
    let session_key = match handshake(&mut stream, keypair) {
        Ok(key) => key,
        Err(_) => return Ok(()),
    };
    counters.handshakes.fetch_add(1, Ordering::SeqCst);

    loop {
        let Ok((payload, _)) = receive_transaction(&mut stream) else {
            return Ok(());
        };
        // Only OPENDIR replies and SGET blocks are encrypted; STAT and
        // hash replies return in clear even on encrypted sessions
        let verb_result = if payload.starts_with(b"SSYNCH") {
            let plain = decrypt_verb(&payload, &session_key);
            counters.stat_requests.fetch_add(1, Ordering::SeqCst);
            handle_synch(&mut stream, &plain, files, None)
        } else if payload.starts_with(b"SYNCH") {
            counters.stat_requests.fetch_add(1, Ordering::SeqCst);
            handle_synch(&mut stream, &payload, files, None)
        } else if payload.starts_with(b"SOPENDIR") {
            let plain = decrypt_verb(&payload, &session_key);
            handle_opendir(&mut stream, &plain, files, Some(&session_key))
        } else if payload.starts_with(b"OPENDIR") {
            handle_opendir(&mut stream, &payload, files, None)
        } else if payload.starts_with(b"SMD5") {
            let plain = decrypt_raw_verb(&payload, &session_key);
            handle_md5(&mut stream, &plain, files, None)
        } else if payload.starts_with(b"MD5") {
            handle_md5(&mut stream, &payload, files, None)
        } else if payload.starts_with(b"SGET") {
            counters.get_requests.fetch_add(1, Ordering::SeqCst);
            handle_sget(&mut stream, &payload, files, &session_key)
        } else if payload.starts_with(b"GET") {
            counters.get_requests.fetch_add(1, Ordering::SeqCst);
            handle_get(&mut stream, &payload, files)
        } else {
            send_transaction(&mut stream, b"BAD: unknown verb", Control::Done)
                .map_err(client_to_io)
        };
        if verb_result.is_err() {
            return Ok(());
        }
    }
}

fn client_to_io(e: converge_client::ClientError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

type VerbResult = std::result::Result<(), std::io::Error>;

/// The server side of the challenge dialogue
fn handshake(stream: &mut TcpStream, keypair: &KeyPair) -> std::io::Result<Vec<u8>> {
    // C0: identification
    let (_cauth, _) = receive_transaction(stream).map_err(client_to_io)?;

    // C1: nonce challenge
    let (sauth, _) = receive_transaction(stream).map_err(client_to_io)?;
    let header: Vec<u8> = sauth
        .iter()
        .take_while(|&&b| b != 0)
        .copied()
        .collect();
    let header = String::from_utf8_lossy(&header).to_string();
    let trusted = header.split_whitespace().nth(1) == Some("y");
    let challenge = &sauth[24..];
    let nonce_mpi = if trusted {
        keypair
            .decrypt(challenge)
            .map_err(client_to_io)?
    } else {
        challenge.to_vec()
    };

    // C2/C3: the client's public numbers
    let (modulus_frame, _) = receive_transaction(stream).map_err(client_to_io)?;
    let (exponent_frame, _) = receive_transaction(stream).map_err(client_to_io)?;
    let modulus = session::mpi_decode(&modulus_frame).map_err(client_to_io)?;
    let exponent = session::mpi_decode(&exponent_frame).map_err(client_to_io)?;
    let client_key = keys::build_public_key(&modulus, &exponent).map_err(client_to_io)?;

    // S1: acknowledge the key
    send_transaction(stream, b"OK: key accepted", Control::Done).map_err(client_to_io)?;

    // S2: prove knowledge of the nonce
    let digest: Vec<u8> = Md5::digest(&nonce_mpi).to_vec();
    send_transaction(stream, &digest, Control::Done).map_err(client_to_io)?;

    // S3: counter challenge under the client's key
    let mut counter = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut counter);
    let wrapped = keys::public_encrypt(&client_key, &counter).map_err(client_to_io)?;
    send_transaction(stream, &wrapped, Control::Done).map_err(client_to_io)?;

    // C4: the client's digest of the counter challenge
    let (reply, _) = receive_transaction(stream).map_err(client_to_io)?;
    let md5_ok = reply == Md5::digest(counter).to_vec();
    let sha_ok = reply == Sha256::digest(counter).to_vec();
    if !md5_ok && !sha_ok {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "counter challenge reply incorrect",
        ));
    }

    // S4/S5: hand over our numbers when the client had none
    if !trusted {
        send_transaction(stream, &keypair.modulus_mpi(), Control::Done)
            .map_err(client_to_io)?;
        send_transaction(stream, &keypair.exponent_mpi(), Control::Done)
            .map_err(client_to_io)?;
    }

    // C5: the session key under our public key
    let (wrapped_key, _) = receive_transaction(stream).map_err(client_to_io)?;
    let session_key = keypair.decrypt(&wrapped_key).map_err(client_to_io)?;
    Ok(session_key)
}

/// Decrypts an encrypted verb whose plaintext is binary-safe (SMD5
/// carries digest bytes that may legitimately end in zeros)
fn decrypt_raw_verb(payload: &[u8], session_key: &[u8]) -> Vec<u8> {
    let cipher = &payload[PROTO_OFFSET..];
    session::decrypt_string(CipherKind::Aes256Cbc, session_key, cipher).unwrap_or_default()
}

/// Decrypts a textual verb, dropping the NUL terminator it travels with
fn decrypt_verb(payload: &[u8], session_key: &[u8]) -> Vec<u8> {
    let mut plain = decrypt_raw_verb(payload, session_key);
    while plain.last() == Some(&0) {
        plain.pop();
    }
    plain
}

fn encrypt_reply(plain: &[u8], session_key: &[u8]) -> Vec<u8> {
    session::encrypt_string(CipherKind::Aes256Cbc, session_key, plain).expect("reply encrypts")
}

fn stable_ino(path: &str) -> u64 {
    path.bytes().fold(7u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
}

fn handle_synch(
    stream: &mut TcpStream,
    request: &[u8],
    files: &Mutex<HashMap<String, MockEntry>>,
    session_key: Option<&[u8]>,
) -> VerbResult {
    // SYNCH <time> STAT <path>
    let text = String::from_utf8_lossy(request).to_string();
    let path = text
        .split(" STAT ")
        .nth(1)
        .unwrap_or_default()
        .to_string();

    let entry = files.lock().expect("file table lock").get(&path).cloned();
    match entry {
        Some(MockEntry::File(content)) => {
            let reply = format!(
                "OK: 0 420 0 0 0 {} 1000000 1000000 1000000 1 {} 1 1",
                content.len(),
                stable_ino(&path)
            );
            send_reply(stream, reply.as_bytes(), session_key)?;
            send_reply(stream, b"OK:", session_key)
        }
        Some(MockEntry::Dir) => {
            let reply = format!(
                "OK: 2 493 0 0 0 0 1000000 1000000 1000000 0 {} 1 1",
                stable_ino(&path)
            );
            send_reply(stream, reply.as_bytes(), session_key)?;
            send_reply(stream, b"OK:", session_key)
        }
        None => send_reply(stream, b"BAD: no such file", session_key),
    }
}

/// Stat and hash replies are framed; encrypted sessions encrypt the frame
fn send_reply(
    stream: &mut TcpStream,
    plain: &[u8],
    session_key: Option<&[u8]>,
) -> VerbResult {
    match session_key {
        Some(key) => {
            let cipher = encrypt_reply(plain, key);
            send_transaction(stream, &cipher, Control::Done).map_err(client_to_io)
        }
        None => send_transaction(stream, plain, Control::Done).map_err(client_to_io),
    }
}

fn handle_opendir(
    stream: &mut TcpStream,
    request: &[u8],
    files: &Mutex<HashMap<String, MockEntry>>,
    session_key: Option<&[u8]>,
) -> VerbResult {
    let text = String::from_utf8_lossy(request).to_string();
    let dir = text
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .trim_end_matches('/')
        .to_string();

    let mut packed = Vec::new();
    for name in [".", ".."] {
        packed.extend_from_slice(name.as_bytes());
        packed.push(0);
    }
    {
        let table = files.lock().expect("file table lock");
        for key in table.keys() {
            if let Some(rest) = key.strip_prefix(&format!("{}/", dir)) {
                if !rest.is_empty() && !rest.contains('/') {
                    packed.extend_from_slice(rest.as_bytes());
                    packed.push(0);
                }
            }
        }
    }
    packed.extend_from_slice(DIR_TERMINATOR.as_bytes());
    packed.push(0);

    send_reply(stream, &packed, session_key)
}

fn handle_md5(
    stream: &mut TcpStream,
    request: &[u8],
    files: &Mutex<HashMap<String, MockEntry>>,
    session_key: Option<&[u8]>,
) -> VerbResult {
    // MD5 <path>\0\0<16 digest bytes>
    let after_verb = &request[4..];
    let path_end = after_verb
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(after_verb.len());
    let path = String::from_utf8_lossy(&after_verb[..path_end]).to_string();
    let digest_start = path_end + 2;
    let client_digest = after_verb
        .get(digest_start..digest_start + 16)
        .unwrap_or(&[0u8; 16]);

    let entry = files.lock().expect("file table lock").get(&path).cloned();
    let differs = match entry {
        Some(MockEntry::File(content)) => {
            Md5::digest(&content).as_slice() != client_digest
        }
        _ => true,
    };
    let reply: &[u8] = if differs { b"CFD_TRUE" } else { b"CFD_FALSE" };
    send_reply(stream, reply, session_key)
}

fn handle_get(
    stream: &mut TcpStream,
    request: &[u8],
    files: &Mutex<HashMap<String, MockEntry>>,
) -> VerbResult {
    // GET <blocksize> <path>; content streams raw
    let text = String::from_utf8_lossy(request).to_string();
    let path = text.split_whitespace().nth(2).unwrap_or_default().to_string();
    let entry = files.lock().expect("file table lock").get(&path).cloned();
    if let Some(MockEntry::File(content)) = entry {
        stream.write_all(&content)?;
        stream.flush()?;
    }
    Ok(())
}

fn handle_sget(
    stream: &mut TcpStream,
    payload: &[u8],
    files: &Mutex<HashMap<String, MockEntry>>,
    session_key: &[u8],
) -> VerbResult {
    // SGET <cipherlen> <blocksize>, cipher text at the binary offset
    let header: Vec<u8> = payload.iter().take_while(|&&b| b != 0).copied().collect();
    let header = String::from_utf8_lossy(&header).to_string();
    let blocksize: usize = header
        .split_whitespace()
        .nth(2)
        .and_then(|f| f.parse().ok())
        .unwrap_or(2048);
    let plain = decrypt_verb(payload, session_key);
    let text = String::from_utf8_lossy(&plain).to_string();
    let path = text.split_whitespace().nth(2).unwrap_or_default().to_string();

    let entry = files.lock().expect("file table lock").get(&path).cloned();
    let Some(MockEntry::File(content)) = entry else {
        return send_transaction(stream, b"BAD: no such file", Control::Done)
            .map_err(client_to_io);
    };

    let chunks: Vec<&[u8]> = content.chunks(blocksize).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let cipher = encrypt_reply(chunk, session_key);
        let control = if i + 1 == chunks.len() {
            Control::Done
        } else {
            Control::More
        };
        send_transaction(stream, &cipher, control).map_err(client_to_io)?;
    }
    Ok(())
}
