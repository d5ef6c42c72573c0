//! Identification and the RSA challenge-response dialogue.
//!
//! The numbered propositions follow the established dialogue: the client
//! sends its identity (`CAUTH`), a nonce challenge (`SAUTH`, encrypted
//! under the server's cached key when one exists), and its own public
//! numbers; the server proves knowledge of the nonce by returning its
//! digest, counter-challenges the client, hands over its public numbers
//! when unknown, and finally receives the session key.
//!
//! The expected nonce digest is computed with both MD5 and the default
//! digest and either is accepted; legacy servers predate the FIPS digest.

use crate::connection::AgentConnection;
use crate::error::{ClientError, ClientResult};
use crate::keys::{self, KeyPair, KeyStore};
use crate::session;
use crate::transaction::{bad_reply, Control};
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Bytes of the random challenge nonce
pub const NONCE_LEN: usize = 16;

/// Offset of the binary challenge within the `SAUTH` proposition
pub const RSA_PROTO_OFFSET: usize = 24;

/// Policy knobs of one authentication attempt
#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Use the FIPS-approved digest when answering the counter-challenge
    pub fips_mode: bool,
    /// Accept and persist an unknown server key (trust on first use)
    pub trust_key: bool,
    /// Fully-qualified name announced in `CAUTH`
    pub fqname: String,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            fips_mode: false,
            trust_key: false,
            fqname: "localhost.localdomain".to_string(),
        }
    }
}

/// Proposition C0: announce who we are
pub fn identify_agent(conn: &mut AgentConnection, opts: &AuthOptions) -> ClientResult<()> {
    let hello = format!(
        "CAUTH {} {} {} 0",
        conn.local_ip, opts.fqname, conn.username
    );
    debug!(sent = hello.as_str(), "identifying agent");
    conn.send(hello.as_bytes(), Control::Done)
}

/// Propositions C1..C5 / S1..S5: mutual authentication and session-key
/// negotiation. On success the connection carries a session key and is
/// marked authenticated.
pub fn authenticate_agent(
    conn: &mut AgentConnection,
    keys: &KeyPair,
    store: &KeyStore,
    opts: &AuthOptions,
) -> ClientResult<()> {
    let server = conn.server_name.clone();

    // The challenge travels (and is digested) in its MPI encoding
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let nonce_mpi = session::mpi_encode(&nonce);

    let expected_md5: Vec<u8> = Md5::digest(&nonce_mpi).to_vec();
    let expected_sha: Vec<u8> = Sha256::digest(&nonce_mpi).to_vec();

    let cached_server_key = store.public_key_for(&conn.remote_ip);
    let have_key = cached_server_key.is_some();

    let challenge = match &cached_server_key {
        Some(key) => keys::public_encrypt(key, &nonce_mpi)?,
        None => nonce_mpi.clone(),
    };

    /* proposition C1 - the challenge nonce */
    let header = format!(
        "SAUTH {} {} {} {}",
        if have_key { 'y' } else { 'n' },
        challenge.len(),
        nonce_mpi.len(),
        conn.cipher.wire_id()
    );
    let mut proposition = header.into_bytes();
    proposition.resize(RSA_PROTO_OFFSET, 0);
    proposition.extend_from_slice(&challenge);
    conn.send(&proposition, Control::Done)?;

    /* propositions C2 and C3 - our public numbers */
    conn.send(&keys.modulus_mpi(), Control::Done)?;
    conn.send(&keys.exponent_mpi(), Control::Done)?;

    /* proposition S1 - acknowledgement of the key */
    let ack = conn.recv_payload()?;
    if bad_reply(&ack) {
        return Err(ClientError::AuthenticationFailed {
            server,
            reason: String::from_utf8_lossy(&ack).to_string(),
        });
    }

    /* proposition S2 - the server's digest of our nonce */
    let nonce_digest = conn.recv_payload()?;
    let digest_matches =
        nonce_digest == expected_sha || nonce_digest == expected_md5;
    if !digest_matches {
        return Err(ClientError::AuthenticationFailed {
            server,
            reason: "challenge response was incorrect".to_string(),
        });
    }
    if have_key {
        info!(server = server.as_str(), "strong authentication of server confirmed");
    } else if opts.trust_key {
        info!(
            server = server.as_str(),
            ip = conn.remote_ip.as_str(),
            "trusting server identity, promise to accept key"
        );
    } else {
        return Err(ClientError::AuthenticationFailed {
            server,
            reason: "not authorized to trust the server's public key (trustkey is off)"
                .to_string(),
        });
    }

    /* proposition S3 - counter challenge under our public key */
    let counter = conn.recv_payload()?;
    if counter.is_empty() {
        return Err(ClientError::AuthenticationFailed {
            server,
            reason: "counter challenge had illegal cipher length".to_string(),
        });
    }
    let decrypted = keys.decrypt(&counter)?;

    /* proposition C4 - digest of the counter challenge */
    let reply: Vec<u8> = if opts.fips_mode {
        Sha256::digest(&decrypted).to_vec()
    } else {
        Md5::digest(&decrypted).to_vec()
    };
    conn.send(&reply, Control::Done)?;

    /* propositions S4 and S5 - the server's numbers, when we had none */
    let server_key = match cached_server_key {
        Some(key) => key,
        None => {
            let modulus = session::mpi_decode(&conn.recv_payload()?)?;
            let exponent = session::mpi_decode(&conn.recv_payload()?)?;
            let key = keys::build_public_key(&modulus, &exponent)?;
            warn!(
                server = server.as_str(),
                ip = conn.remote_ip.as_str(),
                identity = keys::key_digest(&key).as_str(),
                "accepting server key on first use"
            );
            store.save(&conn.remote_ip, &key)?;
            key
        }
    };

    /* proposition C5 - the session key, under the server's key */
    let session_key = conn.cipher.generate_session_key();
    let wrapped = keys::public_encrypt(&server_key, &session_key)?;
    conn.send(&wrapped, Control::Done)?;

    conn.session_key = Some(session_key);
    conn.authenticated = true;
    debug!(server = conn.server_name.as_str(), "authentication complete");
    Ok(())
}
