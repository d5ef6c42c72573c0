//! Session ciphers and protocol number encoding.
//!
//! After the handshake, selected verbs encrypt their payload under the
//! negotiated symmetric session key. The stream uses AES-256-CBC with
//! PKCS#7 padding and a fixed initialisation vector; the IV is part of
//! the wire contract with existing servers and is knowingly weak (every
//! block stream reuses it), kept for bug-compatible behaviour.
//!
//! RSA public numbers travel in the MPI form: a 4-byte big-endian length,
//! then the big-endian magnitude, with a leading zero guard byte when the
//! top bit is set.

use crate::error::{ClientError, ClientResult};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Fixed IV of the session stream; external contract, do not change
pub const STREAM_IV: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8];

/// Symmetric cipher selected for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherKind {
    #[default]
    Aes256Cbc,
}

impl CipherKind {
    /// One-character cipher id carried in the `SAUTH` proposition
    pub fn wire_id(self) -> char {
        match self {
            CipherKind::Aes256Cbc => 'c',
        }
    }

    /// Parses the wire id
    pub fn from_wire_id(id: char) -> ClientResult<Self> {
        match id {
            'c' => Ok(CipherKind::Aes256Cbc),
            other => Err(ClientError::crypto(format!("unknown cipher id '{}'", other))),
        }
    }

    /// Length of a session key for this cipher, in bytes
    pub fn session_key_len(self) -> usize {
        match self {
            CipherKind::Aes256Cbc => 32,
        }
    }

    /// Generates a fresh random session key of the right length
    pub fn generate_session_key(self) -> Vec<u8> {
        let mut key = vec![0u8; self.session_key_len()];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }
}

/// Encrypts a verb payload under the session key
pub fn encrypt_string(kind: CipherKind, key: &[u8], plain: &[u8]) -> ClientResult<Vec<u8>> {
    match kind {
        CipherKind::Aes256Cbc => {
            let cipher = Aes256CbcEnc::new_from_slices(key, &STREAM_IV)
                .map_err(|e| ClientError::crypto(format!("bad key/iv length: {}", e)))?;
            Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plain))
        }
    }
}

/// Decrypts a verb payload or stream block under the session key
pub fn decrypt_string(kind: CipherKind, key: &[u8], cipher_text: &[u8]) -> ClientResult<Vec<u8>> {
    match kind {
        CipherKind::Aes256Cbc => {
            let cipher = Aes256CbcDec::new_from_slices(key, &STREAM_IV)
                .map_err(|e| ClientError::crypto(format!("bad key/iv length: {}", e)))?;
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(cipher_text)
                .map_err(|_| ClientError::crypto("decryption failed".to_string()))
        }
    }
}

/// Encodes a big-endian magnitude in MPI form
pub fn mpi_encode(magnitude: &[u8]) -> Vec<u8> {
    let trimmed: &[u8] = {
        let start = magnitude
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(magnitude.len());
        &magnitude[start..]
    };
    let guard = !trimmed.is_empty() && trimmed[0] & 0x80 != 0;
    let body_len = trimmed.len() + usize::from(guard);

    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    if guard {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Decodes an MPI buffer back to its big-endian magnitude
pub fn mpi_decode(buf: &[u8]) -> ClientResult<Vec<u8>> {
    if buf.len() < 4 {
        return Err(ClientError::protocol("MPI shorter than its length prefix"));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() != 4 + len {
        return Err(ClientError::protocol(format!(
            "MPI length {} does not match payload {}",
            len,
            buf.len() - 4
        )));
    }
    let mut body = &buf[4..];
    while body.first() == Some(&0) {
        body = &body[1..];
    }
    Ok(body.to_vec())
}
