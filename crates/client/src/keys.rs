//! The agent keypair and the per-server public-key cache.
//!
//! Each remote host's RSA public key is persisted in a PEM file named by
//! the server IP. A key learned during the handshake is only stored when
//! policy permits trust-on-first-use; once stored, the cached key is what
//! authenticates the server on every later connection.

use crate::error::{ClientError, ClientResult};
use crate::session;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default modulus size of a generated agent key
pub const DEFAULT_KEY_BITS: usize = 2048;

/// The agent's RSA identity
#[derive(Debug, Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    /// Generates a fresh keypair
    pub fn generate(bits: usize) -> ClientResult<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| ClientError::crypto(format!("key generation failed: {}", e)))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Wraps an existing private key
    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    /// The public half
    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// The public modulus in MPI form, as sent during the handshake
    pub fn modulus_mpi(&self) -> Vec<u8> {
        session::mpi_encode(&self.public.n().to_bytes_be())
    }

    /// The public exponent in MPI form
    pub fn exponent_mpi(&self) -> Vec<u8> {
        session::mpi_encode(&self.public.e().to_bytes_be())
    }

    /// Decrypts a counter-challenge sent under our public key
    pub fn decrypt(&self, cipher_text: &[u8]) -> ClientResult<Vec<u8>> {
        self.private
            .decrypt(Pkcs1v15Encrypt, cipher_text)
            .map_err(|e| ClientError::crypto(format!("private decrypt failed: {}", e)))
    }
}

/// Encrypts under a peer's public key with the protocol padding
pub fn public_encrypt(key: &RsaPublicKey, plain: &[u8]) -> ClientResult<Vec<u8>> {
    let mut rng = rand::thread_rng();
    key.encrypt(&mut rng, Pkcs1v15Encrypt, plain)
        .map_err(|e| ClientError::crypto(format!("public encrypt failed: {}", e)))
}

/// Reassembles a public key from the modulus and exponent magnitudes
pub fn build_public_key(modulus: &[u8], exponent: &[u8]) -> ClientResult<RsaPublicKey> {
    RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from_bytes_be(exponent),
    )
    .map_err(|e| ClientError::crypto(format!("invalid server key: {}", e)))
}

/// Short printable identity of a public key, for logs and the TOFU warning
pub fn key_digest(key: &RsaPublicKey) -> String {
    let der = key
        .to_pkcs1_der()
        .map(|d| d.as_bytes().to_vec())
        .unwrap_or_default();
    hex::encode(&Sha256::digest(&der)[..16])
}

/// On-disk cache of server public keys, one PEM file per server IP
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// A store rooted at `dir`; the directory is created on first save
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, server_ip: &str) -> PathBuf {
        self.dir.join(format!("root-{}.pub", server_ip))
    }

    /// The cached key for a server IP, if one was ever trusted
    pub fn public_key_for(&self, server_ip: &str) -> Option<RsaPublicKey> {
        let path = self.path_for(server_ip);
        let pem = std::fs::read_to_string(&path).ok()?;
        match RsaPublicKey::from_pkcs1_pem(&pem) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "ignoring unreadable cached server key"
                );
                None
            }
        }
    }

    /// Persists a server key under its IP
    pub fn save(&self, server_ip: &str, key: &RsaPublicKey) -> ClientResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ClientError::KeyStore {
            name: server_ip.to_string(),
            reason: e.to_string(),
        })?;
        let pem = key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ClientError::KeyStore {
                name: server_ip.to_string(),
                reason: e.to_string(),
            })?;
        let path = self.path_for(server_ip);
        std::fs::write(&path, pem).map_err(|e| ClientError::KeyStore {
            name: server_ip.to_string(),
            reason: e.to_string(),
        })?;
        debug!(server = server_ip, path = %path.display(), "stored server public key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let store = KeyStore::new(dir.path());
        assert!(store.public_key_for("10.0.0.9").is_none());

        let pair = KeyPair::generate(1024).expect("keypair generates");
        store.save("10.0.0.9", pair.public()).expect("key saves");

        let loaded = store.public_key_for("10.0.0.9").expect("key loads");
        assert_eq!(&loaded, pair.public());
        assert!(store.public_key_for("10.0.0.10").is_none());
    }

    #[test]
    fn test_encrypt_decrypt_with_pair() {
        let pair = KeyPair::generate(1024).expect("keypair generates");
        let secret = b"counter challenge";
        let cipher_text = public_encrypt(pair.public(), secret).expect("encrypts");
        let plain = pair.decrypt(&cipher_text).expect("decrypts");
        assert_eq!(plain, secret);
    }

    #[test]
    fn test_mpi_numbers_rebuild_key() {
        let pair = KeyPair::generate(1024).expect("keypair generates");
        let n = session::mpi_decode(&pair.modulus_mpi()).expect("modulus decodes");
        let e = session::mpi_decode(&pair.exponent_mpi()).expect("exponent decodes");
        let rebuilt = build_public_key(&n, &e).expect("key rebuilds");
        assert_eq!(&rebuilt, pair.public());
    }

    #[test]
    fn test_key_digest_is_stable() {
        let pair = KeyPair::generate(1024).expect("keypair generates");
        assert_eq!(key_digest(pair.public()), key_digest(pair.public()));
        assert_eq!(key_digest(pair.public()).len(), 32);
    }
}
