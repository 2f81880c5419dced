//! # Integrity and Encryption
//!
//! Two independent layers protect stored values:
//!
//! 1. **Checksums** — every persisted payload carries an xxh3-64 content
//!    hash (plus CRC32 at the record-framing level). Integrity is checked
//!    on every read, regardless of whether the payload is encrypted.
//! 2. **AEAD** — values flagged sensitive are wrapped with AES-256-GCM.
//!    Nonces are a 32-bit per-process random seed concatenated with a
//!    64-bit monotonic counter, so a (key, nonce) pair is never reused.
//!
//! Master keys come from a [`KeyProvider`]: a hardware-token file when the
//! platform has one, or a software provider deriving the key from a
//! passphrase via PBKDF2-HMAC-SHA256.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crc32fast::Hasher as Crc32Hasher;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;

use crate::error::{Error, Result};

/// Fast CRC32 checksum for record framing
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify CRC32 checksum
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32_checksum(data) == expected
}

/// 64-bit content hash (xxh3) for payload checksums
#[inline]
pub fn content_hash64(data: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(data)
}

/// Cached 64-bit hash of a dotted key path
#[inline]
pub fn path_hash(path: &str) -> u64 {
    xxhash_rust::xxh3::xxh3_64(path.as_bytes())
}

/// BLAKE3 digest rendered as hex, used for checkpoint chaining
pub fn blake3_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Derive a 256-bit key from secret material
pub fn derive_key(secret: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(iterations.max(1)).unwrap(),
        salt,
        secret,
        &mut key,
    );
    key
}

/// Where the master key comes from. Owned by the bootstrap layer and passed
/// in as a constructor argument.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Fresh random key, lost on process exit. Encrypted values do not
    /// survive a restart; useful for TEMPORARY keys and tests.
    Ephemeral,
    /// PBKDF2-derived from a passphrase.
    Passphrase { secret: String, salt: Vec<u8> },
    /// Raw 32-byte key held by a platform token (TPM-sealed file, smartcard
    /// export, etc.).
    TokenFile(PathBuf),
}

/// Source of master key material. The encryption layer never knows which
/// implementation is active.
pub trait KeyProvider: Send + Sync {
    fn key_material(&self) -> Result<[u8; 32]>;
    fn describe(&self) -> &str;
}

/// Software fallback: key material lives in process memory only.
pub struct SoftwareKeyProvider {
    key: [u8; 32],
    label: &'static str,
}

impl SoftwareKeyProvider {
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            key,
            label: "software/ephemeral",
        }
    }

    pub fn from_passphrase(secret: &str, salt: &[u8]) -> Self {
        Self {
            key: derive_key(secret.as_bytes(), salt, 100_000),
            label: "software/derived",
        }
    }
}

impl KeyProvider for SoftwareKeyProvider {
    fn key_material(&self) -> Result<[u8; 32]> {
        Ok(self.key)
    }

    fn describe(&self) -> &str {
        self.label
    }
}

/// Hardware-backed provider: reads a raw 32-byte key from a token file
/// managed by the platform (sealed by a TPM or an external agent).
pub struct TokenFileKeyProvider {
    path: PathBuf,
}

impl TokenFileKeyProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl KeyProvider for TokenFileKeyProvider {
    fn key_material(&self) -> Result<[u8; 32]> {
        let data = std::fs::read(&self.path).map_err(|e| Error::Encryption {
            reason: format!("key token unavailable at {:?}: {}", self.path, e),
        })?;
        if data.len() < 32 {
            return Err(Error::Encryption {
                reason: format!("key token too short: {} bytes", data.len()),
            });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&data[..32]);
        Ok(key)
    }

    fn describe(&self) -> &str {
        "hardware/token-file"
    }
}

pub fn provider_for(source: &KeySource) -> Result<Box<dyn KeyProvider>> {
    Ok(match source {
        KeySource::Ephemeral => Box::new(SoftwareKeyProvider::ephemeral()),
        KeySource::Passphrase { secret, salt } => {
            Box::new(SoftwareKeyProvider::from_passphrase(secret, salt))
        }
        KeySource::TokenFile(path) => Box::new(TokenFileKeyProvider::new(path)),
    })
}

/// AES-256-GCM wrapper for sensitive values.
///
/// Output layout: `[nonce (12B)] [ciphertext || tag]`. The key path is fed
/// in as associated data so a ciphertext cannot be replayed under another
/// key.
pub struct Encryptor {
    key: LessSafeKey,
    nonce_seed: u32,
    counter: AtomicU64,
    provider_label: String,
}

impl Encryptor {
    pub fn new(provider: &dyn KeyProvider) -> Result<Self> {
        let material = provider.key_material()?;
        let unbound = UnboundKey::new(&AES_256_GCM, &material).map_err(|_| Error::Encryption {
            reason: "failed to load AEAD key".to_string(),
        })?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            nonce_seed: rand::thread_rng().next_u32(),
            counter: AtomicU64::new(0),
            provider_label: provider.describe().to_string(),
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider_label
    }

    fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_seed.to_be_bytes());
        nonce[4..].copy_from_slice(&count.to_be_bytes());
        nonce
    }

    /// Encrypt and authenticate `plaintext`, binding it to `aad`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = self.next_nonce();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len() + AES_256_GCM.tag_len());
        out.extend_from_slice(&nonce_bytes);

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| Error::Encryption {
                reason: "AEAD seal failed".to_string(),
            })?;
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Decrypt and verify a payload produced by [`Encryptor::seal`].
    pub fn open(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(Error::Encryption {
                reason: "ciphertext too short".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| Error::Encryption {
                reason: "bad nonce".to_string(),
            })?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| Error::Encryption {
                reason: "AEAD authentication failed".to_string(),
            })?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksums() {
        let data = b"test data";
        let checksum = crc32_checksum(data);
        assert!(verify_crc32(data, checksum));
        assert!(!verify_crc32(b"tampered", checksum));
        assert_ne!(content_hash64(b"a"), content_hash64(b"b"));
    }

    #[test]
    fn seal_open_roundtrip() {
        let provider = SoftwareKeyProvider::ephemeral();
        let enc = Encryptor::new(&provider).unwrap();

        let sealed = enc.seal(b"secret-token", b"auth.token").unwrap();
        let opened = enc.open(&sealed, b"auth.token").unwrap();
        assert_eq!(opened, b"secret-token");
    }

    #[test]
    fn aad_mismatch_fails() {
        let provider = SoftwareKeyProvider::ephemeral();
        let enc = Encryptor::new(&provider).unwrap();

        let sealed = enc.seal(b"secret", b"auth.token").unwrap();
        assert!(enc.open(&sealed, b"other.key").is_err());
    }

    #[test]
    fn nonces_never_repeat() {
        let provider = SoftwareKeyProvider::ephemeral();
        let enc = Encryptor::new(&provider).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let sealed = enc.seal(b"v", b"k").unwrap();
            assert!(seen.insert(sealed[..NONCE_LEN].to_vec()));
        }
    }

    #[test]
    fn derived_keys_are_deterministic() {
        let a = derive_key(b"pass", b"salt", 1000);
        let b = derive_key(b"pass", b"salt", 1000);
        let c = derive_key(b"pass", b"other", 1000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn token_file_provider_reads_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        std::fs::write(&path, [7u8; 32]).unwrap();

        let provider = TokenFileKeyProvider::new(&path);
        assert_eq!(provider.key_material().unwrap(), [7u8; 32]);
        assert!(Encryptor::new(&provider).is_ok());
    }
}
