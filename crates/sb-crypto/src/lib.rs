//! Cryptographic primitives for Switchboard
//!
//! Symmetric encryption of sensitive columns, PKCE material, password-based
//! backup encryption, and the persisted key file with restricted
//! permissions. Losing the key file renders encrypted columns unrecoverable.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use parking_lot::RwLock;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use sb_types::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

const HASH_ITERATIONS: u32 = 10_000;
const HASH_SALT_LEN: usize = 64;
const HASH_DIGEST_LEN: usize = 64;

const BACKUP_SALT_LEN: usize = 32;
const BACKUP_IV_LEN: usize = 16;
const BACKUP_ITERATIONS: u32 = 100_000;

/// Default key rotation interval (days)
pub const ROTATION_INTERVAL_DAYS: i64 = 90;

/// Rotation metadata persisted next to the key file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Monotonically increasing key version
    pub version: u32,
    /// Unix ms of the last rotation (or initial creation)
    pub rotated_at: i64,
    /// Unix ms at which the next scheduled rotation is due
    pub next_rotation_at: i64,
}

/// Generate a base64url token of `n` random bytes
///
/// Callers use 32 bytes for OAuth state and 64 bytes for PKCE verifiers.
pub fn random_token(n: usize) -> String {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; n];
    rng.fill(&mut bytes).expect("system RNG failure");
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Derive the S256 PKCE challenge for a verifier
pub fn pkce_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Hash data for storage: PBKDF2-SHA512, 10 000 iterations, 64-byte salt
///
/// Output format is `base64(salt)$base64(digest)`.
pub fn hash(data: &str) -> String {
    let rng = SystemRandom::new();
    let mut salt = [0u8; HASH_SALT_LEN];
    rng.fill(&mut salt).expect("system RNG failure");

    let mut digest = [0u8; HASH_DIGEST_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA512,
        NonZeroU32::new(HASH_ITERATIONS).unwrap(),
        &salt,
        data.as_bytes(),
        &mut digest,
    );

    format!("{}${}", STANDARD.encode(salt), STANDARD.encode(digest))
}

/// Verify data against a stored salted digest in constant time
pub fn verify_hash(data: &str, stored: &str) -> bool {
    let Some((salt_b64, digest_b64)) = stored.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(digest)) = (STANDARD.decode(salt_b64), STANDARD.decode(digest_b64)) else {
        return false;
    };

    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA512,
        NonZeroU32::new(HASH_ITERATIONS).unwrap(),
        &salt,
        data.as_bytes(),
        &digest,
    )
    .is_ok()
}

/// Encrypt a blob under a passphrase for backup export
///
/// Output layout: `salt(32) || iv(16) || tag(16) || ciphertext`, with the
/// key derived as PBKDF2-SHA256(passphrase, salt, 100 000 iterations,
/// 32 bytes). The iv field is 16 bytes on the wire; AES-GCM consumes its
/// first 12.
pub fn backup_encrypt(blob: &[u8], passphrase: &str) -> BrokerResult<Vec<u8>> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; BACKUP_SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| BrokerError::Crypto("failed to generate salt".to_string()))?;

    let mut iv = [0u8; BACKUP_IV_LEN];
    rng.fill(&mut iv)
        .map_err(|_| BrokerError::Crypto("failed to generate iv".to_string()))?;

    let key = derive_backup_key(passphrase, &salt);
    let (ciphertext, tag) = seal(&key, &iv[..NONCE_LEN], blob)?;

    let mut out = Vec::with_capacity(BACKUP_SALT_LEN + BACKUP_IV_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a backup blob produced by [`backup_encrypt`]
///
/// Fails with `CryptoError` on a wrong passphrase or tampered data.
pub fn backup_decrypt(data: &[u8], passphrase: &str) -> BrokerResult<Vec<u8>> {
    if data.len() < BACKUP_SALT_LEN + BACKUP_IV_LEN + TAG_LEN {
        return Err(BrokerError::Crypto("backup blob too short".to_string()));
    }

    let (salt, rest) = data.split_at(BACKUP_SALT_LEN);
    let (iv, rest) = rest.split_at(BACKUP_IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let key = derive_backup_key(passphrase, salt);
    open(&key, &iv[..NONCE_LEN], tag, ciphertext)
}

fn derive_backup_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(BACKUP_ITERATIONS).unwrap(),
        salt,
        passphrase.as_bytes(),
        &mut key,
    );
    key
}

/// AES-256-GCM seal; returns (ciphertext, tag)
fn seal(key: &[u8; KEY_LEN], nonce: &[u8], plaintext: &[u8]) -> BrokerResult<(Vec<u8>, Vec<u8>)> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| BrokerError::Crypto("failed to create encryption key".to_string()))?;
    let sealing_key = LessSafeKey::new(unbound);

    let nonce = Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| BrokerError::Crypto("failed to create nonce".to_string()))?;

    let mut buf = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
        .map_err(|_| BrokerError::Crypto("encryption failed".to_string()))?;

    let tag = buf.split_off(buf.len() - TAG_LEN);
    Ok((buf, tag))
}

/// AES-256-GCM open; fails on tag mismatch
fn open(key: &[u8; KEY_LEN], nonce: &[u8], tag: &[u8], ciphertext: &[u8]) -> BrokerResult<Vec<u8>> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| BrokerError::Crypto("failed to create decryption key".to_string()))?;
    let opening_key = LessSafeKey::new(unbound);

    let nonce = Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| BrokerError::Crypto("failed to create nonce".to_string()))?;

    let mut buf = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    buf.extend_from_slice(ciphertext);
    buf.extend_from_slice(tag);

    let plaintext = opening_key
        .open_in_place(nonce, Aad::empty(), &mut buf)
        .map_err(|_| BrokerError::Crypto("decryption failed: tag mismatch".to_string()))?;

    Ok(plaintext.to_vec())
}

/// Column encryption service with a persisted 32-byte key
///
/// The key file is created with owner-only permissions. The key is read-only
/// after load; rotation swaps it atomically after every dependent row has
/// been re-encrypted.
pub struct CryptoService {
    key: RwLock<[u8; KEY_LEN]>,
    metadata: RwLock<KeyMetadata>,
    key_path: PathBuf,
    meta_path: PathBuf,
}

impl CryptoService {
    /// Load the key file, creating a fresh key if none exists
    pub fn load_or_create(key_path: &Path, meta_path: &Path) -> BrokerResult<Self> {
        let (key, metadata) = if key_path.exists() {
            let bytes = std::fs::read(key_path)?;
            if bytes.len() != KEY_LEN {
                return Err(BrokerError::Crypto(format!(
                    "invalid key file length: {}",
                    bytes.len()
                )));
            }
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes);

            let metadata = if meta_path.exists() {
                serde_json::from_slice(&std::fs::read(meta_path)?)?
            } else {
                initial_metadata()
            };
            debug!("loaded encryption key (version {})", metadata.version);
            (key, metadata)
        } else {
            let key = Self::generate_key();
            let metadata = initial_metadata();
            write_key_file(key_path, &key)?;
            write_meta_file(meta_path, &metadata)?;
            info!("created new encryption key at {}", key_path.display());
            (key, metadata)
        };

        Ok(Self {
            key: RwLock::new(key),
            metadata: RwLock::new(metadata),
            key_path: key_path.to_path_buf(),
            meta_path: meta_path.to_path_buf(),
        })
    }

    /// Generate a fresh 32-byte key
    pub fn generate_key() -> [u8; KEY_LEN] {
        let rng = SystemRandom::new();
        let mut key = [0u8; KEY_LEN];
        rng.fill(&mut key).expect("system RNG failure");
        key
    }

    /// Encrypt a string under the current key
    ///
    /// Output is base64(`nonce(12) || tag(16) || ciphertext`). The empty
    /// string encrypts to the empty string.
    pub fn encrypt(&self, plaintext: &str) -> BrokerResult<String> {
        let key = *self.key.read();
        Self::encrypt_with_key(&key, plaintext)
    }

    /// Decrypt a string under the current key
    ///
    /// Fails with `CryptoError` on tag mismatch; callers must propagate.
    pub fn decrypt(&self, ciphertext: &str) -> BrokerResult<String> {
        let key = *self.key.read();
        Self::decrypt_with_key(&key, ciphertext)
    }

    /// Encrypt under an explicit key (used while re-encrypting for rotation)
    pub fn encrypt_with_key(key: &[u8; KEY_LEN], plaintext: &str) -> BrokerResult<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let rng = SystemRandom::new();
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill(&mut nonce)
            .map_err(|_| BrokerError::Crypto("failed to generate nonce".to_string()))?;

        let (ciphertext, tag) = seal(key, &nonce, plaintext.as_bytes())?;

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt under an explicit key
    pub fn decrypt_with_key(key: &[u8; KEY_LEN], ciphertext: &str) -> BrokerResult<String> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let data = STANDARD
            .decode(ciphertext)
            .map_err(|e| BrokerError::Crypto(format!("invalid ciphertext encoding: {}", e)))?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(BrokerError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce, rest) = data.split_at(NONCE_LEN);
        let (tag, ct) = rest.split_at(TAG_LEN);

        let plaintext = open(key, nonce, tag, ct)?;
        String::from_utf8(plaintext)
            .map_err(|_| BrokerError::Crypto("decrypted data is not valid UTF-8".to_string()))
    }

    /// Current key bytes (rotation re-encryption reads rows under this key)
    pub fn current_key(&self) -> [u8; KEY_LEN] {
        *self.key.read()
    }

    /// Current key version
    pub fn key_version(&self) -> u32 {
        self.metadata.read().version
    }

    /// Rotation metadata snapshot
    pub fn metadata(&self) -> KeyMetadata {
        self.metadata.read().clone()
    }

    /// Make a new key authoritative after all rows were re-encrypted
    ///
    /// Writes the key file atomically (temp + rename) and bumps the version.
    /// Until this returns, the old key remains authoritative.
    pub fn commit_rotation(&self, new_key: [u8; KEY_LEN]) -> BrokerResult<u32> {
        write_key_file(&self.key_path, &new_key)?;

        let now = chrono::Utc::now().timestamp_millis();
        let new_meta = {
            let mut meta = self.metadata.write();
            meta.version += 1;
            meta.rotated_at = now;
            meta.next_rotation_at = now + ROTATION_INTERVAL_DAYS * 24 * 3600 * 1000;
            meta.clone()
        };
        write_meta_file(&self.meta_path, &new_meta)?;

        *self.key.write() = new_key;
        info!("encryption key rotated to version {}", new_meta.version);
        Ok(new_meta.version)
    }
}

fn initial_metadata() -> KeyMetadata {
    let now = chrono::Utc::now().timestamp_millis();
    KeyMetadata {
        version: 1,
        rotated_at: now,
        next_rotation_at: now + ROTATION_INTERVAL_DAYS * 24 * 3600 * 1000,
    }
}

fn write_key_file(path: &Path, key: &[u8; KEY_LEN]) -> BrokerResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, key)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&tmp)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&tmp, perms)?;
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn write_meta_file(path: &Path, meta: &KeyMetadata) -> BrokerResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
