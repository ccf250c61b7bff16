//! Password-encrypted backup of the whole custody state.
//!
//! # Algorithms
//!
//! - **Key Derivation**: Argon2id (memory-hard, 64 MiB / 3 passes / 4 lanes)
//! - **Encryption**: ChaCha20-Poly1305 (authenticated encryption)
//!
//! # Archive Format
//!
//! ```text
//! base64( salt[16] || nonce[12] || ciphertext+tag )
//! ```
//!
//! The plaintext is the JSON [`BackupSnapshot`]. Salt and nonce are fresh
//! for every export, so identical state never produces identical archives.
//! Any failure to decode, authenticate or parse an archive is reported as
//! [`CustodyError::Decrypt`].
//!
//! The archive does not record the Argon2 cost, so it is fixed: every
//! device derives the same key from the same passphrase and salt.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{CustodyError, Result};
use crate::keys::KeyStoreSnapshot;
use crate::origin::AllowlistSnapshot;

// =============================================================================
// Constants
// =============================================================================

/// Argon2id memory cost in KiB (64 MiB)
pub const ARGON2_MEMORY_KIB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (lanes)
pub const ARGON2_PARALLELISM: u32 = 4;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Derived key length (32 bytes)
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Current snapshot format version.
pub const BACKUP_VERSION: u32 = 1;

// =============================================================================
// Snapshot
// =============================================================================

/// Everything a backup carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub key_store: KeyStoreSnapshot,
    pub allowlist: AllowlistSnapshot,
}

impl BackupSnapshot {
    pub fn new(key_store: KeyStoreSnapshot, allowlist: AllowlistSnapshot) -> Self {
        Self {
            version: BACKUP_VERSION,
            exported_at: Utc::now(),
            key_store,
            allowlist,
        }
    }
}

/// Result of merging an imported backup into local state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub keys_added: usize,
    pub keys_skipped: usize,
    pub origins_added: usize,
    pub active_adopted: bool,
}

// =============================================================================
// Archive
// =============================================================================

/// The `{salt, iv, ciphertext}` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArchive {
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl BackupArchive {
    /// Portable text form.
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(SALT_LEN + NONCE_LEN + self.ciphertext.len());
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        BASE64.encode(bytes)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|e| CustodyError::Decrypt(format!("archive is not base64: {e}")))?;

        if bytes.len() < SALT_LEN + NONCE_LEN + AUTH_TAG_LEN {
            return Err(CustodyError::Decrypt(format!(
                "archive too short: {} bytes",
                bytes.len()
            )));
        }

        let (salt, rest) = bytes.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let mut archive = Self {
            salt: [0u8; SALT_LEN],
            nonce: [0u8; NONCE_LEN],
            ciphertext: ciphertext.to_vec(),
        };
        archive.salt.copy_from_slice(salt);
        archive.nonce.copy_from_slice(nonce);
        Ok(archive)
    }
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KdfParams {
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
}

impl KdfParams {
    /// Minimal cost so unit tests stay fast. Archives made with it only
    /// open under the same parameters.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: ARGON2_MEMORY_KIB,
            iterations: ARGON2_ITERATIONS,
            parallelism: ARGON2_PARALLELISM,
        }
    }
}

/// Derive the archive key from a passphrase using Argon2id.
pub(crate) fn derive_backup_key(
    passphrase: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CustodyError::Config(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase, salt, &mut *key)
        .map_err(|e| CustodyError::Internal(format!("Key derivation failed: {e}")))?;

    Ok(key)
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// =============================================================================
// Seal / Open
// =============================================================================

/// Encrypt arbitrary plaintext into an archive under a passphrase.
pub(crate) fn seal(plaintext: &[u8], passphrase: &str, params: &KdfParams) -> Result<BackupArchive> {
    let salt: [u8; SALT_LEN] = random_bytes();
    let nonce: [u8; NONCE_LEN] = random_bytes();

    let key = derive_backup_key(passphrase.as_bytes(), &salt, params)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&*key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CustodyError::Internal(format!("Encryption failed: {e}")))?;

    Ok(BackupArchive {
        salt,
        nonce,
        ciphertext,
    })
}

/// Decrypt and authenticate an archive.
pub(crate) fn open(
    archive: &BackupArchive,
    passphrase: &str,
    params: &KdfParams,
) -> Result<Zeroizing<Vec<u8>>> {
    let key = derive_backup_key(passphrase.as_bytes(), &archive.salt, params)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&*key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&archive.nonce), archive.ciphertext.as_slice())
        .map_err(|_| CustodyError::Decrypt("Failed to decrypt backup (wrong passphrase?)".into()))?;
    Ok(Zeroizing::new(plaintext))
}

/// Serialize and seal a snapshot into archive text.
pub(crate) fn export_snapshot(
    snapshot: &BackupSnapshot,
    passphrase: &str,
    params: &KdfParams,
) -> Result<String> {
    let plaintext = Zeroizing::new(serde_json::to_vec(snapshot)?);
    Ok(seal(&plaintext, passphrase, params)?.encode())
}

/// Open archive text and parse the snapshot inside.
pub(crate) fn import_snapshot(text: &str, passphrase: &str, params: &KdfParams) -> Result<BackupSnapshot> {
    let archive = BackupArchive::decode(text)?;
    let plaintext = open(&archive, passphrase, params)?;
    let snapshot: BackupSnapshot = serde_json::from_slice(&plaintext)
        .map_err(|e| CustodyError::Decrypt(format!("backup contents unreadable: {e}")))?;

    if snapshot.version != BACKUP_VERSION {
        return Err(CustodyError::Decrypt(format!(
            "unsupported backup version {}",
            snapshot.version
        )));
    }
    Ok(snapshot)
}

// =============================================================================
// Tests
// =============================================================================
