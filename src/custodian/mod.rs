//! Key Custodian
//!
//! Owns the key store and the origin allowlist, persists both through an
//! injected [`Vault`], and answers wire requests (see [`handler`]).
//!
//! # Responsibilities
//!
//! - Owner-side key management (generate, import, activate, delete)
//! - Allowlist management (add, remove, export, import)
//! - Password-encrypted backup export and merge-import
//! - Serving correlated requests from admitted callers
//!
//! Every mutation is applied to a copy, persisted, and only then committed,
//! so a failed vault write leaves the in-memory state untouched.

pub mod handler;

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::backup::{self, BackupSnapshot, ImportSummary, KdfParams};
use crate::config::Config;
use crate::error::{CustodyError, OperationError, Result};
use crate::keys::{generate_signing_key, signing_key_from_hex, KeyEntry, KeyStore, KeySummary};
use crate::origin::{AllowlistImport, AllowlistSnapshot, OriginPolicy};
use crate::vault::{MemoryVault, Vault};

// =============================================================================
// Vault Layout
// =============================================================================

/// Serialized key store, including the active pointer.
pub const KEYS_ENTRY: &str = "keys";

/// User-added origins.
pub const USER_ORIGINS_ENTRY: &str = "allowlist.user";

/// Built-in origins in effect when the vault was last opened.
pub const DEFAULT_ORIGINS_ENTRY: &str = "allowlist.defaults";

/// Alias given to keys created over the wire.
pub const GENERATED_KEY_ALIAS: &str = "Generated key";

// =============================================================================
// Custodian
// =============================================================================

pub struct Custodian {
    keys: RwLock<KeyStore>,
    origins: RwLock<OriginPolicy>,
    vault: Arc<dyn Vault>,
    kdf: KdfParams,
}

impl Custodian {
    /// Load custody state from a vault.
    pub fn open(vault: Arc<dyn Vault>, config: &Config) -> Result<Self> {
        let mut origins = OriginPolicy::new(&config.default_origins)?;
        if let Some(json) = vault.get(USER_ORIGINS_ENTRY)? {
            let user: Vec<String> = serde_json::from_str(&json)
                .map_err(|e| CustodyError::Storage(format!("{USER_ORIGINS_ENTRY}: {e}")))?;
            origins.restore_user(user);
        }
        vault.set(
            DEFAULT_ORIGINS_ENTRY,
            &serde_json::to_string(origins.defaults())?,
        )?;

        let keys = match vault.get(KEYS_ENTRY)? {
            Some(json) => {
                let json = Zeroizing::new(json);
                let snapshot = serde_json::from_str(&json)
                    .map_err(|e| CustodyError::Storage(format!("{KEYS_ENTRY}: {e}")))?;
                KeyStore::restore(&snapshot)?
            }
            None => KeyStore::new(),
        };

        info!(
            keys = keys.len(),
            active = ?keys.active_key_id(),
            default_origins = origins.defaults().len(),
            user_origins = origins.user().len(),
            "Custodian opened"
        );

        Ok(Self {
            keys: RwLock::new(keys),
            origins: RwLock::new(origins),
            vault,
            kdf: KdfParams::default(),
        })
    }

    /// A custodian backed by a fresh [`MemoryVault`].
    pub fn in_memory(config: &Config) -> Result<Self> {
        Self::open(Arc::new(MemoryVault::new()), config)
    }

    /// Use cheap backup key derivation.
    #[cfg(test)]
    pub(crate) fn with_test_kdf(mut self) -> Self {
        self.kdf = KdfParams::for_tests();
        self
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn persist_keys(&self, store: &KeyStore) -> Result<()> {
        let json = Zeroizing::new(serde_json::to_string(&store.snapshot())?);
        self.vault.set(KEYS_ENTRY, &json)
    }

    fn persist_origins(&self, policy: &OriginPolicy) -> Result<()> {
        self.vault
            .set(USER_ORIGINS_ENTRY, &serde_json::to_string(policy.user())?)
    }

    async fn update_keys<T>(&self, f: impl FnOnce(&mut KeyStore) -> T) -> Result<T> {
        let mut keys = self.keys.write().await;
        let mut next = keys.clone();
        let out = f(&mut next);
        self.persist_keys(&next)?;
        *keys = next;
        Ok(out)
    }

    async fn update_origins<T>(
        &self,
        f: impl FnOnce(&mut OriginPolicy) -> Result<T>,
    ) -> Result<T> {
        let mut origins = self.origins.write().await;
        let mut next = origins.clone();
        let out = f(&mut next)?;
        self.persist_origins(&next)?;
        *origins = next;
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Keys
    // -------------------------------------------------------------------------

    pub async fn list_keys(&self) -> Vec<KeySummary> {
        self.keys.read().await.list().iter().map(KeyEntry::summary).collect()
    }

    pub async fn active_key(&self) -> Option<KeySummary> {
        self.keys.read().await.get_active().map(KeyEntry::summary)
    }

    /// Public identifier of the active key.
    pub async fn active_identifier(&self) -> Result<String> {
        self.keys
            .read()
            .await
            .get_active()
            .map(|entry| entry.public_identifier.clone())
            .ok_or(CustodyError::Operation(OperationError::NoActiveKey))
    }

    /// Generate a key. It becomes active only if it is the first key ever.
    pub async fn generate_key(&self, alias: &str) -> Result<KeySummary> {
        let summary = self
            .update_keys(|store| store.add(generate_signing_key(), alias).summary())
            .await?;
        info!(id = %summary.id, did = %summary.did_key, "Key generated");
        Ok(summary)
    }

    /// Generate a key and make it the active one.
    pub async fn generate_and_activate(&self, alias: &str) -> Result<KeySummary> {
        let summary = self
            .update_keys(|store| {
                let summary = store.add(generate_signing_key(), alias).summary();
                store.set_active(&summary.id);
                summary
            })
            .await?;
        info!(id = %summary.id, did = %summary.did_key, "Key generated and activated");
        Ok(summary)
    }

    /// Import a key from its hex-encoded private scalar.
    pub async fn import_key(&self, secret_hex: &str, alias: &str) -> Result<KeySummary> {
        let signing_key = signing_key_from_hex(secret_hex)?;
        let summary = self
            .update_keys(|store| store.add(signing_key, alias).summary())
            .await?;
        info!(id = %summary.id, did = %summary.did_key, "Key imported");
        Ok(summary)
    }

    /// Delete a key. Returns `None` if the id is unknown.
    pub async fn delete_key(&self, id: &str) -> Result<Option<KeySummary>> {
        let removed = self
            .update_keys(|store| store.delete(id).map(|entry| entry.summary()))
            .await?;
        if removed.is_some() {
            info!(id = %id, "Key deleted");
        }
        Ok(removed)
    }

    /// Activate a key. Returns `false` if the id is unknown.
    pub async fn set_active(&self, id: &str) -> Result<bool> {
        if !self.keys.read().await.contains(id) {
            return Ok(false);
        }
        let activated = self.update_keys(|store| store.set_active(id)).await?;
        if activated {
            info!(id = %id, "Active key changed");
        }
        Ok(activated)
    }

    /// Sign with the active key.
    pub async fn sign(&self, message: &[u8]) -> Result<String> {
        let keys = self.keys.read().await;
        let active = keys
            .get_active()
            .ok_or(CustodyError::Operation(OperationError::NoLocalKey))?;
        if message.is_empty() {
            return Err(CustodyError::Operation(OperationError::EmptyMessage));
        }
        Ok(active.sign(message))
    }

    // -------------------------------------------------------------------------
    // Allowlist
    // -------------------------------------------------------------------------

    pub async fn is_allowed(&self, origin: &str) -> bool {
        self.origins.read().await.is_allowed(origin)
    }

    pub async fn allowed_origins(&self) -> AllowlistSnapshot {
        self.origins.read().await.snapshot()
    }

    pub async fn add_origin(&self, origin: &str) -> Result<bool> {
        let added = self
            .update_origins(|policy| policy.add_user_origin(origin))
            .await?;
        if added {
            info!(origin = %origin, "Origin allowed");
        }
        Ok(added)
    }

    pub async fn remove_origin(&self, origin: &str) -> Result<bool> {
        let removed = self
            .update_origins(|policy| Ok(policy.remove_user_origin(origin)))
            .await?;
        if removed {
            info!(origin = %origin, "Origin removed");
        } else {
            debug!(origin = %origin, "Origin not in user set");
        }
        Ok(removed)
    }

    pub async fn export_allowlist(&self) -> Result<String> {
        self.origins.read().await.export_json()
    }

    pub async fn import_allowlist(&self, text: &str) -> Result<AllowlistImport> {
        let outcome = self.update_origins(|policy| policy.import_json(text)).await?;
        info!(added = outcome.added, skipped = outcome.skipped, "Allowlist imported");
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Backup
    // -------------------------------------------------------------------------

    /// Export the whole custody state as an encrypted archive.
    pub async fn export_backup(&self, passphrase: &str) -> Result<String> {
        let snapshot = {
            let keys = self.keys.read().await;
            let origins = self.origins.read().await;
            BackupSnapshot::new(keys.snapshot(), origins.snapshot())
        };
        let key_count = snapshot.key_store.keys.len();

        let passphrase = Zeroizing::new(passphrase.to_string());
        let kdf = self.kdf;
        let archive = tokio::task::spawn_blocking(move || {
            backup::export_snapshot(&snapshot, &passphrase, &kdf)
        })
        .await
        .map_err(|e| CustodyError::Internal(format!("backup task failed: {e}")))??;

        info!(keys = key_count, "Backup exported");
        Ok(archive)
    }

    /// Merge an encrypted archive into local state.
    ///
    /// Nothing is touched until the archive has decrypted and every entry
    /// in it has been validated. Existing ids are never overwritten.
    pub async fn import_backup(&self, archive: &str, passphrase: &str) -> Result<ImportSummary> {
        let archive = archive.to_string();
        let passphrase = Zeroizing::new(passphrase.to_string());
        let kdf = self.kdf;
        let snapshot = tokio::task::spawn_blocking(move || {
            backup::import_snapshot(&archive, &passphrase, &kdf)
        })
        .await
        .map_err(|e| CustodyError::Internal(format!("backup task failed: {e}")))??;

        let mut incoming = Vec::with_capacity(snapshot.key_store.keys.len());
        for stored in &snapshot.key_store.keys {
            let entry = stored
                .to_entry()
                .map_err(|e| CustodyError::Decrypt(format!("backup entry rejected: {e}")))?;
            incoming.push(entry);
        }

        let mut summary = ImportSummary::default();
        let incoming_active = snapshot.key_store.active_key_id.clone();
        self.update_keys(|store| {
            for entry in incoming {
                if store.insert_preserving_id(entry) {
                    summary.keys_added += 1;
                } else {
                    summary.keys_skipped += 1;
                }
            }
            summary.active_adopted = store.adopt_active(incoming_active.as_deref());
        })
        .await?;

        let user_origins = snapshot.allowlist.user.clone();
        summary.origins_added = self
            .update_origins(|policy| Ok(policy.restore_user(user_origins)))
            .await?;

        if summary.keys_skipped > 0 {
            warn!(skipped = summary.keys_skipped, "Backup keys already present were kept");
        }
        info!(
            keys_added = summary.keys_added,
            keys_skipped = summary.keys_skipped,
            origins_added = summary.origins_added,
            active_adopted = summary.active_adopted,
            "Backup imported"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::FileVault;

    fn config() -> Config {
        Config {
            default_origins: vec!["https://elohim.host".into()],
            ..Config::default()
        }
    }

    fn backup_ready() -> Custodian {
        Custodian::in_memory(&config()).unwrap().with_test_kdf()
    }

    #[tokio::test]
    async fn test_first_generated_key_is_active() {
        let custodian = Custodian::in_memory(&config()).unwrap();
        assert!(matches!(
            custodian.active_identifier().await,
            Err(CustodyError::Operation(OperationError::NoActiveKey))
        ));

        let first = custodian.generate_key("first").await.unwrap();
        let second = custodian.generate_key("second").await.unwrap();
        assert_eq!(custodian.active_identifier().await.unwrap(), first.did_key);

        let third = custodian.generate_and_activate("third").await.unwrap();
        assert_eq!(custodian.active_identifier().await.unwrap(), third.did_key);
        assert_eq!(custodian.list_keys().await.len(), 3);
        assert_ne!(second.id, third.id);
    }

    #[tokio::test]
    async fn test_sign_requires_active_key_and_message() {
        let custodian = Custodian::in_memory(&config()).unwrap();
        let err = custodian.sign(b"").await.unwrap_err();
        assert_eq!(err.operation(), Some(OperationError::NoLocalKey));

        custodian.generate_key("k").await.unwrap();
        let err = custodian.sign(b"").await.unwrap_err();
        assert_eq!(err.operation(), Some(OperationError::EmptyMessage));

        let signature = custodian.sign(b"hello").await.unwrap();
        let did = custodian.active_identifier().await.unwrap();
        assert!(crate::keys::verify_payload(&did, b"hello", &signature).unwrap());
    }

    #[tokio::test]
    async fn test_import_key_is_deterministic() {
        let custodian = Custodian::in_memory(&config()).unwrap();
        let secret = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
        let a = custodian.import_key(secret, "a").await.unwrap();
        let b = custodian.import_key(secret, "b").await.unwrap();
        assert_eq!(a.did_key, b.did_key);
        assert_ne!(a.id, b.id);

        assert!(matches!(
            custodian.import_key("nope", "bad").await,
            Err(CustodyError::InvalidKey(_))
        ));
        assert_eq!(custodian.list_keys().await.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_active_clears_pointer() {
        let custodian = Custodian::in_memory(&config()).unwrap();
        let key = custodian.generate_key("k").await.unwrap();
        assert!(custodian.delete_key(&key.id).await.unwrap().is_some());
        assert!(custodian.active_key().await.is_none());
        assert!(custodian.delete_key(&key.id).await.unwrap().is_none());
        assert!(!custodian.set_active(&key.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let vault: Arc<dyn Vault> = Arc::new(FileVault::open(dir.path()).unwrap());

        let (active, origin) = {
            let custodian = Custodian::open(Arc::clone(&vault), &config()).unwrap();
            custodian.generate_key("a").await.unwrap();
            let b = custodian.generate_key("b").await.unwrap();
            custodian.set_active(&b.id).await.unwrap();
            custodian.add_origin("https://app.example").await.unwrap();
            (b, "https://app.example")
        };

        let reopened = Custodian::open(vault, &config()).unwrap();
        assert_eq!(reopened.list_keys().await.len(), 2);
        assert_eq!(reopened.active_key().await.unwrap(), active);
        assert!(reopened.is_allowed(origin).await);
    }

    #[tokio::test]
    async fn test_allowlist_management() {
        let custodian = Custodian::in_memory(&config()).unwrap();
        assert!(custodian.add_origin("https://app.example").await.unwrap());
        assert!(!custodian.add_origin("https://app.example/").await.unwrap());
        assert!(custodian.add_origin("no host").await.is_err());
        assert!(!custodian.remove_origin("https://elohim.host").await.unwrap());

        let exported = custodian.export_allowlist().await.unwrap();
        let other = Custodian::in_memory(&config()).unwrap();
        let outcome = other.import_allowlist(&exported).await.unwrap();
        assert_eq!(outcome.added, 1);
        assert!(other.is_allowed("https://app.example").await);

        let snapshot = custodian.allowed_origins().await;
        assert_eq!(snapshot.defaults, ["https://elohim.host"]);
        assert_eq!(snapshot.user, ["https://app.example"]);
    }

    #[tokio::test]
    async fn test_backup_merge_policy() {
        let source = backup_ready();
        let a = source.generate_key("a").await.unwrap();
        source.generate_key("b").await.unwrap();
        source.add_origin("https://app.example").await.unwrap();
        let archive = source.export_backup("pw").await.unwrap();

        // Target already holds its own active key and a copy of `a`
        let target = backup_ready();
        let own = target.generate_key("own").await.unwrap();
        target.import_backup(&archive, "pw").await.unwrap();
        let again = target.import_backup(&archive, "pw").await.unwrap();
        assert_eq!(again.keys_added, 0);
        assert_eq!(again.keys_skipped, 2);
        assert_eq!(again.origins_added, 0);
        assert!(!again.active_adopted);

        assert_eq!(target.list_keys().await.len(), 3);
        assert_eq!(target.active_key().await.unwrap().id, own.id);

        // Fresh target adopts the archived active pointer
        let fresh = backup_ready();
        let summary = fresh.import_backup(&archive, "pw").await.unwrap();
        assert_eq!(summary.keys_added, 2);
        assert_eq!(summary.origins_added, 1);
        assert!(summary.active_adopted);
        assert_eq!(fresh.active_key().await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_backup_wrong_passphrase_changes_nothing() {
        let source = backup_ready();
        source.generate_key("a").await.unwrap();
        let archive = source.export_backup("right").await.unwrap();

        let target = backup_ready();
        let err = target.import_backup(&archive, "wrong").await.unwrap_err();
        assert!(matches!(err, CustodyError::Decrypt(_)));
        assert!(target.list_keys().await.is_empty());
        assert!(target.allowed_origins().await.user.is_empty());
    }
}
