//! Key store
//!
//! Insertion-ordered key entries plus the active-key pointer. The store is
//! a plain state machine; persistence and locking live in the custodian.
//!
//! # Invariants
//!
//! - `active_key_id`, when set, always names an entry in `entries`
//! - entries are never mutated after creation, only deleted
//! - the very first entry ever added is activated automatically

use std::fmt;

use chrono::{DateTime, Utc};
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::crypto::{did_key_for, sign_payload, signing_key_from_hex, signing_key_to_hex};
use crate::error::{CustodyError, Result};

// =============================================================================
// Key Entry
// =============================================================================

/// A custodied key.
///
/// The private half never leaves this type except through
/// [`KeyEntry::to_stored`], which is used for the vault and for backups.
#[derive(Clone)]
pub struct KeyEntry {
    pub id: String,
    pub alias: String,
    signing_key: SigningKey,
    pub public_identifier: String,
    pub created_at: DateTime<Utc>,
}

impl KeyEntry {
    fn new(id: String, alias: &str, signing_key: SigningKey) -> Self {
        let public_identifier = did_key_for(&signing_key);
        Self {
            id,
            alias: alias.to_string(),
            signing_key,
            public_identifier,
            created_at: Utc::now(),
        }
    }

    /// Sign with this entry's private key (base64 compact signature).
    pub fn sign(&self, payload: &[u8]) -> String {
        sign_payload(&self.signing_key, payload)
    }

    /// Public view of this entry.
    pub fn summary(&self) -> KeySummary {
        KeySummary {
            id: self.id.clone(),
            alias: self.alias.clone(),
            did_key: self.public_identifier.clone(),
            created_at: self.created_at,
        }
    }

    /// Serializable form, including the private scalar.
    pub fn to_stored(&self) -> StoredKey {
        StoredKey {
            id: self.id.clone(),
            alias: self.alias.clone(),
            private_key: signing_key_to_hex(&self.signing_key).to_string(),
            did_key: self.public_identifier.clone(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("public_identifier", &self.public_identifier)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Key metadata safe to show to the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySummary {
    pub id: String,
    pub alias: String,
    pub did_key: String,
    pub created_at: DateTime<Utc>,
}

/// Serialized key entry. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct StoredKey {
    pub id: String,
    pub alias: String,
    pub private_key: String,
    pub did_key: String,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl StoredKey {
    /// Rebuild the entry, checking that the stored identifier still derives
    /// from the stored private key.
    pub fn to_entry(&self) -> Result<KeyEntry> {
        if self.id.is_empty() {
            return Err(CustodyError::InvalidKey("entry without id".into()));
        }
        let signing_key = signing_key_from_hex(&self.private_key)?;
        let derived = did_key_for(&signing_key);
        if derived != self.did_key {
            return Err(CustodyError::InvalidKey(format!(
                "identifier mismatch for key {}",
                self.id
            )));
        }
        Ok(KeyEntry {
            id: self.id.clone(),
            alias: self.alias.clone(),
            signing_key,
            public_identifier: derived,
            created_at: self.created_at,
        })
    }
}

impl fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKey")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("did_key", &self.did_key)
            .finish_non_exhaustive()
    }
}

/// Serialized key store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStoreSnapshot {
    pub keys: Vec<StoredKey>,
    pub active_key_id: Option<String>,
    /// Whether any entry has ever been added. Drives first-entry activation.
    #[serde(default)]
    pub populated: bool,
}

// =============================================================================
// Key Store
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    entries: Vec<KeyEntry>,
    active_key_id: Option<String>,
    populated: bool,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> &[KeyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn active_key_id(&self) -> Option<&str> {
        self.active_key_id.as_deref()
    }

    pub fn get_active(&self) -> Option<&KeyEntry> {
        self.active_key_id.as_deref().and_then(|id| self.get(id))
    }

    /// Store a new key under a fresh id.
    ///
    /// The entry becomes active only if it is the first entry this store
    /// has ever held.
    pub fn add(&mut self, signing_key: SigningKey, alias: &str) -> &KeyEntry {
        let mut id = Uuid::new_v4().to_string();
        while self.contains(&id) {
            id = Uuid::new_v4().to_string();
        }

        let entry = KeyEntry::new(id, alias, signing_key);
        debug!(id = %entry.id, did = %entry.public_identifier, "Key added");

        if !self.populated {
            self.active_key_id = Some(entry.id.clone());
        }
        self.populated = true;
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Insert an entry under its existing id, as a backup merge does.
    ///
    /// Returns `false` and leaves the store untouched if the id is taken.
    /// Never changes the active pointer.
    pub fn insert_preserving_id(&mut self, entry: KeyEntry) -> bool {
        if self.contains(&entry.id) {
            return false;
        }
        self.populated = true;
        self.entries.push(entry);
        true
    }

    /// Remove an entry. If it was active, the active pointer is cleared in
    /// the same step.
    pub fn delete(&mut self, id: &str) -> Option<KeyEntry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        let removed = self.entries.remove(index);
        if self.active_key_id.as_deref() == Some(id) {
            self.active_key_id = None;
        }
        debug!(id = %id, "Key deleted");
        Some(removed)
    }

    /// Activate an entry. Unknown ids are ignored.
    pub fn set_active(&mut self, id: &str) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.active_key_id = Some(id.to_string());
        true
    }

    /// Take over an incoming active pointer, but only when this store has
    /// none and the id is present.
    pub fn adopt_active(&mut self, id: Option<&str>) -> bool {
        match id {
            Some(id) if self.active_key_id.is_none() => self.set_active(id),
            _ => false,
        }
    }

    pub fn snapshot(&self) -> KeyStoreSnapshot {
        KeyStoreSnapshot {
            keys: self.entries.iter().map(KeyEntry::to_stored).collect(),
            active_key_id: self.active_key_id.clone(),
            populated: self.populated,
        }
    }

    /// Rebuild a store from a snapshot.
    ///
    /// Any entry that fails to decode fails the whole restore; a dangling
    /// active pointer is cleared.
    pub fn restore(snapshot: &KeyStoreSnapshot) -> Result<Self> {
        let mut store = Self::new();
        for stored in &snapshot.keys {
            let entry = stored.to_entry()?;
            if !store.insert_preserving_id(entry) {
                warn!(id = %stored.id, "Duplicate key id in snapshot, keeping first");
            }
        }
        store.populated = snapshot.populated || !store.is_empty();

        if let Some(id) = snapshot.active_key_id.as_deref() {
            if !store.set_active(id) {
                warn!(id = %id, "Active key missing from snapshot, clearing");
            }
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::crypto::generate_signing_key;

    #[test]
    fn test_lifecycle_scenario() {
        let mut store = KeyStore::new();
        assert!(store.get_active().is_none());

        let a = store.add(generate_signing_key(), "Alice").id.clone();
        assert_eq!(store.active_key_id(), Some(a.as_str()));

        let b = store.add(generate_signing_key(), "Bob").id.clone();
        assert_eq!(store.active_key_id(), Some(a.as_str()));

        assert!(store.set_active(&b));
        assert!(store.delete(&a).is_some());
        assert_eq!(store.active_key_id(), Some(b.as_str()));
        assert_eq!(store.len(), 1);

        assert!(store.delete(&b).is_some());
        assert!(store.active_key_id().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_only_first_entry_ever_auto_activates() {
        let mut store = KeyStore::new();
        let a = store.add(generate_signing_key(), "a").id.clone();
        store.delete(&a);

        store.add(generate_signing_key(), "b");
        assert!(store.get_active().is_none());
    }

    #[test]
    fn test_set_active_unknown_is_noop() {
        let mut store = KeyStore::new();
        let a = store.add(generate_signing_key(), "a").id.clone();
        assert!(!store.set_active("missing"));
        assert_eq!(store.active_key_id(), Some(a.as_str()));
    }

    #[test]
    fn test_delete_unknown() {
        let mut store = KeyStore::new();
        store.add(generate_signing_key(), "a");
        assert!(store.delete("missing").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_insertion_order() {
        let mut store = KeyStore::new();
        for alias in ["one", "two", "three"] {
            store.add(generate_signing_key(), alias);
        }
        let aliases: Vec<_> = store.list().iter().map(|e| e.alias.as_str()).collect();
        assert_eq!(aliases, ["one", "two", "three"]);
    }

    #[test]
    fn test_insert_preserving_id_never_overwrites() {
        let mut store = KeyStore::new();
        let original = store.add(generate_signing_key(), "original").clone();

        let mut other = KeyStore::new();
        let mut clash = other.add(generate_signing_key(), "clash").clone();
        clash.id = original.id.clone();

        assert!(!store.insert_preserving_id(clash));
        assert_eq!(store.get(&original.id).unwrap().alias, "original");
    }

    #[test]
    fn test_adopt_active_only_when_unset() {
        let mut store = KeyStore::new();
        let a = store.add(generate_signing_key(), "a").id.clone();
        let b = store.add(generate_signing_key(), "b").id.clone();

        assert!(!store.adopt_active(Some(&b)));
        assert_eq!(store.active_key_id(), Some(a.as_str()));

        store.delete(&a);
        assert!(store.adopt_active(Some(&b)));
        assert_eq!(store.active_key_id(), Some(b.as_str()));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut store = KeyStore::new();
        store.add(generate_signing_key(), "a");
        store.add(generate_signing_key(), "b");

        let json = serde_json::to_string(&store.snapshot()).unwrap();
        let restored = KeyStore::restore(&serde_json::from_str(&json).unwrap()).unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.active_key_id(), store.active_key_id());
        for (x, y) in store.list().iter().zip(restored.list()) {
            assert_eq!(x.summary(), y.summary());
        }
        assert_eq!(restored.list()[0].sign(b"m"), store.list()[0].sign(b"m"));
    }

    #[test]
    fn test_restore_rejects_identifier_mismatch() {
        let mut store = KeyStore::new();
        store.add(generate_signing_key(), "a");
        let mut snapshot = store.snapshot();
        snapshot.keys[0].did_key = did_key_for(&generate_signing_key());

        assert!(KeyStore::restore(&snapshot).is_err());
    }

    #[test]
    fn test_restore_clears_dangling_active() {
        let snapshot = KeyStoreSnapshot {
            keys: Vec::new(),
            active_key_id: Some("ghost".into()),
            populated: true,
        };
        let store = KeyStore::restore(&snapshot).unwrap();
        assert!(store.active_key_id().is_none());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let mut store = KeyStore::new();
        let entry = store.add(generate_signing_key(), "a").clone();
        let stored = entry.to_stored();
        let debug = format!("{entry:?} {stored:?}");
        assert!(!debug.contains(&stored.private_key));
    }
}
