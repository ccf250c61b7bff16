//! Custodied keys
//!
//! - `crypto`: secp256k1 generation, import, signing, verification, did:key
//! - `store`: the insertion-ordered key store with its active-key pointer

pub mod crypto;
pub mod store;

pub use crypto::{
    did_key_for, generate_signing_key, sign_payload, signing_key_from_hex, verify_payload,
    verifying_key_from_did_key, DID_KEY_PREFIX, SIGNATURE_LEN,
};
pub use store::{KeyEntry, KeyStore, KeyStoreSnapshot, KeySummary, StoredKey};
