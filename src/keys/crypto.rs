//! Cryptographic primitives for custodied keys.
//!
//! # Algorithms
//!
//! - **Key Generation**: secp256k1 (OS CSPRNG)
//! - **Signing**: ECDSA over SHA-256, deterministic nonces (RFC 6979),
//!   64-byte compact `r || s` signatures, low-S normalized
//! - **Identifier**: `did:key` with the `secp256k1-pub` multicodec over the
//!   33-byte compressed public key, base58btc multibase (`z` prefix)

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::{CustodyError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Method prefix plus the base58btc multibase marker.
pub const DID_KEY_PREFIX: &str = "did:key:z";

/// Unsigned-varint encoding of the `secp256k1-pub` multicodec (0xe7).
pub const SECP256K1_PUB_MULTICODEC: [u8; 2] = [0xe7, 0x01];

/// secp256k1 private scalar length (32 bytes)
pub const PRIVATE_KEY_LEN: usize = 32;

/// SEC1 compressed public key length (33 bytes)
pub const COMPRESSED_PUBLIC_KEY_LEN: usize = 33;

/// Compact ECDSA signature length (64 bytes)
pub const SIGNATURE_LEN: usize = 64;

// =============================================================================
// Key Generation / Import
// =============================================================================

/// Generate a new secp256k1 signing key.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::random(&mut OsRng)
}

/// Rebuild a signing key from its 32-byte scalar.
pub fn signing_key_from_bytes(bytes: &[u8]) -> Result<SigningKey> {
    if bytes.len() != PRIVATE_KEY_LEN {
        return Err(CustodyError::InvalidKey(format!(
            "expected {} bytes, got {}",
            PRIVATE_KEY_LEN,
            bytes.len()
        )));
    }
    SigningKey::from_slice(bytes)
        .map_err(|_| CustodyError::InvalidKey("scalar out of range".into()))
}

/// Rebuild a signing key from a hex-encoded scalar (optional `0x` prefix).
pub fn signing_key_from_hex(secret_hex: &str) -> Result<SigningKey> {
    let trimmed = secret_hex.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = Zeroizing::new(
        hex::decode(trimmed).map_err(|e| CustodyError::InvalidKey(format!("bad hex: {e}")))?,
    );
    signing_key_from_bytes(&bytes)
}

/// Hex encoding of the private scalar. The caller owns the secret.
pub fn signing_key_to_hex(signing_key: &SigningKey) -> Zeroizing<String> {
    Zeroizing::new(hex::encode(signing_key.to_bytes()))
}

// =============================================================================
// did:key
// =============================================================================

/// Encode a public key as a `did:key` identifier.
pub fn did_key_from_verifying_key(verifying_key: &VerifyingKey) -> String {
    let point = verifying_key.to_encoded_point(true);
    let mut bytes = Vec::with_capacity(SECP256K1_PUB_MULTICODEC.len() + COMPRESSED_PUBLIC_KEY_LEN);
    bytes.extend_from_slice(&SECP256K1_PUB_MULTICODEC);
    bytes.extend_from_slice(point.as_bytes());
    format!("{}{}", DID_KEY_PREFIX, bs58::encode(bytes).into_string())
}

/// The `did:key` identifier of a signing key's public half.
pub fn did_key_for(signing_key: &SigningKey) -> String {
    did_key_from_verifying_key(signing_key.verifying_key())
}

/// Decode a `did:key` identifier back into a secp256k1 public key.
pub fn verifying_key_from_did_key(did: &str) -> Result<VerifyingKey> {
    let encoded = did
        .strip_prefix(DID_KEY_PREFIX)
        .ok_or_else(|| CustodyError::InvalidKey(format!("not a base58btc did:key: {did}")))?;

    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| CustodyError::InvalidKey(format!("bad base58: {e}")))?;

    let key_bytes = bytes
        .strip_prefix(&SECP256K1_PUB_MULTICODEC)
        .ok_or_else(|| CustodyError::InvalidKey("not a secp256k1-pub did:key".into()))?;

    VerifyingKey::from_sec1_bytes(key_bytes)
        .map_err(|_| CustodyError::InvalidKey("invalid secp256k1 public key".into()))
}

// =============================================================================
// Signing / Verification
// =============================================================================

/// Sign a payload, returning the base64 compact signature.
pub fn sign_payload(signing_key: &SigningKey, payload: &[u8]) -> String {
    let signature: Signature = signing_key.sign(payload);
    BASE64.encode(signature.to_bytes())
}

/// Verify a base64 compact signature against a `did:key` identifier.
///
/// An identifier that does not decode is an error. A signature that does
/// not decode, or does not match, is simply `false`.
pub fn verify_payload(did: &str, payload: &[u8], signature_b64: &str) -> Result<bool> {
    let verifying_key = verifying_key_from_did_key(did)?;

    let Ok(sig_bytes) = BASE64.decode(signature_b64.trim()) else {
        return Ok(false);
    };
    if sig_bytes.len() != SIGNATURE_LEN {
        return Ok(false);
    }
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return Ok(false);
    };

    Ok(verifying_key.verify(payload, &signature).is_ok())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_key_shape() {
        let key = generate_signing_key();
        let did = did_key_for(&key);

        // secp256k1 did:keys always start with zQ3s
        assert!(did.starts_with("did:key:zQ3s"), "unexpected did: {did}");
        assert_eq!(did, did_key_for(&key));
    }

    #[test]
    fn test_did_key_round_trip() {
        let key = generate_signing_key();
        let did = did_key_for(&key);
        let decoded = verifying_key_from_did_key(&did).unwrap();
        assert_eq!(&decoded, key.verifying_key());
    }

    #[test]
    fn test_did_key_rejects_other_methods() {
        assert!(verifying_key_from_did_key("did:web:example.com").is_err());
        assert!(verifying_key_from_did_key("did:key:z0OIl").is_err());
        // Ed25519 multicodec (0xed 0x01) is not accepted
        let mut bytes = vec![0xed, 0x01];
        bytes.extend_from_slice(&[7u8; 32]);
        let ed = format!("did:key:z{}", bs58::encode(bytes).into_string());
        assert!(verifying_key_from_did_key(&ed).is_err());
    }

    #[test]
    fn test_hex_import_matches_original() {
        let key = generate_signing_key();
        let hex = signing_key_to_hex(&key);
        let restored = signing_key_from_hex(&format!("0x{}", hex.as_str())).unwrap();
        assert_eq!(did_key_for(&restored), did_key_for(&key));
    }

    #[test]
    fn test_import_rejects_bad_material() {
        assert!(signing_key_from_hex("zz").is_err());
        assert!(signing_key_from_bytes(&[1u8; 31]).is_err());
        assert!(signing_key_from_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let key = generate_signing_key();
        let did = did_key_for(&key);
        let signature = sign_payload(&key, b"Hello, Elohim!");

        assert!(verify_payload(&did, b"Hello, Elohim!", &signature).unwrap());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let key = generate_signing_key();
        let other = generate_signing_key();
        let signature = sign_payload(&key, b"original");

        assert!(!verify_payload(&did_key_for(&key), b"tampered", &signature).unwrap());
        assert!(!verify_payload(&did_key_for(&other), b"original", &signature).unwrap());
    }

    #[test]
    fn test_verify_garbage_signature_is_false() {
        let did = did_key_for(&generate_signing_key());
        assert!(!verify_payload(&did, b"m", "not base64!").unwrap());
        assert!(!verify_payload(&did, b"m", &BASE64.encode([1u8; 10])).unwrap());
        assert!(!verify_payload(&did, b"m", &BASE64.encode([0u8; 64])).unwrap());
    }
}
