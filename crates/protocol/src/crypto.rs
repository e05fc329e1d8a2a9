//! Key material for the line protocol.
//!
//! This module provides RSA key parsing, public key fingerprints, the random
//! challenges exchanged during the handshake and the AES session key material
//! the server hands out once per connection.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Length of a handshake challenge in bytes.
pub const CHALLENGE_LENGTH: usize = 32;

/// Length of the AES-256 session key in bytes.
pub const SESSION_KEY_LENGTH: usize = 32;

/// Length of the counter-mode initialization value in bytes.
pub const SESSION_IV_LENGTH: usize = 16;

/// Number of fingerprint bytes shown in logs.
const FINGERPRINT_LENGTH: usize = 16;

/// Parses an RSA private key from PEM (PKCS#8 or PKCS#1).
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| ProtocolError::InvalidKey(format!("unreadable private key: {}", e)))
}

/// Parses an RSA public key from PEM (SubjectPublicKeyInfo or PKCS#1).
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| ProtocolError::InvalidKey(format!("unreadable public key: {}", e)))
}

/// Generates a human-readable fingerprint of a public key.
///
/// SHA-256 over the DER encoding, truncated to 16 bytes and formatted as
/// colon-separated groups of 4 hex characters.
pub fn fingerprint(public_key: &RsaPublicKey) -> String {
    let der = match public_key.to_public_key_der() {
        Ok(der) => der,
        Err(_) => return "unknown".to_string(),
    };
    let hash = Sha256::digest(der.as_bytes());
    hash[..FINGERPRINT_LENGTH]
        .chunks(2)
        .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
        .collect::<Vec<_>>()
        .join(":")
}

fn decode_fixed<const N: usize>(encoded: &str, what: &str) -> Result<[u8; N]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| ProtocolError::BrokenMessage(format!("{} is not base64: {}", what, e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        ProtocolError::BrokenMessage(format!(
            "{} has {} bytes, expected {}",
            what,
            bytes.len(),
            N
        ))
    })
}

/// A single-use random nonce proving freshness during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge([u8; CHALLENGE_LENGTH]);

impl Challenge {
    /// Generates a fresh challenge from the operating system RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CHALLENGE_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a challenge from raw bytes.
    pub fn from_bytes(bytes: [u8; CHALLENGE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Decodes a base64 challenge as sent on the wire.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        decode_fixed(encoded, "challenge").map(Self)
    }

    /// Returns the raw bytes of this challenge.
    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LENGTH] {
        &self.0
    }

    /// Encodes the challenge as base64 for the wire.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Challenge([REDACTED])")
    }
}

/// AES-256 key and counter-mode IV negotiated for one session.
///
/// Generated by the server once per handshake and never reused.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_LENGTH],
    iv: [u8; SESSION_IV_LENGTH],
}

impl SessionKey {
    /// Generates fresh key material.
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LENGTH];
        let mut iv = [0u8; SESSION_IV_LENGTH];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Creates session key material from raw parts.
    pub fn from_parts(key: [u8; SESSION_KEY_LENGTH], iv: [u8; SESSION_IV_LENGTH]) -> Self {
        Self { key, iv }
    }

    /// Decodes key and IV from their base64 wire form.
    pub fn from_base64(key: &str, iv: &str) -> Result<Self> {
        Ok(Self {
            key: decode_fixed(key, "session key")?,
            iv: decode_fixed(iv, "session iv")?,
        })
    }

    /// Returns the AES key bytes.
    pub fn key(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.key
    }

    /// Returns the initial counter value.
    pub fn iv(&self) -> &[u8; SESSION_IV_LENGTH] {
        &self.iv
    }

    /// Returns the base64 encodings of key and IV.
    pub fn to_base64(&self) -> (String, String) {
        (BASE64.encode(self.key), BASE64.encode(self.iv))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("key", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_keys;
    use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
    use rsa::pkcs8::EncodePrivateKey;

    #[test]
    fn test_challenge_generation_produces_unique_values() {
        let a = Challenge::generate();
        let b = Challenge::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_challenge_base64_roundtrip() {
        let challenge = Challenge::generate();
        let encoded = challenge.to_base64();
        assert_eq!(encoded.len(), 44);
        assert_eq!(Challenge::from_base64(&encoded).unwrap(), challenge);
    }

    #[test]
    fn test_challenge_wrong_length_rejected() {
        let short = BASE64.encode([1u8; 16]);
        let err = Challenge::from_base64(&short).unwrap_err();
        assert!(err.is_broken_message());
    }

    #[test]
    fn test_challenge_invalid_base64_rejected() {
        assert!(Challenge::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_session_key_roundtrip() {
        let session = SessionKey::generate();
        let (key, iv) = session.to_base64();
        assert_eq!(SessionKey::from_base64(&key, &iv).unwrap(), session);
    }

    #[test]
    fn test_session_key_rejects_short_iv() {
        let (key, _) = SessionKey::generate().to_base64();
        let iv = BASE64.encode([0u8; 8]);
        assert!(SessionKey::from_base64(&key, &iv).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let session = SessionKey::from_parts([7u8; 32], [9u8; 16]);
        let debug = format!("{:?}", session);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains('7'));

        let challenge = format!("{:?}", Challenge::from_bytes([1u8; 32]));
        assert!(challenge.contains("REDACTED"));
    }

    #[test]
    fn test_key_pem_formats_accepted() {
        let private = test_keys::alice();
        let public = RsaPublicKey::from(private);

        let pkcs8 = private.to_pkcs8_pem(LineEnding::LF).unwrap();
        let pkcs1 = private.to_pkcs1_pem(LineEnding::LF).unwrap();
        assert_eq!(&private_key_from_pem(&pkcs8).unwrap(), private);
        assert_eq!(&private_key_from_pem(&pkcs1).unwrap(), private);

        let spki = public.to_public_key_pem(LineEnding::LF).unwrap();
        let pkcs1_pub = public.to_pkcs1_pem(LineEnding::LF).unwrap();
        assert_eq!(public_key_from_pem(&spki).unwrap(), public);
        assert_eq!(public_key_from_pem(&pkcs1_pub).unwrap(), public);
    }

    #[test]
    fn test_garbage_pem_is_invalid_key() {
        let err = public_key_from_pem("-----BEGIN PUBLIC KEY-----\nxyz\n").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidKey(_)));
    }

    #[test]
    fn test_fingerprint_format() {
        let public = RsaPublicKey::from(test_keys::alice());
        let fp = fingerprint(&public);

        assert_eq!(fp.len(), 39);
        assert_eq!(fp.matches(':').count(), 7);
        assert_eq!(fp, fingerprint(&public));
        assert_ne!(fp, fingerprint(&RsaPublicKey::from(test_keys::bob())));
    }
}
