//! Line cryptors.
//!
//! A [`Cryptor`] turns one line of plaintext into one line of base64 ciphertext
//! and back. Two variants exist:
//!
//! - [`RsaCryptor`]: RSA-OAEP/SHA-256 envelope with independent encryption and
//!   decryption keys, used for the first two handshake messages.
//! - [`AesCtrCryptor`]: AES-256 in counter mode with the session key material,
//!   used for the third handshake message and all traffic after it.
//!
//! ## Keystream layout
//!
//! Counter mode must never reuse a keystream byte under the same key. In
//! [`KeystreamMode::Sequenced`] every direction owns half of the 128-bit
//! counter space (the responder flips the top bit of the IV) and line `n` of
//! a direction starts at block `base + n * 2^32`:
//!
//! ```text
//! initiator -> responder   IV            + n * 2^32
//! responder -> initiator   IV ^ (1<<127) + n * 2^32
//! ```
//!
//! [`KeystreamMode::Legacy`] restarts the counter at the IV for every line in
//! both directions. That is what deployed peers of the original protocol do
//! and it leaks the XOR of any two lines; it exists for interop only.

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::SessionKey;
use crate::error::{ProtocolError, Result};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Default number of lines one direction may protect with a session key.
pub const DEFAULT_MAX_LINES_PER_KEY: u64 = 1 << 32;

/// Counter blocks reserved for a single line in sequenced mode.
const LINE_STRIDE_BITS: u32 = 32;

/// Top bit of the counter, separating the two directions.
const DIRECTION_BIT: u128 = 1 << 127;

/// Turns single lines of plaintext into single lines of ciphertext and back.
///
/// Neither input nor output may contain a line terminator.
pub trait Cryptor: Send {
    /// Encrypts one plaintext line.
    fn encrypt(&mut self, plaintext: &str) -> Result<String>;

    /// Decrypts one ciphertext line.
    fn decrypt(&mut self, ciphertext: &str) -> Result<String>;

    /// Length of the ciphertext line for `plaintext_len` bytes of plaintext,
    /// when it is known before encrypting.
    fn ciphertext_len(&self, _plaintext_len: usize) -> Option<usize> {
        None
    }
}

/// Which side of the handshake a party plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first message (client).
    Initiator,
    /// Answers the first message (server).
    Responder,
}

/// How the CTR counter is laid out across lines and directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeystreamMode {
    /// Disjoint counter ranges per line and per direction.
    #[default]
    Sequenced,
    /// Counter restarts at the IV for every line (reuses keystream).
    Legacy,
}

/// RSA-OAEP envelope cryptor.
///
/// Encryption uses the peer's public key, decryption the local private key.
/// Either may be absent: the server can only decrypt message 1 before it knows
/// who is talking to it, so it builds a decrypt-only cryptor first and a full
/// one once the username has been resolved.
#[derive(Clone)]
pub struct RsaCryptor {
    encryption_key: Option<RsaPublicKey>,
    decryption_key: Option<RsaPrivateKey>,
}

impl RsaCryptor {
    /// Creates a cryptor that encrypts to `peer` and decrypts with `own`.
    pub fn new(peer: RsaPublicKey, own: RsaPrivateKey) -> Self {
        Self {
            encryption_key: Some(peer),
            decryption_key: Some(own),
        }
    }

    /// Creates a cryptor that can only decrypt.
    pub fn decrypt_only(own: RsaPrivateKey) -> Self {
        Self {
            encryption_key: None,
            decryption_key: Some(own),
        }
    }

    /// Creates a cryptor that can only encrypt.
    pub fn encrypt_only(peer: RsaPublicKey) -> Self {
        Self {
            encryption_key: Some(peer),
            decryption_key: None,
        }
    }
}

impl Cryptor for RsaCryptor {
    fn encrypt(&mut self, plaintext: &str) -> Result<String> {
        let key = self
            .encryption_key
            .as_ref()
            .ok_or_else(|| ProtocolError::InvalidKey("no encryption key set".to_string()))?;

        let encrypted = key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext.as_bytes())
            .map_err(|e| ProtocolError::BrokenMessage(format!("rsa encryption: {}", e)))?;
        Ok(BASE64.encode(encrypted))
    }

    fn decrypt(&mut self, ciphertext: &str) -> Result<String> {
        let key = self
            .decryption_key
            .as_ref()
            .ok_or_else(|| ProtocolError::InvalidKey("no decryption key set".to_string()))?;

        let data = BASE64.decode(ciphertext)?;
        let decrypted = key
            .decrypt(Oaep::new::<Sha256>(), &data)
            .map_err(|e| ProtocolError::BrokenMessage(format!("rsa decryption: {}", e)))?;
        Ok(String::from_utf8(decrypted)?)
    }
}

impl std::fmt::Debug for RsaCryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaCryptor")
            .field("can_encrypt", &self.encryption_key.is_some())
            .field("can_decrypt", &self.decryption_key.is_some())
            .finish()
    }
}

/// Per-direction counter state.
#[derive(Clone)]
struct Direction {
    base: u128,
    lines: u64,
}

impl Direction {
    fn new(base: u128) -> Self {
        Self { base, lines: 0 }
    }

    /// Claims the counter block for the next line.
    fn next_counter(&mut self, mode: KeystreamMode, limit: u64) -> Result<u128> {
        if self.lines >= limit {
            return Err(ProtocolError::KeystreamExhausted { limit });
        }
        let line = u128::from(self.lines);
        self.lines += 1;

        Ok(match mode {
            KeystreamMode::Sequenced => self.base.wrapping_add(line << LINE_STRIDE_BITS),
            KeystreamMode::Legacy => self.base,
        })
    }
}

/// AES-256-CTR cryptor holding the session key material.
#[derive(Clone)]
pub struct AesCtrCryptor {
    key: [u8; 32],
    outbound: Direction,
    inbound: Direction,
    mode: KeystreamMode,
    max_lines: u64,
}

impl AesCtrCryptor {
    /// Creates a cryptor for one side of a session.
    pub fn new(session: &SessionKey, role: Role, mode: KeystreamMode, max_lines: u64) -> Self {
        let iv = u128::from_be_bytes(*session.iv());
        let (initiator, responder) = match mode {
            KeystreamMode::Sequenced => (iv, iv ^ DIRECTION_BIT),
            KeystreamMode::Legacy => (iv, iv),
        };
        let (outbound, inbound) = match role {
            Role::Initiator => (initiator, responder),
            Role::Responder => (responder, initiator),
        };

        if mode == KeystreamMode::Legacy {
            tracing::warn!("Legacy keystream mode reuses the counter for every line");
        }

        Self {
            key: *session.key(),
            outbound: Direction::new(outbound),
            inbound: Direction::new(inbound),
            mode,
            max_lines,
        }
    }

    /// Returns the number of lines encrypted so far.
    pub fn lines_sent(&self) -> u64 {
        self.outbound.lines
    }

    /// Returns the number of lines decrypted (or dropped) so far.
    pub fn lines_received(&self) -> u64 {
        self.inbound.lines
    }

    fn apply(&self, counter: u128, data: &mut [u8]) -> Result<()> {
        let mut cipher = Aes256Ctr::new_from_slices(&self.key, &counter.to_be_bytes())
            .map_err(|e| ProtocolError::InvalidKey(format!("aes key/iv: {}", e)))?;
        cipher
            .try_apply_keystream(data)
            .map_err(|e| ProtocolError::BrokenMessage(format!("aes keystream: {}", e)))
    }
}

impl Cryptor for AesCtrCryptor {
    fn encrypt(&mut self, plaintext: &str) -> Result<String> {
        let counter = self.outbound.next_counter(self.mode, self.max_lines)?;
        let mut data = plaintext.as_bytes().to_vec();
        self.apply(counter, &mut data)?;
        Ok(BASE64.encode(data))
    }

    fn decrypt(&mut self, ciphertext: &str) -> Result<String> {
        // Only well-formed ciphertext uses up a line number. A tampered line
        // still does, so the peer's following lines keep lining up.
        let mut data = BASE64.decode(ciphertext)?;
        let counter = self.inbound.next_counter(self.mode, self.max_lines)?;
        self.apply(counter, &mut data)?;
        Ok(String::from_utf8(data)?)
    }

    fn ciphertext_len(&self, plaintext_len: usize) -> Option<usize> {
        Some(plaintext_len.div_ceil(3) * 4)
    }
}

impl std::fmt::Debug for AesCtrCryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCtrCryptor")
            .field("key", &"[REDACTED]")
            .field("mode", &self.mode)
            .field("lines_sent", &self.outbound.lines)
            .field("lines_received", &self.inbound.lines)
            .finish()
    }
}
