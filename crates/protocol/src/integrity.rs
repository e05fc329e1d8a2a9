//! HMAC integrity for direct peer messages.
//!
//! Private messages travel peer to peer in plaintext, outside the handshake.
//! Both peers hold a secret shared out of band and prefix every line with an
//! HMAC-SHA-256 tag:
//!
//! ```text
//! <hmac-b64> <message>
//! ```
//!
//! The receiver answers with a protected `!ack`, or with a protected
//! `!tampered <message>` when the tag does not verify. A tampered message is
//! still shown to the receiving user; tampering is an outcome, not an error.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Reply body confirming an authentic message.
pub const ACK: &str = "!ack";

/// Command token of the reply to a tampered message.
pub const TAMPERED: &str = "!tampered";

/// Symmetric key shared by two peers.
#[derive(Clone)]
pub struct SharedSecret {
    mac: HmacSha256,
}

impl SharedSecret {
    /// Creates a secret from raw key bytes.
    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(ProtocolError::InvalidKey("shared secret is empty".to_string()));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| ProtocolError::InvalidKey(format!("shared secret: {}", e)))?;
        Ok(Self { mac })
    }

    /// Decodes a hex-encoded secret, ignoring surrounding whitespace.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let key = hex::decode(encoded.trim())
            .map_err(|e| ProtocolError::InvalidKey(format!("shared secret is not hex: {}", e)))?;
        Self::from_bytes(&key)
    }

    fn tag(&self, message: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        mac
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Computes the base64 HMAC of `message`.
pub fn sign(message: &str, key: &SharedSecret) -> String {
    BASE64.encode(key.tag(message).finalize().into_bytes())
}

/// Checks `claimed` against the HMAC of `message` in constant time.
pub fn verify(message: &str, claimed: &str, key: &SharedSecret) -> bool {
    match BASE64.decode(claimed) {
        Ok(tag) => key.tag(message).verify_slice(&tag).is_ok(),
        Err(_) => false,
    }
}

/// A line carrying a tag and a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedMessage {
    /// Base64 HMAC as received (empty if the line had none).
    pub mac: String,
    /// The message body.
    pub body: String,
}

impl ProtectedMessage {
    /// Signs `body` with `key`.
    pub fn seal(body: impl Into<String>, key: &SharedSecret) -> Self {
        let body = body.into();
        Self {
            mac: sign(&body, key),
            body,
        }
    }

    /// Splits a wire line at its first space.
    ///
    /// A line without a space carries no tag and never verifies.
    pub fn parse(line: &str) -> Self {
        match line.split_once(' ') {
            Some((mac, body)) => Self {
                mac: mac.to_string(),
                body: body.to_string(),
            },
            None => Self {
                mac: String::new(),
                body: line.to_string(),
            },
        }
    }

    /// Returns whether the tag matches the body.
    pub fn is_authentic(&self, key: &SharedSecret) -> bool {
        verify(&self.body, &self.mac, key)
    }
}

impl fmt::Display for ProtectedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.mac, self.body)
    }
}

/// Body of the receiver's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The message verified.
    Ack,
    /// The message did not verify; carries the body as received.
    Tampered(String),
}

impl Reply {
    /// Parses a reply body, `None` if it is neither form.
    pub fn parse(body: &str) -> Option<Self> {
        if body == ACK {
            return Some(Reply::Ack);
        }
        body.strip_prefix(TAMPERED)
            .and_then(|rest| rest.strip_prefix(' '))
            .map(|message| Reply::Tampered(message.to_string()))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ack => f.write_str(ACK),
            Reply::Tampered(message) => write!(f, "{} {}", TAMPERED, message),
        }
    }
}

/// What the receiver makes of one incoming line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// The message body, delivered whether or not it verified.
    pub message: String,
    /// Whether the tag verified.
    pub authentic: bool,
    /// The protected reply line to send back.
    pub reply: ProtectedMessage,
}

/// Verifies an incoming line and builds the reply.
pub fn receive(line: &str, key: &SharedSecret) -> Received {
    let incoming = ProtectedMessage::parse(line);
    let authentic = incoming.is_authentic(key);
    let reply = if authentic {
        Reply::Ack
    } else {
        tracing::warn!("Private message failed verification");
        Reply::Tampered(incoming.body.clone())
    };

    Received {
        message: incoming.body,
        authentic,
        reply: ProtectedMessage::seal(reply.to_string(), key),
    }
}

/// Outcome of a delivery, judged from the receiver's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The receiver verified the message.
    Acknowledged,
    /// The receiver reports the message as tampered.
    RejectedAsTampered,
    /// The reply itself failed verification.
    ReplyTampered,
    /// The reply verified but has an unknown body.
    Unexpected(String),
}

impl DeliveryOutcome {
    /// Returns whether the message was delivered intact.
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Acknowledged)
    }
}

/// Judges the receiver's reply line.
pub fn evaluate_reply(line: &str, key: &SharedSecret) -> DeliveryOutcome {
    let reply = ProtectedMessage::parse(line);
    if !reply.is_authentic(key) {
        return DeliveryOutcome::ReplyTampered;
    }
    match Reply::parse(&reply.body) {
        Some(Reply::Ack) => DeliveryOutcome::Acknowledged,
        Some(Reply::Tampered(_)) => DeliveryOutcome::RejectedAsTampered,
        None => DeliveryOutcome::Unexpected(reply.body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SharedSecret {
        SharedSecret::from_hex("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            .unwrap()
    }

    fn other_key() -> SharedSecret {
        SharedSecret::from_bytes(b"a different shared secret").unwrap()
    }

    #[test]
    fn test_sign_then_verify() {
        let key = key();
        let message = "alice: hello bob";
        let mac = sign(message, &key);
        assert_eq!(mac.len(), 44);
        assert!(verify(message, &mac, &key));
        assert!(!verify(message, &mac, &other_key()));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2.
        let key = SharedSecret::from_bytes(b"Jefe").unwrap();
        let expected = hex::decode("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
            .unwrap();
        assert_eq!(sign("what do ya want for nothing?", &key), BASE64.encode(expected));
    }

    #[test]
    fn test_single_byte_flips_fail() {
        let key = key();
        let message = "alice: meet at noon";
        let mac = sign(message, &key);

        for i in 0..message.len() {
            let mut bytes = message.as_bytes().to_vec();
            bytes[i] ^= 0x01;
            let flipped = String::from_utf8(bytes).unwrap();
            assert!(!verify(&flipped, &mac, &key), "flip at {}", i);
        }

        let mut tag = BASE64.decode(&mac).unwrap();
        for i in 0..tag.len() {
            tag[i] ^= 0x80;
            assert!(!verify(message, &BASE64.encode(&tag), &key), "flip at {}", i);
            tag[i] ^= 0x80;
        }
    }

    #[test]
    fn test_garbage_mac_fails() {
        assert!(!verify("hello", "***", &key()));
        assert!(!verify("hello", "", &key()));
    }

    #[test]
    fn test_shared_secret_validation() {
        assert!(SharedSecret::from_hex("").is_err());
        assert!(SharedSecret::from_hex("xyz").is_err());
        assert!(SharedSecret::from_hex("  0a0b0c\n").is_ok());
        assert!(format!("{:?}", key()).contains("REDACTED"));
    }

    #[test]
    fn test_protected_message_splits_at_first_space() {
        let message = ProtectedMessage::parse("tag alice: hi there");
        assert_eq!(message.mac, "tag");
        assert_eq!(message.body, "alice: hi there");

        let bare = ProtectedMessage::parse("nospace");
        assert!(bare.mac.is_empty());
        assert_eq!(bare.body, "nospace");
        assert!(!bare.is_authentic(&key()));
    }

    #[test]
    fn test_sealed_message_verifies() {
        let key = key();
        let sealed = ProtectedMessage::seal("alice: hi", &key);
        let parsed = ProtectedMessage::parse(&sealed.to_string());
        assert_eq!(parsed, sealed);
        assert!(parsed.is_authentic(&key));
    }

    #[test]
    fn test_receive_authentic_message_acks() {
        let key = key();
        let line = ProtectedMessage::seal("alice: hi", &key).to_string();

        let received = receive(&line, &key);
        assert!(received.authentic);
        assert_eq!(received.message, "alice: hi");
        assert_eq!(received.reply.body, "!ack");
        assert!(received.reply.is_authentic(&key));
        assert_eq!(
            evaluate_reply(&received.reply.to_string(), &key),
            DeliveryOutcome::Acknowledged
        );
    }

    #[test]
    fn test_receive_tampered_message_replies_tampered() {
        let key = key();
        let line = ProtectedMessage::seal("alice: pay 10", &key)
            .to_string()
            .replace("10", "99");

        let received = receive(&line, &key);
        assert!(!received.authentic);
        assert_eq!(received.message, "alice: pay 99");
        assert_eq!(received.reply.body, "!tampered alice: pay 99");
        assert!(received.reply.is_authentic(&key));

        let outcome = evaluate_reply(&received.reply.to_string(), &key);
        assert_eq!(outcome, DeliveryOutcome::RejectedAsTampered);
        assert!(!outcome.is_delivered());
    }

    #[test]
    fn test_reply_under_wrong_key_detected() {
        let received = receive(&ProtectedMessage::seal("hi", &key()).to_string(), &key());
        let outcome = evaluate_reply(&received.reply.to_string(), &other_key());
        assert_eq!(outcome, DeliveryOutcome::ReplyTampered);
    }

    #[test]
    fn test_unexpected_reply_body() {
        let key = key();
        let reply = ProtectedMessage::seal("!maybe", &key).to_string();
        assert_eq!(
            evaluate_reply(&reply, &key),
            DeliveryOutcome::Unexpected("!maybe".to_string())
        );
    }

    #[test]
    fn test_reply_parse() {
        assert_eq!(Reply::parse("!ack"), Some(Reply::Ack));
        assert_eq!(
            Reply::parse("!tampered a b"),
            Some(Reply::Tampered("a b".to_string()))
        );
        assert_eq!(Reply::parse("!tampered"), None);
        assert_eq!(Reply::parse("!acknowledged"), None);
    }
}
