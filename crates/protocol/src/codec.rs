//! Line channels.
//!
//! A channel is a [`Framed`] byte stream. The raw channel frames newline
//! terminated UTF-8 lines with [`LinesCodec`]; the encrypted channel wraps that
//! codec in a [`CryptoLineCodec`], which runs every line through a [`Cryptor`]
//! before it reaches the parent codec and after it leaves it.
//!
//! Upgrading a connection in place is a codec swap:
//!
//! ```ignore
//! let raw = raw_channel(stream);
//! let secure = upgrade(raw, cryptor, BrokenMessagePolicy::Drop);
//! ```
//!
//! [`Framed::map_codec`] keeps the read buffer, so lines the peer sent right
//! after the handshake are not lost.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};

use crate::cryptor::{AesCtrCryptor, Cryptor};
use crate::error::{ProtocolError, Result};

/// Maximum length of a single wire line in bytes (terminator excluded).
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Plaintext line channel over a byte stream.
pub type RawChannel<S> = Framed<S, LinesCodec>;

/// Channel encrypting every line with the negotiated session key.
pub type SecureChannel<S> = Framed<S, CryptoLineCodec<AesCtrCryptor>>;

/// Wraps a byte stream into a raw line channel.
pub fn raw_channel<S>(stream: S) -> RawChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(stream, line_codec())
}

/// Decorates a raw channel with a cryptor.
pub fn upgrade<S, C>(
    channel: RawChannel<S>,
    cryptor: C,
    policy: BrokenMessagePolicy,
) -> Framed<S, CryptoLineCodec<C>>
where
    C: Cryptor,
{
    channel.map_codec(|lines| CryptoLineCodec::wrap(lines, cryptor, policy))
}

fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}

/// What an encrypted channel does with a line it cannot decrypt or encrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokenMessagePolicy {
    /// Log and skip the line, keep the channel open.
    #[default]
    Drop,
    /// Return the error to the caller.
    Fail,
}

/// Codec decorator that encrypts outgoing and decrypts incoming lines.
#[derive(Debug)]
pub struct CryptoLineCodec<C> {
    lines: LinesCodec,
    cryptor: C,
    policy: BrokenMessagePolicy,
    dropped: u64,
}

impl<C: Cryptor> CryptoLineCodec<C> {
    /// Creates a codec with its own line framing.
    pub fn new(cryptor: C, policy: BrokenMessagePolicy) -> Self {
        Self::wrap(line_codec(), cryptor, policy)
    }

    /// Decorates an existing line codec.
    pub fn wrap(lines: LinesCodec, cryptor: C, policy: BrokenMessagePolicy) -> Self {
        Self {
            lines,
            cryptor,
            policy,
            dropped: 0,
        }
    }

    /// Replaces the cryptor, keeping framing state and counters.
    pub fn with_cryptor<D: Cryptor>(self, cryptor: D) -> CryptoLineCodec<D> {
        CryptoLineCodec {
            lines: self.lines,
            cryptor,
            policy: self.policy,
            dropped: self.dropped,
        }
    }

    /// Removes the decorator, returning the parent codec.
    pub fn into_inner(self) -> LinesCodec {
        self.lines
    }

    /// Returns the broken-message policy.
    pub fn policy(&self) -> BrokenMessagePolicy {
        self.policy
    }

    /// Changes the broken-message policy.
    pub fn set_policy(&mut self, policy: BrokenMessagePolicy) {
        self.policy = policy;
    }

    /// Number of lines dropped under [`BrokenMessagePolicy::Drop`].
    pub fn dropped_lines(&self) -> u64 {
        self.dropped
    }

    /// Returns the cryptor.
    pub fn cryptor(&self) -> &C {
        &self.cryptor
    }

    /// Applies the policy to a failed line. `Ok(())` means the line is skipped.
    fn absorb(&mut self, err: ProtocolError, direction: &'static str) -> Result<()> {
        if self.policy == BrokenMessagePolicy::Drop && err.is_broken_message() {
            self.dropped += 1;
            tracing::warn!(
                direction,
                error = %err,
                dropped = self.dropped,
                "Dropping broken line"
            );
            return Ok(());
        }
        Err(err)
    }

    fn open(&mut self, line: String) -> Result<Option<String>> {
        match self.cryptor.decrypt(&line) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(e) => self.absorb(e, "inbound").map(|()| None),
        }
    }

    /// Handles a framing error. The line codec has already consumed a line
    /// that is not UTF-8, so that one is treated as a broken line.
    fn unframed(&mut self, err: LinesCodecError) -> Result<()> {
        match err {
            LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                let err = ProtocolError::BrokenMessage(format!("line is not utf-8: {}", e));
                self.absorb(err, "inbound")
            }
            other => Err(other.into()),
        }
    }
}

impl<C: Cryptor> Decoder for CryptoLineCodec<C> {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) => {
                    if let Some(plaintext) = self.open(line)? {
                        return Ok(Some(plaintext));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => self.unframed(e)?,
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        loop {
            match self.lines.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(plaintext) = self.open(line)? {
                        return Ok(Some(plaintext));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => self.unframed(e)?,
            }
        }
    }
}

impl<C, T> Encoder<T> for CryptoLineCodec<C>
where
    C: Cryptor,
    T: AsRef<str>,
{
    type Error = ProtocolError;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<()> {
        let line = line.as_ref();
        if line.contains(['\n', '\r']) {
            return Err(ProtocolError::InvalidArgument(
                "line contains a line terminator".to_string(),
            ));
        }

        // Checked before encrypting, which would use up a line number the
        // peer never sees.
        if let Some(len) = self.cryptor.ciphertext_len(line.len()) {
            if len > MAX_LINE_LENGTH {
                return Err(ProtocolError::LineTooLong {
                    max: MAX_LINE_LENGTH,
                });
            }
        }
        match self.cryptor.encrypt(line) {
            Ok(ciphertext) => {
                if ciphertext.len() > MAX_LINE_LENGTH {
                    return Err(ProtocolError::LineTooLong {
                        max: MAX_LINE_LENGTH,
                    });
                }
                self.lines.encode(ciphertext, dst)?;
                Ok(())
            }
            Err(e) => self.absorb(e, "outbound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;
    use crate::cryptor::{KeystreamMode, Role, DEFAULT_MAX_LINES_PER_KEY};
    use futures_util::{SinkExt, StreamExt};

    /// Reverses the line; fails on anything starting with `bad`.
    struct Mirror;

    impl Cryptor for Mirror {
        fn encrypt(&mut self, plaintext: &str) -> Result<String> {
            if plaintext.starts_with("bad") {
                return Err(ProtocolError::BrokenMessage("refused".to_string()));
            }
            Ok(plaintext.chars().rev().collect())
        }

        fn decrypt(&mut self, ciphertext: &str) -> Result<String> {
            if ciphertext.starts_with("bad") {
                return Err(ProtocolError::BrokenMessage("refused".to_string()));
            }
            Ok(ciphertext.chars().rev().collect())
        }
    }

    fn aes_pair() -> (AesCtrCryptor, AesCtrCryptor) {
        let session = SessionKey::generate();
        let mode = KeystreamMode::Sequenced;
        (
            AesCtrCryptor::new(&session, Role::Initiator, mode, DEFAULT_MAX_LINES_PER_KEY),
            AesCtrCryptor::new(&session, Role::Responder, mode, DEFAULT_MAX_LINES_PER_KEY),
        )
    }

    #[test]
    fn test_encode_writes_one_line() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Fail);
        let mut buf = BytesMut::new();
        codec.encode("abc", &mut buf).unwrap();
        assert_eq!(&buf[..], b"cba\n");
    }

    #[test]
    fn test_encode_rejects_terminator() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Drop);
        let mut buf = BytesMut::new();
        let err = codec.encode("a\nb", &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgument(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_full_line() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Fail);
        let mut buf = BytesMut::from(&b"olle"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"h\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn test_drop_policy_skips_broken_lines() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Drop);
        let mut buf = BytesMut::from(&b"bad one\nbad two\nko\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("ok"));
        assert_eq!(codec.dropped_lines(), 2);
    }

    #[test]
    fn test_fail_policy_returns_broken_message() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Fail);
        let mut buf = BytesMut::from(&b"bad\nko\n"[..]);
        assert!(codec.decode(&mut buf).unwrap_err().is_broken_message());
        assert_eq!(codec.dropped_lines(), 0);
    }

    #[test]
    fn test_drop_policy_on_encode() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Drop);
        let mut buf = BytesMut::new();
        codec.encode("bad line", &mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(codec.dropped_lines(), 1);

        codec.set_policy(BrokenMessagePolicy::Fail);
        assert!(codec.encode("bad line", &mut buf).is_err());
    }

    #[test]
    fn test_decode_eof_without_terminator() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Fail);
        let mut buf = BytesMut::from(&b"tsal"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("last"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_overlong_line_is_rejected() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Drop);
        let mut buf = BytesMut::from(vec![b'a'; MAX_LINE_LENGTH + 10].as_slice());
        buf.extend_from_slice(b"\n");
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong { .. }));
    }

    #[test]
    fn test_with_cryptor_keeps_counters() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Drop);
        let mut buf = BytesMut::from(&b"bad\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let (aes, _) = aes_pair();
        let codec = codec.with_cryptor(aes);
        assert_eq!(codec.dropped_lines(), 1);
        assert_eq!(codec.policy(), BrokenMessagePolicy::Drop);
    }

    #[tokio::test]
    async fn test_encrypted_channel_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let (client_cryptor, server_cryptor) = aes_pair();
        let mut client = upgrade(raw_channel(a), client_cryptor, BrokenMessagePolicy::Fail);
        let mut server = upgrade(raw_channel(b), server_cryptor, BrokenMessagePolicy::Fail);

        client.send("hello server").await.unwrap();
        client.send("").await.unwrap();
        assert_eq!(server.next().await.unwrap().unwrap(), "hello server");
        assert_eq!(server.next().await.unwrap().unwrap(), "");

        server.send("hello client").await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), "hello client");

        drop(client);
        assert!(server.next().await.is_none());
    }

    #[tokio::test]
    async fn test_upgrade_keeps_buffered_lines() {
        let (a, b) = tokio::io::duplex(4096);
        let (client_cryptor, server_cryptor) = aes_pair();

        let mut client = upgrade(raw_channel(a), client_cryptor, BrokenMessagePolicy::Fail);
        let mut server = raw_channel(b);

        // Both lines arrive in a single read on the raw channel.
        let mut wire = BytesMut::new();
        let mut plain = LinesCodec::new();
        plain.encode("plaintext", &mut wire).unwrap();
        client.codec_mut().encode("secret", &mut wire).unwrap();
        tokio::io::AsyncWriteExt::write_all(client.get_mut(), &wire)
            .await
            .unwrap();

        assert_eq!(server.next().await.unwrap().unwrap(), "plaintext");
        let mut server = upgrade(server, server_cryptor, BrokenMessagePolicy::Fail);
        assert_eq!(server.next().await.unwrap().unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_dropped_line_keeps_channel_usable() {
        let (a, b) = tokio::io::duplex(4096);
        let (client_cryptor, server_cryptor) = aes_pair();

        let mut client = upgrade(raw_channel(a), client_cryptor, BrokenMessagePolicy::Fail);
        let mut server = upgrade(raw_channel(b), server_cryptor, BrokenMessagePolicy::Drop);

        // Garbage base64 is dropped, the channel keeps reading.
        tokio::io::AsyncWriteExt::write_all(client.get_mut(), b"%%%\n")
            .await
            .unwrap();
        client.send("after garbage").await.unwrap();
        assert_eq!(server.next().await.unwrap().unwrap(), "after garbage");
        assert_eq!(server.codec().dropped_lines(), 1);

        drop(client);
        assert!(server.next().await.is_none());
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_dropped() {
        let (a, b) = tokio::io::duplex(4096);
        let (client_cryptor, server_cryptor) = aes_pair();

        let mut client = upgrade(raw_channel(a), client_cryptor, BrokenMessagePolicy::Fail);
        let mut server = upgrade(raw_channel(b), server_cryptor, BrokenMessagePolicy::Drop);

        tokio::io::AsyncWriteExt::write_all(client.get_mut(), b"\xff\xfe\n")
            .await
            .unwrap();
        client.send("after").await.unwrap();
        assert_eq!(server.next().await.unwrap().unwrap(), "after");
        assert_eq!(server.codec().dropped_lines(), 1);
        assert_eq!(server.codec().cryptor().lines_received(), 1);
    }

    #[test]
    fn test_non_utf8_line_fails_under_fail_policy() {
        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Fail);
        let mut buf = BytesMut::from(&b"\xff\xfe\nko\n"[..]);
        assert!(codec.decode(&mut buf).unwrap_err().is_broken_message());

        let mut codec = CryptoLineCodec::new(Mirror, BrokenMessagePolicy::Drop);
        let mut buf = BytesMut::from(&b"\xff"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert_eq!(codec.dropped_lines(), 1);
    }

    #[tokio::test]
    async fn test_oversize_line_does_not_desync_session() {
        let (a, b) = tokio::io::duplex(1 << 17);
        let (client_cryptor, server_cryptor) = aes_pair();

        let mut client = upgrade(raw_channel(a), client_cryptor, BrokenMessagePolicy::Fail);
        let mut server = upgrade(raw_channel(b), server_cryptor, BrokenMessagePolicy::Drop);

        let err = client.send("x".repeat(50_000)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong { max: MAX_LINE_LENGTH }));
        assert_eq!(client.codec().cryptor().lines_sent(), 0);

        client.send("hello").await.unwrap();
        assert_eq!(server.next().await.unwrap().unwrap(), "hello");
        assert_eq!(server.codec().dropped_lines(), 0);

        // The largest line that still fits goes through.
        let fits = "y".repeat(MAX_LINE_LENGTH / 4 * 3);
        client.send(fits.as_str()).await.unwrap();
        assert_eq!(server.next().await.unwrap().unwrap(), fits);
    }
}
