//! Challenge-response handshake.
//!
//! The handshake runs once per connection on both sides and upgrades a raw
//! line channel into a [`SecureChannel`]. Exactly three lines cross the wire,
//! each under its own cryptor:
//!
//! ```text
//! client                                              server
//!   -- RSA(server) "!authenticate <user> <c1>" ------->   lookup(user)
//!   <- RSA(user)   "!ok <c1> <c2> <key> <iv>" ---------
//!   -- AES(key,iv) "<c2>" ---------------------------->   c2 matches
//! ```
//!
//! Any failure ends in [`ProtocolError::HandshakeFailed`] carrying the cause,
//! returned in a [`Rejected`] together with the raw channel. The server writes
//! nothing before message 1 has been validated. Closing the connection is left
//! to the caller; dropping the [`Rejected`] does it. Nothing is retried.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, Stream, StreamExt};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::io::{AsyncRead, AsyncWrite};

use tokio_util::codec::Framed;

use crate::codec::{upgrade, BrokenMessagePolicy, CryptoLineCodec, RawChannel, SecureChannel};
use crate::crypto::{fingerprint, Challenge, SessionKey};
use crate::cryptor::{
    AesCtrCryptor, Cryptor, KeystreamMode, Role, RsaCryptor, DEFAULT_MAX_LINES_PER_KEY,
};
use crate::error::{ProtocolError, Result};
use crate::messages::{validate_username, Authenticate, ServerOk};

/// Resolves usernames to their registered public keys.
///
/// The directory is trusted: keys are provisioned out of band and unknown
/// users are rejected.
pub trait UserDirectory: Send + Sync {
    /// Returns the public key registered for `username`.
    fn lookup(&self, username: &str) -> Option<RsaPublicKey>;
}

impl UserDirectory for HashMap<String, RsaPublicKey> {
    fn lookup(&self, username: &str) -> Option<RsaPublicKey> {
        self.get(username).cloned()
    }
}

impl<T: UserDirectory + ?Sized> UserDirectory for Arc<T> {
    fn lookup(&self, username: &str) -> Option<RsaPublicKey> {
        (**self).lookup(username)
    }
}

/// State of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Nothing sent or received yet.
    Start,
    /// Client: message 1 written.
    SentClientAuth,
    /// Server: waiting for message 1.
    AwaitingClientAuth,
    /// Client: waiting for message 2.
    AwaitingServerOk,
    /// Server: message 2 written, waiting for message 3.
    SentServerOk,
    /// Handshake complete, the channel is symmetric.
    Established,
    /// Handshake aborted.
    Failed,
}

/// Settings for the channel produced by a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Policy of the established channel. The handshake itself always fails
    /// on broken lines.
    pub broken_message_policy: BrokenMessagePolicy,
    /// Counter layout of the symmetric cryptor.
    pub keystream_mode: KeystreamMode,
    /// Per-direction line limit of the session key.
    pub max_lines_per_key: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            broken_message_policy: BrokenMessagePolicy::Drop,
            keystream_mode: KeystreamMode::Sequenced,
            max_lines_per_key: DEFAULT_MAX_LINES_PER_KEY,
        }
    }
}

impl SessionOptions {
    fn cryptor(&self, session: &SessionKey, role: Role) -> AesCtrCryptor {
        AesCtrCryptor::new(session, role, self.keystream_mode, self.max_lines_per_key)
    }
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct Established<S> {
    /// The encrypted channel.
    pub channel: SecureChannel<S>,
    /// The authenticated user of this session.
    pub username: String,
}

/// A failed handshake, handing the connection back in plain line framing.
pub struct Rejected<S> {
    /// Always a [`ProtocolError::HandshakeFailed`].
    pub error: ProtocolError,
    /// The raw channel the handshake ran over.
    pub channel: RawChannel<S>,
}

impl<S> Rejected<S> {
    fn new<C: Cryptor>(error: ProtocolError, channel: Framed<S, CryptoLineCodec<C>>) -> Self {
        Self {
            error,
            channel: channel.map_codec(CryptoLineCodec::into_inner),
        }
    }

    /// Drops the channel, closing the connection, and returns the error.
    pub fn into_error(self) -> ProtocolError {
        self.error
    }
}

impl<S> std::fmt::Debug for Rejected<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<S> From<Rejected<S>> for ProtocolError {
    fn from(rejected: Rejected<S>) -> Self {
        rejected.error
    }
}

/// Outcome of running one side of the handshake.
pub type HandshakeResult<S> = std::result::Result<Established<S>, Rejected<S>>;

/// Unwraps a step result or hands the channel back with the error.
macro_rules! or_reject {
    ($step:expr, $channel:ident) => {{
        let step = $step;
        match step {
            Ok(value) => value,
            Err(e) => return Err(Rejected::new(e, $channel)),
        }
    }};
}

async fn next_line<St>(channel: &mut St, what: &str) -> Result<String>
where
    St: Stream<Item = Result<String>> + Unpin,
{
    match channel.next().await {
        Some(Ok(line)) => Ok(line),
        Some(Err(e)) => Err(e.into_handshake_failure(format!("{} unreadable", what))),
        None => Err(ProtocolError::handshake(format!(
            "connection closed before {}",
            what
        ))),
    }
}

/// Server side of the handshake.
pub struct ServerHandshake<'a, D: ?Sized> {
    private_key: &'a RsaPrivateKey,
    directory: &'a D,
    options: SessionOptions,
    phase: HandshakePhase,
}

impl<'a, D> ServerHandshake<'a, D>
where
    D: UserDirectory + ?Sized,
{
    /// Creates a server handshake using the server's private key and the
    /// directory of registered users.
    pub fn new(private_key: &'a RsaPrivateKey, directory: &'a D, options: SessionOptions) -> Self {
        Self {
            private_key,
            directory,
            options,
            phase: HandshakePhase::Start,
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    fn transition(&mut self, phase: HandshakePhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "Server handshake transition");
        self.phase = phase;
    }

    /// Runs the handshake over `raw`.
    ///
    /// On failure the raw channel comes back inside the [`Rejected`].
    pub async fn execute<S>(&mut self, raw: RawChannel<S>) -> HandshakeResult<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.run(raw).await {
            Ok(established) => {
                self.transition(HandshakePhase::Established);
                Ok(established)
            }
            Err(mut rejected) => {
                rejected.error = rejected
                    .error
                    .into_handshake_failure("server handshake aborted");
                tracing::info!(phase = ?self.phase, error = %rejected.error, "Handshake failed");
                self.phase = HandshakePhase::Failed;
                Err(rejected)
            }
        }
    }

    async fn run<S>(&mut self, raw: RawChannel<S>) -> HandshakeResult<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(HandshakePhase::AwaitingClientAuth);
        let cryptor = RsaCryptor::decrypt_only(self.private_key.clone());
        let mut channel = upgrade(raw, cryptor, BrokenMessagePolicy::Fail);

        let line = or_reject!(next_line(&mut channel, "message 1").await, channel);
        let auth = or_reject!(Authenticate::parse(&line), channel);
        let public_key = or_reject!(
            self.directory.lookup(&auth.username).ok_or_else(|| {
                ProtocolError::handshake(format!("unknown user {:?}", auth.username))
            }),
            channel
        );
        tracing::debug!(
            username = %auth.username,
            key = %fingerprint(&public_key),
            "Client claims identity"
        );

        let server_challenge = Challenge::generate();
        let session = SessionKey::generate();
        let reply = ServerOk {
            client_challenge: auth.challenge,
            server_challenge: server_challenge.clone(),
            session: session.clone(),
        };

        let envelope = RsaCryptor::new(public_key, self.private_key.clone());
        let mut channel = channel.map_codec(|codec| codec.with_cryptor(envelope));
        or_reject!(channel.send(reply.to_string()).await, channel);
        self.transition(HandshakePhase::SentServerOk);

        let symmetric = self.options.cryptor(&session, Role::Responder);
        let mut channel = channel.map_codec(|codec| codec.with_cryptor(symmetric));

        let line = or_reject!(next_line(&mut channel, "message 3").await, channel);
        let echoed = or_reject!(
            Challenge::from_base64(&line)
                .map_err(|e| e.into_handshake_failure("unreadable server challenge")),
            channel
        );
        if echoed != server_challenge {
            let err = ProtocolError::handshake("server challenge mismatch");
            return Err(Rejected::new(err, channel));
        }

        channel
            .codec_mut()
            .set_policy(self.options.broken_message_policy);
        tracing::info!(username = %auth.username, "Client authenticated");

        Ok(Established {
            channel,
            username: auth.username,
        })
    }
}

impl<D: ?Sized> std::fmt::Debug for ServerHandshake<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("phase", &self.phase)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Client side of the handshake.
pub struct ClientHandshake<'a> {
    username: String,
    private_key: &'a RsaPrivateKey,
    server_key: &'a RsaPublicKey,
    options: SessionOptions,
    phase: HandshakePhase,
}

impl<'a> ClientHandshake<'a> {
    /// Creates a client handshake for `username`.
    ///
    /// Fails with [`ProtocolError::InvalidArgument`] if the username cannot be
    /// carried in message 1.
    pub fn new(
        username: impl Into<String>,
        private_key: &'a RsaPrivateKey,
        server_key: &'a RsaPublicKey,
        options: SessionOptions,
    ) -> Result<Self> {
        let username = username.into();
        validate_username(&username)?;
        Ok(Self {
            username,
            private_key,
            server_key,
            options,
            phase: HandshakePhase::Start,
        })
    }

    /// Returns the current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    fn transition(&mut self, phase: HandshakePhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "Client handshake transition");
        self.phase = phase;
    }

    /// Runs the handshake over `raw`.
    ///
    /// On failure the raw channel comes back inside the [`Rejected`].
    pub async fn execute<S>(&mut self, raw: RawChannel<S>) -> HandshakeResult<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.run(raw).await {
            Ok(established) => {
                self.transition(HandshakePhase::Established);
                Ok(established)
            }
            Err(mut rejected) => {
                rejected.error = rejected
                    .error
                    .into_handshake_failure("client handshake aborted");
                tracing::warn!(phase = ?self.phase, error = %rejected.error, "Handshake failed");
                self.phase = HandshakePhase::Failed;
                Err(rejected)
            }
        }
    }

    async fn run<S>(&mut self, raw: RawChannel<S>) -> HandshakeResult<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let challenge = Challenge::generate();
        let envelope = RsaCryptor::new(self.server_key.clone(), self.private_key.clone());
        let mut channel = upgrade(raw, envelope, BrokenMessagePolicy::Fail);

        let auth = Authenticate {
            username: self.username.clone(),
            challenge: challenge.clone(),
        };
        or_reject!(channel.send(auth.to_string()).await, channel);
        self.transition(HandshakePhase::SentClientAuth);

        self.transition(HandshakePhase::AwaitingServerOk);
        let line = or_reject!(next_line(&mut channel, "message 2").await, channel);
        let reply = or_reject!(ServerOk::parse(&line), channel);
        if reply.client_challenge != challenge {
            let err = ProtocolError::handshake("client challenge mismatch");
            return Err(Rejected::new(err, channel));
        }

        let symmetric = self.options.cryptor(&reply.session, Role::Initiator);
        let mut channel = channel.map_codec(|codec| codec.with_cryptor(symmetric));
        or_reject!(channel.send(reply.server_challenge.to_base64()).await, channel);

        channel
            .codec_mut()
            .set_policy(self.options.broken_message_policy);
        tracing::info!(username = %self.username, "Session established");

        Ok(Established {
            channel,
            username: self.username.clone(),
        })
    }
}

impl std::fmt::Debug for ClientHandshake<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("username", &self.username)
            .field("phase", &self.phase)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
