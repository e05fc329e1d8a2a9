//! # Chatline Protocol Library
//!
//! This crate provides the security and framing substrate of the Chatline
//! chat system: an authenticated, encrypted, line-oriented protocol over any
//! async byte stream.
//!
//! ## Overview
//!
//! - **Handshake**: three-message challenge-response protocol that
//!   authenticates a client against a directory of registered RSA keys and
//!   negotiates an AES-256 session key
//! - **Encrypted Channel**: codec decorator that encrypts every line
//! - **Line Splitter**: demultiplexes one line stream into per-marker queues
//! - **Integrity**: HMAC tags for peer-to-peer private messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Application command lines        │  LineSplitter (per-marker queues)
//! ├─────────────────────────────────────────┤
//! │           Encrypted Channel             │  AES-256-CTR, base64 per line
//! ├─────────────────────────────────────────┤
//! │              Handshake                  │  RSA-OAEP, challenges
//! ├─────────────────────────────────────────┤
//! │          Line framing (TCP)             │  newline-delimited UTF-8
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```ignore
//! use protocol::{raw_channel, ClientHandshake, LineSplitter, SessionOptions};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:10110").await?;
//! let mut handshake = ClientHandshake::new("alice", &private_key, &server_key, SessionOptions::default())?;
//! let established = handshake.execute(raw_channel(stream)).await?;
//!
//! let (sink, stream) = established.channel.split();
//! let splitter = LineSplitter::new();
//! splitter.register_prefix("!list")?;
//! splitter.start(stream)?;
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: RSA key parsing, challenges and session key material
//! - [`cryptor`]: RSA and AES line cryptors
//! - [`codec`]: raw and encrypted line channels
//! - [`messages`]: handshake wire messages
//! - [`handshake`]: client and server handshake state machines
//! - [`multiplexer`]: marker-based line splitter
//! - [`integrity`]: HMAC private message protection
//! - [`error`]: Error types

pub mod codec;
pub mod crypto;
pub mod cryptor;
pub mod error;
pub mod handshake;
pub mod integrity;
pub mod messages;
pub mod multiplexer;

pub use codec::{
    raw_channel, upgrade, BrokenMessagePolicy, CryptoLineCodec, RawChannel, SecureChannel,
    MAX_LINE_LENGTH,
};
pub use crypto::{fingerprint, private_key_from_pem, public_key_from_pem, Challenge, SessionKey};
pub use cryptor::{
    AesCtrCryptor, Cryptor, KeystreamMode, Role, RsaCryptor, DEFAULT_MAX_LINES_PER_KEY,
};
pub use error::{ProtocolError, Result};
pub use handshake::{
    ClientHandshake, Established, HandshakePhase, HandshakeResult, Rejected, ServerHandshake,
    SessionOptions, UserDirectory,
};
pub use integrity::{DeliveryOutcome, ProtectedMessage, Reply, SharedSecret};
pub use messages::{validate_username, Authenticate, ServerOk};
pub use multiplexer::LineSplitter;
