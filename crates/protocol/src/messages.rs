//! Wire messages of the handshake.
//!
//! Every message is a single line of space-separated tokens. Parsing splits on
//! a single space and requires the exact token count, so stray or doubled
//! separators are rejected rather than tolerated.

use std::fmt;

use crate::crypto::{Challenge, SessionKey};
use crate::error::{ProtocolError, Result};

/// Command token opening message 1.
pub const AUTHENTICATE: &str = "!authenticate";

/// Command token opening message 2.
pub const SERVER_OK: &str = "!ok";

/// Checks that a username can be carried in a space-separated message.
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(ProtocolError::InvalidArgument(
            "username must not be empty".to_string(),
        ));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(ProtocolError::InvalidArgument(format!(
            "username {:?} contains whitespace",
            username
        )));
    }
    Ok(())
}

fn tokens<'a, const N: usize>(line: &'a str, command: &str) -> Result<[&'a str; N]> {
    let parts: Vec<&str> = line.split(' ').collect();
    let count = parts.len();
    let parts: [&str; N] = parts.try_into().map_err(|_| {
        ProtocolError::handshake(format!(
            "{} expects {} tokens, got {}",
            command, N, count
        ))
    })?;
    if parts[0] != command {
        return Err(ProtocolError::handshake(format!(
            "expected {}, got another command",
            command
        )));
    }
    Ok(parts)
}

/// Message 1: `!authenticate <username> <client-challenge-b64>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    /// Who the client claims to be.
    pub username: String,
    /// Fresh client challenge.
    pub challenge: Challenge,
}

impl Authenticate {
    /// Parses the decrypted body of message 1.
    pub fn parse(line: &str) -> Result<Self> {
        let [_, username, challenge] = tokens::<3>(line, AUTHENTICATE)?;
        validate_username(username).map_err(|e| e.into_handshake_failure("invalid username"))?;
        let challenge = Challenge::from_base64(challenge)
            .map_err(|e| e.into_handshake_failure("unreadable client challenge"))?;

        Ok(Self {
            username: username.to_string(),
            challenge,
        })
    }
}

impl fmt::Display for Authenticate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            AUTHENTICATE,
            self.username,
            self.challenge.to_base64()
        )
    }
}

/// Message 2: `!ok <client-challenge> <server-challenge> <aes-key> <iv>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOk {
    /// The client challenge, echoed back.
    pub client_challenge: Challenge,
    /// Fresh server challenge.
    pub server_challenge: Challenge,
    /// Session key material for the symmetric channel.
    pub session: SessionKey,
}

impl ServerOk {
    /// Parses the decrypted body of message 2.
    pub fn parse(line: &str) -> Result<Self> {
        let [_, client, server, key, iv] = tokens::<5>(line, SERVER_OK)?;
        let client_challenge = Challenge::from_base64(client)
            .map_err(|e| e.into_handshake_failure("unreadable echoed challenge"))?;
        let server_challenge = Challenge::from_base64(server)
            .map_err(|e| e.into_handshake_failure("unreadable server challenge"))?;
        let session = SessionKey::from_base64(key, iv)
            .map_err(|e| e.into_handshake_failure("unreadable session key"))?;

        Ok(Self {
            client_challenge,
            server_challenge,
            session,
        })
    }
}

impl fmt::Display for ServerOk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (key, iv) = self.session.to_base64();
        write!(
            f,
            "{} {} {} {} {}",
            SERVER_OK,
            self.client_challenge.to_base64(),
            self.server_challenge.to_base64(),
            key,
            iv
        )
    }
}
