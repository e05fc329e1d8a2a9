//! Client connection to a chat server.
//!
//! After the handshake the encrypted channel is split: outgoing lines go
//! through a shared sink, incoming lines are routed by a [`LineSplitter`] so
//! several request/response conversations can share the connection.

use std::net::SocketAddr;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{
    raw_channel, ClientHandshake, LineSplitter, ProtocolError, Result, SecureChannel,
    SessionOptions,
};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

type LineSink = SplitSink<SecureChannel<TcpStream>, String>;

/// Credentials a client logs in with.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    /// Registered username.
    pub username: &'a str,
    /// The user's private key.
    pub private_key: &'a RsaPrivateKey,
    /// The server's public key, known in advance.
    pub server_key: &'a RsaPublicKey,
}

/// An authenticated connection to a chat server.
pub struct ChatClient {
    sink: Mutex<LineSink>,
    splitter: LineSplitter,
    username: String,
    server_addr: SocketAddr,
}

impl ChatClient {
    /// Connects to `addr`, logs in, and starts routing incoming lines.
    ///
    /// `markers` are registered before the first line is read; lines matching
    /// none of them go to the catch-all queue.
    pub async fn connect(
        addr: &str,
        credentials: Credentials<'_>,
        options: SessionOptions,
        markers: &[&str],
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let server_addr = stream.peer_addr()?;
        tracing::debug!(server = %server_addr, username = %credentials.username, "Connected, logging in");

        let mut handshake = ClientHandshake::new(
            credentials.username,
            credentials.private_key,
            credentials.server_key,
            options,
        )?;
        let established = handshake.execute(raw_channel(stream)).await?;

        let splitter = LineSplitter::new();
        for marker in markers {
            splitter.register_prefix(marker)?;
        }
        let (sink, stream) = established.channel.split();
        splitter.start(stream)?;

        tracing::info!(server = %server_addr, username = %established.username, "Logged in");
        Ok(Self {
            sink: Mutex::new(sink),
            splitter,
            username: established.username,
            server_addr,
        })
    }

    /// Returns the logged-in username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the server's address.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Returns the splitter routing incoming lines.
    pub fn splitter(&self) -> &LineSplitter {
        &self.splitter
    }

    /// Sends one line.
    pub async fn send(&self, line: &str) -> Result<()> {
        self.sink.lock().await.send(line.to_string()).await
    }

    /// Sends `line` and waits for the next line on `marker`, prefix removed.
    ///
    /// Returns `None` if the connection ends first. Concurrent requests on
    /// the same marker receive replies in arrival order.
    pub async fn request(&self, marker: &str, line: &str) -> Result<Option<String>> {
        if !self.splitter.prefixes().iter().any(|known| known == marker) {
            return Err(ProtocolError::InvalidArgument(format!(
                "marker {:?} is not registered",
                marker
            )));
        }
        self.send(line).await?;
        self.splitter.read_line(marker).await
    }

    /// Waits for the next line claimed by no marker.
    pub async fn read_unclaimed(&self) -> Result<Option<String>> {
        self.splitter.read_unclaimed().await
    }

    /// Closes the connection and ends every queue.
    pub async fn close(&self) -> Result<()> {
        let result = self.sink.lock().await.close().await;
        self.splitter.close();
        tracing::debug!(username = %self.username, "Connection closed");
        result
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("username", &self.username)
            .field("server_addr", &self.server_addr)
            .finish_non_exhaustive()
    }
}
