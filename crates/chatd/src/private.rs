//! Direct peer-to-peer private messages.
//!
//! A private message bypasses the server: the sender connects straight to
//! the receiver, writes one HMAC-protected line and waits for one protected
//! reply. Both sides hold the same shared secret.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::integrity;
use protocol::{raw_channel, DeliveryOutcome, ProtectedMessage, ProtocolError, SharedSecret};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long either side waits for the other's line.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors sending or receiving a private message.
#[derive(Debug, Error)]
pub enum PrivateMessageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("message must be a single line")]
    MultiLine,

    #[error("peer closed the connection without replying")]
    NoReply,

    #[error("peer did not answer within {0:?}")]
    Timeout(Duration),
}

/// A message delivered to the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// The message body, `<sender>: <text>`.
    pub body: String,
    /// Whether its tag verified.
    pub authentic: bool,
    /// Where it came from.
    pub peer: SocketAddr,
}

/// Builds the body of a private message.
pub fn message_body(sender: &str, text: &str) -> String {
    format!("{}: {}", sender, text)
}

/// Sends one private message to `addr` and judges the reply.
pub async fn send_private_message(
    addr: &str,
    sender: &str,
    text: &str,
    key: &SharedSecret,
) -> Result<DeliveryOutcome, PrivateMessageError> {
    let body = message_body(sender, text);
    if body.contains(['\n', '\r']) {
        return Err(PrivateMessageError::MultiLine);
    }

    let stream = TcpStream::connect(addr).await?;
    let mut channel = raw_channel(stream);
    channel
        .send(ProtectedMessage::seal(body, key).to_string())
        .await
        .map_err(ProtocolError::from)?;

    let reply = tokio::time::timeout(EXCHANGE_TIMEOUT, channel.next())
        .await
        .map_err(|_| PrivateMessageError::Timeout(EXCHANGE_TIMEOUT))?
        .ok_or(PrivateMessageError::NoReply)?
        .map_err(ProtocolError::from)?;

    let outcome = integrity::evaluate_reply(&reply, key);
    match &outcome {
        DeliveryOutcome::Acknowledged => tracing::debug!(peer = %addr, "Private message acknowledged"),
        other => tracing::warn!(peer = %addr, outcome = ?other, "Private message not delivered intact"),
    }
    Ok(outcome)
}

/// Listens for private messages and hands them to a channel.
pub struct PrivateMessageReceiver {
    listener: TcpListener,
    key: Arc<SharedSecret>,
    delivered: mpsc::Sender<DeliveredMessage>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl PrivateMessageReceiver {
    /// Binds the receiver; delivered messages are sent to `delivered`.
    pub async fn bind(
        addr: SocketAddr,
        key: SharedSecret,
        delivered: mpsc::Sender<DeliveredMessage>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            key: Arc::new(key),
            delivered,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Returns the address the receiver listens on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns a token that stops the receiver when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown.
    pub async fn run(self) -> std::io::Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "Private message receiver listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let key = Arc::clone(&self.key);
                        let delivered = self.delivered.clone();
                        let shutdown = self.shutdown.child_token();
                        self.tasks.spawn(async move {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                result = exchange(stream, peer, &key, &delivered) => {
                                    if let Err(e) = result {
                                        tracing::warn!(peer = %peer, error = %e, "Private message exchange failed");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to accept private connection"),
                }
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Private message receiver stopped");
        Ok(())
    }
}

async fn exchange(
    stream: TcpStream,
    peer: SocketAddr,
    key: &SharedSecret,
    delivered: &mpsc::Sender<DeliveredMessage>,
) -> Result<(), PrivateMessageError> {
    let mut channel = raw_channel(stream);
    let line = tokio::time::timeout(EXCHANGE_TIMEOUT, channel.next())
        .await
        .map_err(|_| PrivateMessageError::Timeout(EXCHANGE_TIMEOUT))?
        .ok_or(PrivateMessageError::NoReply)?
        .map_err(ProtocolError::from)?;

    let received = integrity::receive(&line, key);
    if delivered
        .send(DeliveredMessage {
            body: received.message,
            authentic: received.authentic,
            peer,
        })
        .await
        .is_err()
    {
        tracing::debug!("Nobody is reading private messages anymore");
    }

    channel
        .send(received.reply.to_string())
        .await
        .map_err(ProtocolError::from)?;
    Ok(())
}
