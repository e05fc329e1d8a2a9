//! TCP chat server.
//!
//! Every accepted connection runs the server side of the handshake against
//! the user registry. Established sessions are bound to their user and their
//! lines handed to a [`SessionHandler`] until the client disconnects or the
//! server shuts down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::{raw_channel, ProtocolError, Rejected, ServerHandshake, SessionOptions};
use rsa::RsaPrivateKey;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::directory::UserRegistry;
use crate::handler::{SessionContext, SessionHandler};

/// Connection-level settings of the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerSettings {
    /// Settings of established channels.
    pub session: SessionOptions,
    /// Upper bound on the handshake, `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

struct Shared<H> {
    private_key: RsaPrivateKey,
    registry: Arc<UserRegistry>,
    handler: H,
    settings: ServerSettings,
}

/// A bound chat server.
pub struct ChatServer<H> {
    listener: TcpListener,
    shared: Arc<Shared<H>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl<H> ChatServer<H>
where
    H: SessionHandler + 'static,
{
    /// Binds the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        private_key: RsaPrivateKey,
        registry: Arc<UserRegistry>,
        handler: H,
        settings: ServerSettings,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                private_key,
                registry,
                handler,
                settings,
            }),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Returns the address the server listens on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the user registry the server authenticates against.
    pub fn registry(&self) -> Arc<UserRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Returns a token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown, then waits for open sessions to
    /// wind down.
    pub async fn run(self) -> std::io::Result<()> {
        let addr = self.listener.local_addr()?;
        tracing::info!(addr = %addr, "Chat server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Chat server received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "Accepted connection");
                            let shared = Arc::clone(&self.shared);
                            let shutdown = self.shutdown.child_token();
                            self.tasks.spawn(async move {
                                if let Err(e) = serve_connection(shared, stream, peer, shutdown).await {
                                    tracing::warn!(peer = %peer, error = %e, "Connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Chat server stopped");
        Ok(())
    }
}

async fn serve_connection<H>(
    shared: Arc<Shared<H>>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) -> protocol::Result<()>
where
    H: SessionHandler,
{
    let registry: &UserRegistry = &shared.registry;
    let mut handshake = ServerHandshake::new(&shared.private_key, registry, shared.settings.session);
    let attempt = async {
        // A rejected client gets no reply; dropping the channel closes it.
        handshake
            .execute(raw_channel(stream))
            .await
            .map_err(Rejected::into_error)
    };

    let established = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        result = with_timeout(shared.settings.handshake_timeout, attempt) => result?,
    };

    let username = established.username;
    let mut channel = established.channel;
    let session_id = registry.bind_session(&username, peer).ok_or_else(|| {
        ProtocolError::handshake(format!("user {:?} was removed during login", username))
    })?;
    let context = SessionContext {
        username,
        session_id,
        peer,
    };
    shared.handler.on_connect(&context).await;

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            next = channel.next() => match next {
                Some(Ok(line)) => {
                    if let Some(reply) = shared.handler.handle(&context, line).await {
                        if let Err(e) = channel.send(reply).await {
                            break Err(e);
                        }
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        }
    };

    if channel.codec().dropped_lines() > 0 {
        tracing::warn!(
            username = %context.username,
            dropped = channel.codec().dropped_lines(),
            "Session dropped undecryptable lines"
        );
    }
    registry.release_session(&context.username, context.session_id);
    shared.handler.on_disconnect(&context).await;
    result
}

async fn with_timeout<F, T>(limit: Option<Duration>, future: F) -> protocol::Result<T>
where
    F: std::future::Future<Output = protocol::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| {
            ProtocolError::handshake("client did not complete the handshake in time")
        })?,
        None => future.await,
    }
}
