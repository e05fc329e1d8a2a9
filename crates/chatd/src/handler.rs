//! The seam between established sessions and the command layer.

use std::future::Future;
use std::net::SocketAddr;

use crate::directory::SessionId;

/// Identity of an established session, passed to every handler call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// The authenticated user.
    pub username: String,
    /// Identifier of this session in the user registry.
    pub session_id: SessionId,
    /// Remote address of the connection.
    pub peer: SocketAddr,
}

/// Handles the decrypted lines of a session.
///
/// The server calls `handle` once per incoming line, in order, and writes
/// the returned line back over the encrypted channel.
pub trait SessionHandler: Send + Sync {
    /// Processes one line, optionally producing a reply.
    fn handle(
        &self,
        context: &SessionContext,
        line: String,
    ) -> impl Future<Output = Option<String>> + Send;

    /// Called once after the session is bound to its user.
    fn on_connect(&self, context: &SessionContext) -> impl Future<Output = ()> + Send {
        let _ = context;
        async {}
    }

    /// Called once when the session ends, for whatever reason.
    fn on_disconnect(&self, context: &SessionContext) -> impl Future<Output = ()> + Send {
        let _ = context;
        async {}
    }
}

/// Diagnostic handler replying with every line it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl SessionHandler for EchoHandler {
    async fn handle(&self, context: &SessionContext, line: String) -> Option<String> {
        tracing::trace!(username = %context.username, line = %line, "Echoing line");
        Some(line)
    }

    async fn on_connect(&self, context: &SessionContext) {
        tracing::info!(username = %context.username, peer = %context.peer, "Session started");
    }

    async fn on_disconnect(&self, context: &SessionContext) {
        tracing::info!(username = %context.username, peer = %context.peer, "Session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn context() -> SessionContext {
        SessionContext {
            username: "alice".to_string(),
            session_id: Uuid::new_v4(),
            peer: SocketAddr::from(([127, 0, 0, 1], 4000)),
        }
    }

    #[tokio::test]
    async fn test_echo_handler_replies_with_line() {
        let reply = EchoHandler.handle(&context(), "!list rooms".to_string()).await;
        assert_eq!(reply.as_deref(), Some("!list rooms"));
    }

    struct Silent;

    impl SessionHandler for Silent {
        async fn handle(&self, _context: &SessionContext, _line: String) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn test_default_hooks_do_nothing() {
        let context = context();
        Silent.on_connect(&context).await;
        Silent.on_disconnect(&context).await;
        assert!(Silent.handle(&context, "x".to_string()).await.is_none());
    }
}
