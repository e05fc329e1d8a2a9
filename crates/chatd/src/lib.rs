//! # Chatline Daemon Library
//!
//! Network endpoints of the Chatline chat system, built on the `protocol`
//! crate.
//!
//! ## Overview
//!
//! - **Chat Server**: authenticates clients against a directory of registered
//!   public keys and hands their decrypted lines to a [`SessionHandler`]
//! - **Chat Client**: logs in and multiplexes replies by marker
//! - **Private Messages**: direct HMAC-protected peer messages
//! - **Configuration and Keys**: TOML configuration and PEM key files
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   handshake + AES lines   ┌───────────────────────┐
//! │  ChatClient  │ ◄───────────────────────► │      ChatServer       │
//! │ LineSplitter │                           │ UserRegistry, Handler │
//! └──────────────┘                           └───────────────────────┘
//!
//! ┌──────────────┐   <hmac> <sender>: <text>  ┌───────────────────────┐
//! │    sender    │ ─────────────────────────► │ PrivateMessageReceiver│
//! │              │ ◄───────────────────────── │                       │
//! └──────────────┘        <hmac> !ack         └───────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod directory;
pub mod handler;
pub mod keystore;
pub mod private;
pub mod server;

pub use client::{ChatClient, Credentials};
pub use config::{Config, ConfigError};
pub use directory::{SessionBinding, SessionId, UserRegistry};
pub use handler::{EchoHandler, SessionContext, SessionHandler};
pub use keystore::KeyFileError;
pub use private::{send_private_message, DeliveredMessage, PrivateMessageError, PrivateMessageReceiver};
pub use server::{ChatServer, ServerSettings};

// Re-export the protocol crate for convenience
pub use protocol;
