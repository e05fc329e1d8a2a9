//! Registered users and their live sessions.
//!
//! The registry is the server's user directory: it maps usernames to the
//! public keys provisioned out of band and records which connection currently
//! owns each user. A user has at most one session; a second login replaces
//! the first binding.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::SystemTime;

use dashmap::DashMap;
use protocol::{fingerprint, UserDirectory};
use rsa::RsaPublicKey;
use uuid::Uuid;

use crate::keystore::{self, KeyFileError};

/// Unique identifier of an established session.
pub type SessionId = Uuid;

/// The connection currently owning a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    /// Session identifier.
    pub id: SessionId,
    /// Remote address of the connection.
    pub peer: SocketAddr,
    /// When the session was established.
    pub since: SystemTime,
}

#[derive(Debug, Clone)]
struct UserRecord {
    public_key: RsaPublicKey,
    session: Option<SessionBinding>,
}

/// Thread-safe user directory with session ownership.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: DashMap<String, UserRecord>,
}

impl UserRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry from username/key pairs.
    pub fn from_keys(keys: HashMap<String, RsaPublicKey>) -> Self {
        let registry = Self::new();
        for (username, key) in keys {
            registry.register(username, key);
        }
        registry
    }

    /// Loads every `<username>.pub.pem` in `dir`.
    pub fn load(dir: &Path) -> Result<Self, KeyFileError> {
        let registry = Self::from_keys(keystore::load_user_keys(dir)?);
        tracing::info!(users = registry.len(), dir = %dir.display(), "Loaded user directory");
        Ok(registry)
    }

    /// Registers or replaces a user's key, returning the previous key.
    ///
    /// A live session of the user is kept.
    pub fn register(&self, username: impl Into<String>, public_key: RsaPublicKey) -> Option<RsaPublicKey> {
        let username = username.into();
        tracing::debug!(username = %username, key = %fingerprint(&public_key), "Registering user");

        match self.users.get_mut(&username) {
            Some(mut record) => Some(std::mem::replace(&mut record.public_key, public_key)),
            None => {
                self.users.insert(
                    username,
                    UserRecord {
                        public_key,
                        session: None,
                    },
                );
                None
            }
        }
    }

    /// Returns the number of registered users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Returns whether no user is registered.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Returns whether `username` is registered.
    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Marks a new session as owner of `username`.
    ///
    /// Returns `None` if the user is not registered.
    pub fn bind_session(&self, username: &str, peer: SocketAddr) -> Option<SessionId> {
        let mut record = self.users.get_mut(username)?;
        let binding = SessionBinding {
            id: Uuid::new_v4(),
            peer,
            since: SystemTime::now(),
        };
        let id = binding.id;

        if let Some(previous) = record.session.replace(binding) {
            tracing::info!(
                username,
                previous = %previous.peer,
                peer = %peer,
                "User logged in again, replacing session"
            );
        }
        Some(id)
    }

    /// Releases the binding of `username` if it still belongs to `id`.
    ///
    /// Returns whether a binding was removed.
    pub fn release_session(&self, username: &str, id: SessionId) -> bool {
        let Some(mut record) = self.users.get_mut(username) else {
            return false;
        };
        if record.session.as_ref().is_some_and(|binding| binding.id == id) {
            record.session = None;
            return true;
        }
        false
    }

    /// Returns the current session of `username`.
    pub fn session_of(&self, username: &str) -> Option<SessionBinding> {
        self.users
            .get(username)
            .and_then(|record| record.session.clone())
    }

    /// Returns the users with a live session, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let mut online: Vec<String> = self
            .users
            .iter()
            .filter(|entry| entry.session.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        online.sort();
        online
    }
}

impl UserDirectory for UserRegistry {
    fn lookup(&self, username: &str) -> Option<RsaPublicKey> {
        self.users
            .get(username)
            .map(|record| record.public_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    fn key() -> RsaPublicKey {
        static KEY: OnceLock<RsaPublicKey> = OnceLock::new();
        KEY.get_or_init(|| {
            let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
            RsaPublicKey::from(&private)
        })
        .clone()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_lookup() {
        let registry = UserRegistry::new();
        registry.register("alice", key());

        assert_eq!(registry.lookup("alice"), Some(key()));
        assert!(registry.lookup("bob").is_none());
        assert!(registry.contains("alice"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bind_unknown_user() {
        let registry = UserRegistry::new();
        assert!(registry.bind_session("ghost", addr(1)).is_none());
    }

    #[test]
    fn test_bind_and_release() {
        let registry = UserRegistry::new();
        registry.register("alice", key());

        let id = registry.bind_session("alice", addr(1)).unwrap();
        assert_eq!(registry.session_of("alice").unwrap().id, id);
        assert_eq!(registry.online_users(), vec!["alice"]);

        assert!(registry.release_session("alice", id));
        assert!(registry.session_of("alice").is_none());
        assert!(!registry.release_session("alice", id));
    }

    #[test]
    fn test_second_login_replaces_binding() {
        let registry = UserRegistry::new();
        registry.register("alice", key());

        let first = registry.bind_session("alice", addr(1)).unwrap();
        let second = registry.bind_session("alice", addr(2)).unwrap();
        assert_ne!(first, second);

        // The stale session ending does not log out the new one.
        assert!(!registry.release_session("alice", first));
        let binding = registry.session_of("alice").unwrap();
        assert_eq!(binding.id, second);
        assert_eq!(binding.peer, addr(2));
    }

    #[test]
    fn test_register_replaces_key_keeps_session() {
        let registry = UserRegistry::new();
        registry.register("alice", key());
        let id = registry.bind_session("alice", addr(1)).unwrap();

        assert!(registry.register("alice", key()).is_some());
        assert_eq!(registry.session_of("alice").unwrap().id, id);
    }

    #[test]
    fn test_works_as_user_directory_behind_arc() {
        let registry = std::sync::Arc::new(UserRegistry::from_keys(HashMap::from([(
            "carol".to_string(),
            key(),
        )])));
        let directory: &dyn UserDirectory = &registry;
        assert!(directory.lookup("carol").is_some());
    }
}
