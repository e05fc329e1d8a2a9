//! Key files.
//!
//! RSA keys are PEM files: private keys as PKCS#8 (PKCS#1 is also read),
//! public keys as SubjectPublicKeyInfo (PKCS#1 is also read). The server's
//! user directory is a folder of `<username>.pub.pem` files. The shared secret
//! for private messages is a hex string.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use protocol::{fingerprint, private_key_from_pem, public_key_from_pem, ProtocolError, SharedSecret};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

/// File name suffix of public keys in the user directory.
pub const PUBLIC_KEY_SUFFIX: &str = ".pub.pem";

/// Smallest key size able to carry handshake message 2 under OAEP-SHA-256.
pub const MIN_KEY_BITS: usize = 2048;

/// Default size of generated keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Length of generated shared secrets in bytes.
pub const SECRET_LENGTH: usize = 32;

/// Errors reading or writing key files.
#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid key in {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: ProtocolError,
    },

    #[error("key size must be at least 2048 bits, got {0}")]
    KeyTooSmall(usize),

    #[error("key generation failed: {0}")]
    Generation(String),

    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),
}

fn read(path: &Path) -> Result<String, KeyFileError> {
    fs::read_to_string(path).map_err(|source| KeyFileError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), KeyFileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| KeyFileError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, contents).map_err(|source| KeyFileError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn invalid(path: &Path) -> impl FnOnce(ProtocolError) -> KeyFileError + '_ {
    move |source| KeyFileError::Invalid {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads an RSA private key.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, KeyFileError> {
    private_key_from_pem(&read(path)?).map_err(invalid(path))
}

/// Reads an RSA public key.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, KeyFileError> {
    public_key_from_pem(&read(path)?).map_err(invalid(path))
}

/// Reads a hex-encoded shared secret.
pub fn load_shared_secret(path: &Path) -> Result<SharedSecret, KeyFileError> {
    SharedSecret::from_hex(&read(path)?).map_err(invalid(path))
}

/// Reads every `<username>.pub.pem` in `dir`.
///
/// Files with other names are ignored; an unreadable key file fails the whole
/// load so a broken directory is noticed at startup.
pub fn load_user_keys(dir: &Path) -> Result<HashMap<String, RsaPublicKey>, KeyFileError> {
    let entries = fs::read_dir(dir).map_err(|source| KeyFileError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut users = HashMap::new();
    for entry in entries {
        let entry = entry.map_err(|source| KeyFileError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let Some(username) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(PUBLIC_KEY_SUFFIX))
        else {
            continue;
        };
        if protocol::validate_username(username).is_err() {
            tracing::warn!(path = %path.display(), "Skipping key file with invalid username");
            continue;
        }

        let key = load_public_key(&path)?;
        tracing::debug!(username, key = %fingerprint(&key), "Loaded user key");
        users.insert(username.to_string(), key);
    }

    Ok(users)
}

/// Paths written by [`generate_key_pair`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairFiles {
    /// The private key (`<name>.pem`).
    pub private_key: PathBuf,
    /// The public key (`<name>.pub.pem`).
    pub public_key: PathBuf,
}

/// Generates an RSA key pair and writes it to `dir`.
///
/// Existing files are never overwritten.
pub fn generate_key_pair(dir: &Path, name: &str, bits: usize) -> Result<KeyPairFiles, KeyFileError> {
    if bits < MIN_KEY_BITS {
        return Err(KeyFileError::KeyTooSmall(bits));
    }

    let files = KeyPairFiles {
        private_key: dir.join(format!("{}.pem", name)),
        public_key: dir.join(format!("{}{}", name, PUBLIC_KEY_SUFFIX)),
    };
    for path in [&files.private_key, &files.public_key] {
        if path.exists() {
            return Err(KeyFileError::AlreadyExists(path.clone()));
        }
    }

    let private = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| KeyFileError::Generation(e.to_string()))?;
    let public = RsaPublicKey::from(&private);

    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeyFileError::Generation(e.to_string()))?;
    let public_pem = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyFileError::Generation(e.to_string()))?;

    write(&files.private_key, &private_pem)?;
    write(&files.public_key, &public_pem)?;

    tracing::info!(
        name,
        key = %fingerprint(&public),
        path = %files.private_key.display(),
        "Generated key pair"
    );
    Ok(files)
}

/// Generates a random shared secret and writes it hex-encoded to `path`.
pub fn generate_shared_secret(path: &Path) -> Result<(), KeyFileError> {
    if path.exists() {
        return Err(KeyFileError::AlreadyExists(path.to_path_buf()));
    }
    let mut secret = [0u8; SECRET_LENGTH];
    OsRng.fill_bytes(&mut secret);
    write(path, &format!("{}\n", hex::encode(secret)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_and_load_key_pair() {
        let dir = TempDir::new().unwrap();
        let files = generate_key_pair(dir.path(), "alice", 2048).unwrap();

        assert!(files.public_key.ends_with("alice.pub.pem"));
        let private = load_private_key(&files.private_key).unwrap();
        let public = load_public_key(&files.public_key).unwrap();
        assert_eq!(RsaPublicKey::from(&private), public);
    }

    #[test]
    fn test_generate_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bob.pem"), "keep me").unwrap();

        let err = generate_key_pair(dir.path(), "bob", 2048).unwrap_err();
        assert!(matches!(err, KeyFileError::AlreadyExists(_)));
        assert_eq!(fs::read_to_string(dir.path().join("bob.pem")).unwrap(), "keep me");
    }

    #[test]
    fn test_generate_rejects_small_keys() {
        let dir = TempDir::new().unwrap();
        let err = generate_key_pair(dir.path(), "tiny", 1024).unwrap_err();
        assert!(matches!(err, KeyFileError::KeyTooSmall(1024)));
    }

    #[test]
    fn test_load_user_keys() {
        let dir = TempDir::new().unwrap();
        generate_key_pair(dir.path(), "carol", 2048).unwrap();
        fs::write(dir.path().join("README.txt"), "not a key").unwrap();

        let users = load_user_keys(dir.path()).unwrap();
        assert_eq!(users.len(), 1);
        assert!(users.contains_key("carol"));
    }

    #[test]
    fn test_load_user_keys_fails_on_broken_key() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dave.pub.pem"), "garbage").unwrap();

        let err = load_user_keys(dir.path()).unwrap_err();
        assert!(matches!(err, KeyFileError::Invalid { .. }));
        assert!(err.to_string().contains("dave.pub.pem"));
    }

    #[test]
    fn test_missing_key_file() {
        let err = load_private_key(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(matches!(err, KeyFileError::Read { .. }));
    }

    #[test]
    fn test_shared_secret_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.hex");
        generate_shared_secret(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().len(), SECRET_LENGTH * 2);
        assert!(load_shared_secret(&path).is_ok());
        assert!(generate_shared_secret(&path).is_err());
    }

    #[test]
    fn test_shared_secret_not_hex() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.hex");
        fs::write(&path, "zz top").unwrap();
        assert!(matches!(
            load_shared_secret(&path),
            Err(KeyFileError::Invalid { .. })
        ));
    }
}
