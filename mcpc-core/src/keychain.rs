//! C3: opaque key→blob secret store, namespaced for OAuth tokens, OAuth
//! client registration, and per-session header bundles (§6 key scheme).
//! Grounded on the teacher's `secrets.rs` keyring wrapper, generalized from
//! a closed `SecretNamespace` enum to the three namespaces this spec names
//! and widened to free-form keys (`auth:<host>:<profile>:tokens` etc.)
//! rather than a single identifier.

use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use keyring::{Entry, Error as KeyringError};
use rand::RngCore;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    AuthTokens,
    AuthClient,
    SessionHeaders,
}

impl Namespace {
    fn prefix(self) -> &'static str {
        match self {
            Namespace::AuthTokens => "auth-tokens",
            Namespace::AuthClient => "auth-client",
            Namespace::SessionHeaders => "session-headers",
        }
    }
}

#[derive(Debug)]
pub struct KeychainError(String);

impl fmt::Display for KeychainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for KeychainError {}

/// `get`/`put`/`delete` contract of §4.2. No caching: callers must assume a
/// peer process may have written since the last read, which is exactly what
/// lets token rotation propagate across bridges (§5).
pub trait KeychainStore: Send + Sync {
    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<String>, KeychainError>;
    fn put(&self, namespace: Namespace, key: &str, value: &str) -> Result<(), KeychainError>;
    fn delete(&self, namespace: Namespace, key: &str) -> Result<(), KeychainError>;
}

/// Canonicalize a host for the `auth:<canonical-host>:...` key scheme:
/// strip scheme, default ports, and trailing slash.
pub fn canonical_host(url: &str) -> String {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let host_and_port = without_scheme
        .split_once('/')
        .map(|(h, _)| h)
        .unwrap_or(without_scheme);
    let is_https = url.starts_with("https://");
    match host_and_port.rsplit_once(':') {
        Some((host, port)) if (port == "443" && is_https) || (port == "80" && !is_https) => {
            host.to_string()
        }
        _ => host_and_port.trim_end_matches('/').to_string(),
    }
}

pub fn tokens_key(host: &str, profile: &str) -> String {
    format!("auth:{host}:{profile}:tokens")
}

pub fn client_key(host: &str, profile: &str) -> String {
    format!("auth:{host}:{profile}:client")
}

pub fn headers_key(session_name: &str) -> String {
    format!("session:{session_name}:headers")
}

/// Production store backed by the OS keyring, falling back to an encrypted
/// file under the home directory when no OS keyring is present (§4.2).
/// The fallback is AES-256-GCM: a per-installation master key generated on
/// first use and kept separate from each secret's own file, so reading the
/// fallback directory alone (a backup, a stray `tar`) doesn't hand over
/// plaintext tokens.
#[derive(Clone)]
pub struct OsKeychainStore {
    service: String,
    fallback_dir: std::path::PathBuf,
}

impl OsKeychainStore {
    const DEFAULT_SERVICE: &'static str = "mcpc";

    pub fn new(fallback_dir: std::path::PathBuf) -> Self {
        Self {
            service: Self::DEFAULT_SERVICE.to_string(),
            fallback_dir,
        }
    }

    fn entry(&self, username: &str) -> Result<Entry, KeychainError> {
        Entry::new(&self.service, username)
            .map_err(|e| KeychainError(format!("keyring entry `{username}`: {e}")))
    }

    fn fallback_path(&self, username: &str) -> std::path::PathBuf {
        let safe: String = username
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.fallback_dir.join("keychain").join(format!("{safe}.secret"))
    }

    fn master_key_path(&self) -> std::path::PathBuf {
        self.fallback_dir.join("keychain").join("master.key")
    }

    /// Loads the fallback-store master key, generating and persisting one on
    /// first use. Kept in its own file rather than derived from anything
    /// guessable (hostname, username) since the whole point is to survive a
    /// copy of the fallback directory landing somewhere it shouldn't.
    fn master_key(&self) -> Result<[u8; KEY_LEN], KeychainError> {
        let path = self.master_key_path();
        match std::fs::read(&path) {
            Ok(bytes) if bytes.len() == KEY_LEN => {
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&bytes);
                Ok(key)
            }
            Ok(_) => Err(KeychainError("fallback store: corrupt master key".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut key = [0u8; KEY_LEN];
                rand::rngs::OsRng.fill_bytes(&mut key);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| KeychainError(format!("fallback store: {e}")))?;
                }
                crate::lock::atomic_write(&path, &key)
                    .map_err(|e| KeychainError(format!("fallback store: {e}")))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
                }
                Ok(key)
            }
            Err(e) => Err(KeychainError(format!("fallback store: {e}"))),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm, KeychainError> {
        let key_bytes = self.master_key()?;
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Aes256Gcm::new(key))
    }

    fn fallback_write(&self, username: &str, value: &str) -> Result<(), KeychainError> {
        let path = self.fallback_path(username);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KeychainError(format!("fallback store: {e}")))?;
        }
        let cipher = self.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, value.as_bytes())
            .map_err(|e| KeychainError(format!("fallback store: encrypting: {e}")))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        crate::lock::atomic_write(&path, &blob)
            .map_err(|e| KeychainError(format!("fallback store: {e}")))
    }

    fn fallback_read(&self, username: &str) -> Result<Option<String>, KeychainError> {
        let blob = match std::fs::read(self.fallback_path(username)) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KeychainError(format!("fallback store: {e}"))),
        };
        if blob.len() < NONCE_LEN {
            return Err(KeychainError("fallback store: truncated secret".to_string()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = self.cipher()?;
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| KeychainError(format!("fallback store: decrypting: {e}")))?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|e| KeychainError(format!("fallback store: {e}")))
    }

    fn fallback_delete(&self, username: &str) -> Result<(), KeychainError> {
        match std::fs::remove_file(self.fallback_path(username)) {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    fn username(namespace: Namespace, key: &str) -> String {
        format!("{}::{}", namespace.prefix(), key)
    }
}

impl KeychainStore for OsKeychainStore {
    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<String>, KeychainError> {
        let username = Self::username(namespace, key);
        let entry = self.entry(&username)?;
        match entry.get_password() {
            Ok(v) => Ok(Some(v)),
            Err(KeyringError::NoEntry) => self.fallback_read(&username),
            Err(KeyringError::PlatformFailure(_)) | Err(KeyringError::NoStorageAccess(_)) => {
                self.fallback_read(&username)
            }
            Err(e) => Err(KeychainError(e.to_string())),
        }
    }

    fn put(&self, namespace: Namespace, key: &str, value: &str) -> Result<(), KeychainError> {
        let username = Self::username(namespace, key);
        let entry = self.entry(&username)?;
        match entry.set_password(value) {
            Ok(()) => Ok(()),
            Err(KeyringError::PlatformFailure(_)) | Err(KeyringError::NoStorageAccess(_)) => {
                self.fallback_write(&username, value)
            }
            Err(e) => Err(KeychainError(e.to_string())),
        }
    }

    fn delete(&self, namespace: Namespace, key: &str) -> Result<(), KeychainError> {
        let username = Self::username(namespace, key);
        let entry = self.entry(&username)?;
        match entry.delete_credential() {
            Ok(()) | Err(KeyringError::NoEntry) => {}
            Err(KeyringError::PlatformFailure(_)) | Err(KeyringError::NoStorageAccess(_)) => {}
            Err(e) => return Err(KeychainError(e.to_string())),
        }
        self.fallback_delete(&username)
    }
}

/// In-memory store for tests, so unit tests never touch a real OS keychain.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryKeychainStore {
    secrets: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryKeychainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl KeychainStore for MemoryKeychainStore {
    fn get(&self, namespace: Namespace, key: &str) -> Result<Option<String>, KeychainError> {
        let k = format!("{}::{}", namespace.prefix(), key);
        Ok(self.secrets.lock().unwrap().get(&k).cloned())
    }

    fn put(&self, namespace: Namespace, key: &str, value: &str) -> Result<(), KeychainError> {
        let k = format!("{}::{}", namespace.prefix(), key);
        self.secrets.lock().unwrap().insert(k, value.to_string());
        Ok(())
    }

    fn delete(&self, namespace: Namespace, key: &str) -> Result<(), KeychainError> {
        let k = format!("{}::{}", namespace.prefix(), key);
        self.secrets.lock().unwrap().remove(&k);
        Ok(())
    }
}
