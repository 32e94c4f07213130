//! OAuth profile metadata, persisted separately from secrets (§3). Mirrors
//! `registry.rs`'s locked-JSON-map shape over `profiles.json` rather than
//! `sessions.json`; kept as its own module because profile lifetime
//! (created by `login`, removed only by `logout`) is independent of any
//! session's.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::McpcError;
use crate::keychain::{client_key, tokens_key, KeychainStore, Namespace};
use crate::lock::with_lock;
use crate::paths::{profiles_path, PathProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    pub name: String,
    pub server_url: String,
    pub oauth_issuer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub authenticated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    profiles: HashMap<String, AuthProfile>,
}

fn load_or_default(path: &Path, bytes: Vec<u8>) -> ProfilesFile {
    match serde_json::from_slice::<ProfilesFile>(&bytes) {
        Ok(f) => f,
        Err(_) if bytes.is_empty() => ProfilesFile::default(),
        Err(_) => {
            let ts = chrono::Utc::now().timestamp();
            let corrupt_path = path.with_file_name(format!(
                "{}.corrupt-{ts}",
                path.file_name().and_then(|n| n.to_str()).unwrap_or("profiles.json")
            ));
            let _ = std::fs::write(corrupt_path, &bytes);
            ProfilesFile::default()
        }
    }
}

pub fn load(pp: &dyn PathProvider) -> Result<HashMap<String, AuthProfile>, McpcError> {
    let path = profiles_path(pp);
    let mut result = HashMap::new();
    with_lock(&path, b"{\"profiles\":{}}", |bytes| {
        result = load_or_default(&path, bytes).profiles;
        Ok(None)
    })?;
    Ok(result)
}

pub fn get(pp: &dyn PathProvider, name: &str) -> Result<Option<AuthProfile>, McpcError> {
    Ok(load(pp)?.remove(name))
}

/// Persists `profile` metadata; the caller is responsible for writing
/// `refreshToken`/`clientId` into the keychain separately (§3 invariant: no
/// token material in this record).
pub fn save(pp: &dyn PathProvider, profile: AuthProfile) -> Result<(), McpcError> {
    let path = profiles_path(pp);
    with_lock(&path, b"{\"profiles\":{}}", |bytes| {
        let mut file = load_or_default(&path, bytes);
        file.profiles.insert(profile.name.clone(), profile.clone());
        let next = serde_json::to_vec_pretty(&file).map_err(|e| McpcError::Fatal(e.to_string()))?;
        Ok(Some(next))
    })
}

/// Removes the profile record and its keychain-held tokens/client
/// registration. Idempotent.
pub fn remove(
    pp: &dyn PathProvider,
    keychain: &dyn KeychainStore,
    host: &str,
    name: &str,
) -> Result<(), McpcError> {
    let path = profiles_path(pp);
    with_lock(&path, b"{\"profiles\":{}}", |bytes| {
        let mut file = load_or_default(&path, bytes);
        if file.profiles.remove(name).is_none() {
            return Ok(None);
        }
        let next = serde_json::to_vec_pretty(&file).map_err(|e| McpcError::Fatal(e.to_string()))?;
        Ok(Some(next))
    })?;
    let _ = keychain.delete(Namespace::AuthTokens, &tokens_key(host, name));
    let _ = keychain.delete(Namespace::AuthClient, &client_key(host, name));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryKeychainStore;
    use crate::paths::TempPathProvider;

    fn sample(name: &str) -> AuthProfile {
        let now = Utc::now();
        AuthProfile {
            name: name.to_string(),
            server_url: "https://mcp.example.com".to_string(),
            oauth_issuer: "https://auth.example.com".to_string(),
            scopes: Some(vec!["mcp".to_string()]),
            created_at: now,
            authenticated_at: now,
            refreshed_at: None,
        }
    }

    #[test]
    fn save_then_get_roundtrips() {
        let pp = TempPathProvider::new("profile-roundtrip");
        save(&pp, sample("default")).unwrap();
        let loaded = get(&pp, "default").unwrap().unwrap();
        assert_eq!(loaded.server_url, "https://mcp.example.com");
    }

    #[test]
    fn remove_clears_metadata_and_keychain() {
        let pp = TempPathProvider::new("profile-remove");
        let keychain = MemoryKeychainStore::new();
        save(&pp, sample("default")).unwrap();
        keychain.put(Namespace::AuthTokens, &tokens_key("mcp.example.com", "default"), "{}").unwrap();
        remove(&pp, &keychain, "mcp.example.com", "default").unwrap();
        assert!(get(&pp, "default").unwrap().is_none());
        assert!(keychain
            .get(Namespace::AuthTokens, &tokens_key("mcp.example.com", "default"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let pp = TempPathProvider::new("profile-remove-twice");
        let keychain = MemoryKeychainStore::new();
        save(&pp, sample("default")).unwrap();
        remove(&pp, &keychain, "mcp.example.com", "default").unwrap();
        remove(&pp, &keychain, "mcp.example.com", "default").unwrap();
        assert!(get(&pp, "default").unwrap().is_none());
    }
}
