//! C4: durable session-name → `SessionRecord` map, file-locked, with a
//! consolidation pass for dead bridges, expired sessions, and stale sockets.
//! Grounded on the teacher's `src-tauri/src/oauth.rs` (`OAuthFileV2`,
//! `load_credentials_for`/`save_credentials_for`: a `HashMap<String, _>`
//! keyed by name, persisted as one JSON file and rewritten whole on every
//! change) generalized to a locked read-modify-write (the teacher's file has
//! no lock of its own; the locking here is adapted from `lock.rs`'s own
//! `with_lock` contract) and to the multi-bridge liveness model this spec
//! requires.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::McpcError;
use crate::keychain::{headers_key, KeychainStore, Namespace};
use crate::lock::with_lock;
use crate::paths::{pid_is_alive, socket_path, PathProvider};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServerDescriptor {
    #[serde(rename = "http")]
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
    },
}

impl ServerDescriptor {
    pub fn transport(&self) -> &'static str {
        match self {
            ServerDescriptor::Http { .. } => "http",
            ServerDescriptor::Stdio { .. } => "stdio",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
    /// Transient, assigned only during `consolidate`; never persisted as the
    /// resting state of a session a caller asked for.
    DeadBridge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub name: String,
    pub server: ServerDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub header_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

impl SessionRecord {
    pub fn socket_path(&self, pp: &dyn PathProvider) -> std::path::PathBuf {
        socket_path(pp, &self.name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sessions: HashMap<String, SessionRecord>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsolidateCounts {
    pub dead_bridges: u32,
    pub expired_sessions: u32,
    pub stale_sockets: u32,
}

fn registry_path(pp: &dyn PathProvider) -> std::path::PathBuf {
    crate::paths::sessions_path(pp)
}

fn read_registry(bytes: &[u8]) -> RegistryFile {
    serde_json::from_slice(bytes).unwrap_or_default()
}

fn quarantine_corrupt(path: &Path, bytes: &[u8]) {
    let ts = chrono::Utc::now().timestamp();
    let corrupt_path = path.with_file_name(format!(
        "{}.corrupt-{ts}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("sessions.json")
    ));
    let _ = std::fs::write(corrupt_path, bytes);
}

fn load_or_quarantine(path: &Path, bytes: Vec<u8>) -> RegistryFile {
    match serde_json::from_slice::<RegistryFile>(&bytes) {
        Ok(f) => f,
        Err(_) if bytes.is_empty() => RegistryFile::default(),
        Err(_) => {
            quarantine_corrupt(path, &bytes);
            RegistryFile::default()
        }
    }
}

/// Loads the full session map.
pub fn load(pp: &dyn PathProvider) -> Result<HashMap<String, SessionRecord>, McpcError> {
    let path = registry_path(pp);
    let mut result = HashMap::new();
    with_lock(&path, b"{\"sessions\":{}}", |bytes| {
        let file = load_or_quarantine(&path, bytes.clone());
        result = file.sessions;
        Ok(None)
    })?;
    Ok(result)
}

pub fn get(pp: &dyn PathProvider, name: &str) -> Result<Option<SessionRecord>, McpcError> {
    Ok(load(pp)?.remove(name))
}

/// Inserts or fully replaces the record for `name`.
pub fn save(pp: &dyn PathProvider, record: SessionRecord) -> Result<(), McpcError> {
    let path = registry_path(pp);
    with_lock(&path, b"{\"sessions\":{}}", |bytes| {
        let mut file = load_or_quarantine(&path, bytes);
        file.sessions.insert(record.name.clone(), record.clone());
        let next = serde_json::to_vec_pretty(&file).map_err(|e| McpcError::Fatal(e.to_string()))?;
        Ok(Some(next))
    })
}

/// Applies `patch` to the existing record for `name`, if any, and persists
/// the result. No-op if `name` is absent.
pub fn update(
    pp: &dyn PathProvider,
    name: &str,
    patch: impl FnOnce(&mut SessionRecord),
) -> Result<(), McpcError> {
    let path = registry_path(pp);
    with_lock(&path, b"{\"sessions\":{}}", |bytes| {
        let mut file = load_or_quarantine(&path, bytes);
        let Some(record) = file.sessions.get_mut(name) else {
            return Ok(None);
        };
        patch(record);
        let next = serde_json::to_vec_pretty(&file).map_err(|e| McpcError::Fatal(e.to_string()))?;
        Ok(Some(next))
    })
}

pub fn delete(pp: &dyn PathProvider, name: &str) -> Result<(), McpcError> {
    let path = registry_path(pp);
    with_lock(&path, b"{\"sessions\":{}}", |bytes| {
        let mut file = load_or_quarantine(&path, bytes);
        if file.sessions.remove(name).is_none() {
            return Ok(None);
        }
        let next = serde_json::to_vec_pretty(&file).map_err(|e| McpcError::Fatal(e.to_string()))?;
        Ok(Some(next))
    })
}

/// One consolidation pass: demotes dead-bridge records, clears stale
/// sockets, and (if `destructive`) purges expired sessions and their
/// keychain header bundles.
pub fn consolidate(
    pp: &dyn PathProvider,
    keychain: &dyn KeychainStore,
    destructive: bool,
) -> Result<ConsolidateCounts, McpcError> {
    let path = registry_path(pp);
    let mut counts = ConsolidateCounts::default();

    with_lock(&path, b"{\"sessions\":{}}", |bytes| {
        let mut file = load_or_quarantine(&path, bytes);
        let mut to_remove = Vec::new();

        for (name, record) in file.sessions.iter_mut() {
            if record.status != SessionStatus::Expired {
                let alive = record.pid.is_some_and(pid_is_alive);
                if !alive {
                    record.status = SessionStatus::DeadBridge;
                    record.pid = None;
                    counts.dead_bridges += 1;
                }
            }
            if destructive && record.status == SessionStatus::Expired {
                to_remove.push(name.clone());
            }
        }

        for name in &to_remove {
            file.sessions.remove(name);
            let _ = keychain.delete(Namespace::SessionHeaders, &headers_key(name));
            counts.expired_sessions += 1;
        }

        let sock_dir = crate::paths::bridges_dir(pp);
        if let Ok(entries) = std::fs::read_dir(&sock_dir) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(stem) = file_name.to_str().and_then(|s| s.strip_suffix(".sock")) else {
                    continue;
                };
                let session_name = format!("@{stem}");
                let owned_and_live = file
                    .sessions
                    .get(&session_name)
                    .is_some_and(|r| r.status != SessionStatus::DeadBridge);
                if !owned_and_live {
                    if std::fs::remove_file(entry.path()).is_ok() {
                        counts.stale_sockets += 1;
                    }
                }
            }
        }

        let next = serde_json::to_vec_pretty(&file).map_err(|e| McpcError::Fatal(e.to_string()))?;
        Ok(Some(next))
    })?;

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryKeychainStore;
    use crate::paths::TempPathProvider;

    fn sample(name: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            name: name.to_string(),
            server: ServerDescriptor::Http {
                url: "https://mcp.example.com".to_string(),
                headers: None,
                timeout_seconds: None,
            },
            pid: Some(std::process::id()),
            profile_name: Some("default".to_string()),
            header_count: 0,
            created_at: now,
            last_seen_at: now,
            status: SessionStatus::Active,
            protocol_version: None,
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let pp = TempPathProvider::new("registry-roundtrip");
        save(&pp, sample("@x")).unwrap();
        let loaded = get(&pp, "@x").unwrap().unwrap();
        assert_eq!(loaded.name, "@x");
        assert_eq!(loaded.status, SessionStatus::Active);
    }

    #[test]
    fn save_load_save_is_byte_identical() {
        let pp = TempPathProvider::new("registry-idempotent");
        save(&pp, sample("@x")).unwrap();
        let path = registry_path(&pp);
        let first = std::fs::read(&path).unwrap();
        let loaded = get(&pp, "@x").unwrap().unwrap();
        save(&pp, loaded).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn update_patches_existing_record_only() {
        let pp = TempPathProvider::new("registry-update");
        save(&pp, sample("@x")).unwrap();
        update(&pp, "@x", |r| r.status = SessionStatus::Expired).unwrap();
        update(&pp, "@missing", |r| r.status = SessionStatus::Expired).unwrap();
        assert_eq!(get(&pp, "@x").unwrap().unwrap().status, SessionStatus::Expired);
        assert!(get(&pp, "@missing").unwrap().is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let pp = TempPathProvider::new("registry-delete");
        save(&pp, sample("@x")).unwrap();
        delete(&pp, "@x").unwrap();
        delete(&pp, "@x").unwrap();
        assert!(get(&pp, "@x").unwrap().is_none());
    }

    #[test]
    fn consolidate_marks_dead_bridge_when_pid_not_alive() {
        let pp = TempPathProvider::new("registry-consolidate-dead");
        let keychain = MemoryKeychainStore::new();
        let mut rec = sample("@x");
        rec.pid = Some(u32::MAX - 1);
        save(&pp, rec).unwrap();
        let counts = consolidate(&pp, &keychain, false).unwrap();
        assert_eq!(counts.dead_bridges, 1);
        let after = get(&pp, "@x").unwrap().unwrap();
        assert_eq!(after.status, SessionStatus::DeadBridge);
        assert!(after.pid.is_none());
    }

    #[test]
    fn consolidate_destructive_purges_expired_and_headers() {
        let pp = TempPathProvider::new("registry-consolidate-destructive");
        let keychain = MemoryKeychainStore::new();
        keychain.put(Namespace::SessionHeaders, &headers_key("@x"), "{}").unwrap();
        let mut rec = sample("@x");
        rec.status = SessionStatus::Expired;
        save(&pp, rec).unwrap();
        let counts = consolidate(&pp, &keychain, true).unwrap();
        assert_eq!(counts.expired_sessions, 1);
        assert!(get(&pp, "@x").unwrap().is_none());
        assert!(keychain.get(Namespace::SessionHeaders, &headers_key("@x")).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_quarantined_and_treated_as_empty() {
        let pp = TempPathProvider::new("registry-corrupt");
        let path = registry_path(&pp);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();
        let loaded = load(&pp).unwrap();
        assert!(loaded.is_empty());
        let dir = path.parent().unwrap();
        let has_corrupt = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(has_corrupt);
    }
}
